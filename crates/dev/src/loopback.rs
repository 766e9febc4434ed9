//! Detects container ports that are only bound on the loopback interface
//!
//! Published ports reach the container through its external interface, so an application listening on 127.0.0.1
//! is unreachable from the host even though the forward itself succeeds.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    time::Duration,
};

use odo_core::Cancellation;
use odo_platform::{ExecRequest, PlatformClient};

use crate::DevError;

const TCP_LISTEN: &str = "0A";

/// Command printing the kernel's TCP socket tables; missing tables are not an error
pub fn probe_command() -> Vec<String> {
    vec![
        "sh".to_owned(),
        "-c".to_owned(),
        "cat /proc/net/tcp /proc/net/tcp6 2>/dev/null; true".to_owned(),
    ]
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Listener {
    pub address: IpAddr,
    pub port: u16,
}

#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct LoopbackReport {
    pub loopback_only: Vec<u16>,
    /// Ports nothing listens on yet
    pub unbound: Vec<u16>,
}

/// Listening sockets in `/proc/net/tcp` or `/proc/net/tcp6` format; other lines are skipped
pub fn parse_listeners(table: &str) -> Vec<Listener> {
    table
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[3] != TCP_LISTEN {
                return None;
            }
            let (address, port) = fields[1].split_once(':')?;
            Some(Listener {
                address: parse_address(address)?,
                port: u16::from_str_radix(port, 16).ok()?,
            })
        })
        .collect()
}

// Addresses are printed as 32-bit words in host byte order.
fn parse_address(hex: &str) -> Option<IpAddr> {
    match hex.len() {
        8 => {
            let word = u32::from_str_radix(hex, 16).ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(word.swap_bytes())))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (index, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(hex.get(index * 8..index * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.swap_bytes().to_be_bytes());
            }
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

fn is_loopback(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(address) => address.is_loopback(),
        IpAddr::V6(address) => {
            address.is_loopback() || address.to_ipv4_mapped().map(|mapped| mapped.is_loopback()).unwrap_or(false)
        }
    }
}

/// Whether every listener on `port` is bound to a loopback address
pub fn loopback_only(listeners: &[Listener], port: u16) -> bool {
    let mut bound = listeners.iter().filter(|listener| listener.port == port).peekable();
    bound.peek().is_some() && bound.all(|listener| is_loopback(&listener.address))
}

pub fn classify(listeners: &[Listener], ports: &[u16]) -> LoopbackReport {
    let mut report = LoopbackReport::default();
    for &port in ports {
        if !listeners.iter().any(|listener| listener.port == port) {
            report.unbound.push(port);
        } else if loopback_only(listeners, port) {
            report.loopback_only.push(port);
        }
    }
    report
}

/// Reads the socket tables of `container` and classifies `ports`
pub async fn probe(
    platform: &dyn PlatformClient,
    pod: &str,
    container: &str,
    ports: &[u16],
    cancel: &Cancellation,
    timeout: Duration,
) -> Result<LoopbackReport, DevError> {
    let output = cancel
        .run_with_deadline(
            timeout,
            platform.exec_in_container(ExecRequest::new(pod, container, probe_command())),
        )
        .await??;
    Ok(classify(&parse_listeners(&output.stdout_lossy()), ports))
}
