use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr},
    ops::Range,
    str::FromStr,
    time::Duration,
};

use crate::DevError;

pub const DEFAULT_PORT_RANGE: Range<u16> = 20000..30000;

/// What to do when an application only listens on the container's loopback interface
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoopbackPolicy {
    Reject,
    Ignore,
    Redirect,
}

/// A user-pinned forward, parsed from `[CONTAINER:]LOCAL_PORT:CONTAINER_PORT`
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PortOverride {
    pub container: Option<String>,
    pub local_port: u16,
    pub container_port: u16,
}

impl FromStr for PortOverride {
    type Err = DevError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DevError::InvalidPortForward(s.to_owned());
        let parts: Vec<&str> = s.split(':').collect();
        let (container, local, remote) = match parts.as_slice() {
            [local, remote] => (None, *local, *remote),
            [container, local, remote] if !container.is_empty() => (Some((*container).to_owned()), *local, *remote),
            _ => return Err(invalid()),
        };
        let local_port = local.parse::<u16>().map_err(|_| invalid())?;
        let container_port = remote.parse::<u16>().map_err(|_| invalid())?;
        if local_port == 0 || container_port == 0 {
            return Err(invalid());
        }
        Ok(PortOverride {
            container,
            local_port,
            container_port,
        })
    }
}

#[derive(Clone, Debug)]
pub struct Timeouts {
    /// Deadline for individual platform calls
    pub platform: Duration,
    /// How long a new pod may take to become ready
    pub pod_ready: Duration,
    /// Budget for the whole teardown after an interrupt
    pub teardown: Duration,
    /// How long a started process may stay without a pid before it is considered failed
    pub process_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            platform: Duration::from_secs(60),
            pod_ready: Duration::from_secs(300),
            teardown: Duration::from_secs(60),
            process_grace: Duration::from_secs(10),
        }
    }
}

/// Knobs of a `dev` session, resolved from flags and preferences
#[derive(Clone, Debug)]
pub struct DevOptions {
    pub build_command: Option<String>,
    pub run_command: Option<String>,
    pub debug: bool,
    pub debug_command: Option<String>,
    pub port_overrides: Vec<PortOverride>,
    pub address: IpAddr,
    pub port_range: Range<u16>,
    pub random_ports: bool,
    pub loopback: LoopbackPolicy,
    /// Attempts made to observe the application's listening sockets after a restart
    pub loopback_probe_attempts: u32,
    pub loopback_probe_interval: Duration,
    pub watch: bool,
    pub variables: BTreeMap<String, String>,
    pub ignore_patterns: Vec<String>,
    pub api_server: bool,
    pub api_port: Option<u16>,
    pub ephemeral: bool,
    pub image_registry: Option<String>,
    pub timeouts: Timeouts,
}

impl Default for DevOptions {
    fn default() -> Self {
        DevOptions {
            build_command: None,
            run_command: None,
            debug: false,
            debug_command: None,
            port_overrides: Vec::new(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_range: DEFAULT_PORT_RANGE,
            random_ports: false,
            loopback: LoopbackPolicy::Reject,
            loopback_probe_attempts: 10,
            loopback_probe_interval: Duration::from_secs(1),
            watch: true,
            variables: BTreeMap::new(),
            ignore_patterns: Vec::new(),
            api_server: true,
            api_port: None,
            ephemeral: true,
            image_registry: None,
            timeouts: Timeouts::default(),
        }
    }
}
