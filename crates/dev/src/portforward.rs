//! Local ports forwarded to container endpoints
//!
//! Allocation is stable: a `(container, container port)` pair keeps its local port for the life of the session.
//! On platforms that tunnel connections each forward owns a listener task; on platforms that publish ports the
//! engine does the forwarding and only the table is kept.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    net::{IpAddr, TcpListener as StdTcpListener},
    ops::Range,
    sync::Arc,
};

use futures::{prelude::*, stream::FuturesUnordered};
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use odo_devfile::{Devfile, Exposure};
use odo_platform::{ForwardingMode, PlatformClient};
use odo_session::ForwardedPort;

use crate::{events::Events, options::PortOverride, DevError};

/// Decides whether a local port can be bound
pub trait PortProbe: Send + Sync {
    fn is_free(&self, address: IpAddr, port: u16) -> bool;
}

pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_free(&self, address: IpAddr, port: u16) -> bool {
        StdTcpListener::bind((address, port)).is_ok()
    }
}

/// A container endpoint that should be reachable locally
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ForwardTarget {
    pub container: String,
    pub container_port: u16,
    pub name: Option<String>,
    pub is_debug: bool,
}

/// Endpoints to forward, in declaration order. Debug endpoints only count in debug mode.
pub fn forward_targets(devfile: &Devfile, debug: bool) -> Vec<ForwardTarget> {
    let mut targets = Vec::new();
    for (component, container) in devfile.container_components() {
        for endpoint in &container.endpoints {
            if endpoint.exposure == Exposure::None || (endpoint.is_debug() && !debug) {
                continue;
            }
            targets.push(ForwardTarget {
                container: component.name.clone(),
                container_port: endpoint.target_port,
                name: Some(endpoint.name.clone()),
                is_debug: endpoint.is_debug(),
            });
        }
    }
    targets
}

type ForwardKey = (String, u16);

struct ActiveForward {
    forward: ForwardedPort,
    task: Option<JoinHandle<()>>,
}

pub struct PortForwardManager {
    platform: Arc<dyn PlatformClient>,
    probe: Arc<dyn PortProbe>,
    address: IpAddr,
    range: Range<u16>,
    random: bool,
    overrides: Vec<PortOverride>,
    allocated: BTreeMap<ForwardKey, u16>,
    active: BTreeMap<ForwardKey, ActiveForward>,
    pod: Option<String>,
    events: Events,
}

impl PortForwardManager {
    pub fn new(
        platform: Arc<dyn PlatformClient>,
        probe: Arc<dyn PortProbe>,
        address: IpAddr,
        range: Range<u16>,
        events: Events,
    ) -> PortForwardManager {
        PortForwardManager {
            platform,
            probe,
            address,
            range,
            random: false,
            overrides: Vec::new(),
            allocated: BTreeMap::new(),
            active: BTreeMap::new(),
            pod: None,
            events,
        }
    }

    pub fn with_random_ports(mut self, random: bool) -> PortForwardManager {
        self.random = random;
        self
    }

    pub fn with_overrides(mut self, overrides: Vec<PortOverride>) -> PortForwardManager {
        self.overrides = overrides;
        self
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Chooses a local port for every target
    ///
    /// User overrides are honoured first, then ports already held by this session, then the first free port of the
    /// range (or a random starting point with `--random-ports`).
    pub fn allocate(&mut self, targets: &[ForwardTarget]) -> Result<Vec<ForwardedPort>, DevError> {
        let mut used = BTreeSet::new();
        let mut assigned: Vec<Option<u16>> = vec![None; targets.len()];

        for (slot, target) in assigned.iter_mut().zip(targets) {
            let pinned = self.overrides.iter().find(|pin| {
                pin.container_port == target.container_port
                    && pin.container.as_deref().map(|name| name == target.container).unwrap_or(true)
            });
            if let Some(pin) = pinned {
                let held = self.allocated.get(&key(target)) == Some(&pin.local_port);
                if !used.insert(pin.local_port) || (!held && !self.probe.is_free(self.address, pin.local_port)) {
                    return Err(DevError::PortUnavailable {
                        address: self.address,
                        port: pin.local_port,
                    });
                }
                *slot = Some(pin.local_port);
            }
        }

        for (slot, target) in assigned.iter_mut().zip(targets) {
            if slot.is_some() {
                continue;
            }
            let port = match self.allocated.get(&key(target)) {
                Some(&port) if !used.contains(&port) => port,
                _ => self.scan(&used, &key(target))?,
            };
            used.insert(port);
            *slot = Some(port);
        }

        let mut allocated = BTreeMap::new();
        let mut forwards = Vec::with_capacity(targets.len());
        for (port, target) in assigned.into_iter().zip(targets) {
            let local_port = match port {
                Some(port) => port,
                None => continue,
            };
            allocated.insert(key(target), local_port);
            forwards.push(ForwardedPort {
                container_name: target.container.clone(),
                local_address: self.address.to_string(),
                local_port,
                container_port: target.container_port,
                port_name: target.name.clone(),
                is_debug: target.is_debug,
            });
        }
        self.allocated = allocated;
        Ok(forwards)
    }

    fn scan(&self, used: &BTreeSet<u16>, for_key: &ForwardKey) -> Result<u16, DevError> {
        let len = self.range.end.saturating_sub(self.range.start);
        if len == 0 {
            return Err(DevError::NoFreePort {
                range: self.range.clone(),
            });
        }
        let offset = if self.random {
            rand::thread_rng().gen_range(0..len)
        } else {
            0
        };
        let reserved: BTreeSet<u16> = self
            .allocated
            .iter()
            .filter(|(other, _)| *other != for_key)
            .map(|(_, port)| *port)
            .collect();
        for step in 0..len {
            let port = self.range.start + ((u32::from(offset) + u32::from(step)) % u32::from(len)) as u16;
            if used.contains(&port) || reserved.contains(&port) {
                continue;
            }
            if self.probe.is_free(self.address, port) {
                return Ok(port);
            }
        }
        Err(DevError::NoFreePort {
            range: self.range.clone(),
        })
    }

    /// Host address and port per container port, for pod specs on platforms that publish ports
    pub fn published(forwards: &[ForwardedPort], address: IpAddr) -> BTreeMap<(String, u16), (IpAddr, u16)> {
        forwards
            .iter()
            .map(|forward| {
                (
                    (forward.container_name.clone(), forward.container_port),
                    (address, forward.local_port),
                )
            })
            .collect()
    }

    /// Makes the running forwards match `forwards`
    ///
    /// Obsolete listeners are shut down and awaited before any new one binds, so a port freed here can be reused in
    /// the same call.
    #[tracing::instrument(level = "debug", err, skip(self, forwards))]
    pub async fn update(&mut self, pod: &str, forwards: Vec<ForwardedPort>) -> Result<Vec<ForwardedPort>, DevError> {
        let desired: BTreeMap<ForwardKey, ForwardedPort> = forwards
            .into_iter()
            .map(|forward| ((forward.container_name.clone(), forward.container_port), forward))
            .collect();
        let pod_changed = self.pod.as_deref() != Some(pod);
        let tunnels = self.platform.forwarding() == ForwardingMode::Tunnel;

        let obsolete: Vec<ForwardKey> = self
            .active
            .iter()
            .filter(|(key, active)| (tunnels && pod_changed) || desired.get(*key) != Some(&active.forward))
            .map(|(key, _)| key.clone())
            .collect();
        for key in obsolete {
            if let Some(active) = self.active.remove(&key) {
                stop_forward(active).await;
            }
        }

        for (key, forward) in desired {
            if self.active.contains_key(&key) {
                continue;
            }
            let task = if tunnels {
                let listener = TcpListener::bind((self.address, forward.local_port))
                    .await
                    .map_err(|_| DevError::PortUnavailable {
                        address: self.address,
                        port: forward.local_port,
                    })?;
                Some(tokio::spawn(run_port_forward(
                    self.platform.clone(),
                    pod.to_owned(),
                    listener,
                    forward.container_port,
                    self.events.clone(),
                )))
            } else {
                None
            };
            info!(
                code = "port_forwarded",
                container = %forward.container_name,
                local_port = forward.local_port,
                container_port = forward.container_port,
                "forwarding {}:{} -> {}:{}",
                forward.local_address,
                forward.local_port,
                forward.container_name,
                forward.container_port
            );
            self.active.insert(key, ActiveForward { forward, task });
        }
        self.pod = Some(pod.to_owned());
        Ok(self.snapshot())
    }

    /// Shuts every forward down, returning once all local listeners are closed
    pub async fn stop_all(&mut self) -> Vec<ForwardedPort> {
        let mut stopped = Vec::new();
        for (_, active) in std::mem::take(&mut self.active) {
            stopped.push(active.forward.clone());
            stop_forward(active).await;
        }
        self.pod = None;
        if !stopped.is_empty() {
            debug!(code = "port_forwards_stopped", count = stopped.len());
        }
        stopped
    }

    pub fn snapshot(&self) -> Vec<ForwardedPort> {
        self.active.values().map(|active| active.forward.clone()).collect()
    }
}

fn key(target: &ForwardTarget) -> ForwardKey {
    (target.container.clone(), target.container_port)
}

async fn stop_forward(active: ActiveForward) {
    if let Some(task) = active.task {
        task.abort();
        // Dropping the task's future closes the listener.
        let _ = task.await;
    }
}

async fn run_port_forward(
    platform: Arc<dyn PlatformClient>,
    pod: String,
    listener: TcpListener,
    container_port: u16,
    events: Events,
) {
    let mut connections = FuturesUnordered::new();
    loop {
        futures::select! {
            accepted = listener.accept().fuse() => match accepted {
                Ok((socket, peer)) => {
                    debug!(code = "port_forward_accepted", %peer, container_port);
                    connections.push(run_port_forward_connection(platform.clone(), pod.clone(), container_port, socket).boxed());
                }
                Err(err) => {
                    warn!(code = "port_forward_accept_failed", error = %err);
                }
            },
            finished = connections.select_next_some() => {
                if let Err(err) = finished {
                    warn!(code = "port_forward_failed", container_port, error = %err);
                    events.warning(format!("port forwarding to container port {} failed: {}", container_port, err));
                }
            }
        }
    }
}

async fn run_port_forward_connection(
    platform: Arc<dyn PlatformClient>,
    pod: String,
    container_port: u16,
    socket: TcpStream,
) -> Result<(), DevError> {
    let stream = platform.port_forward(&pod, container_port).await?;
    run_port_forward_socket(socket, stream).await?;
    Ok(())
}

async fn run_port_forward_socket(
    mut socket: TcpStream,
    mut stream: impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
) -> io::Result<()> {
    let mut socket_buffer = vec![0u8; 64 * 1024];
    let mut stream_buffer = vec![0u8; 64 * 1024];
    loop {
        futures::select! {
            result = socket.read(&mut socket_buffer).fuse() => {
                let read_len = match result {
                    Ok(0) => break,
                    Ok(read_len) => read_len,
                    Err(ref err) if err.kind() == io::ErrorKind::ConnectionReset => break,
                    Err(err) => return Err(err),
                };
                stream.write_all(&socket_buffer[..read_len]).await?;
            },
            read_len = stream.read(&mut stream_buffer).fuse() => {
                let read_len = read_len?;
                if read_len == 0 {
                    break;
                }
                socket.write_all(&stream_buffer[..read_len]).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use parking_lot::Mutex;

    use odo_core::PlatformKind;
    use odo_test_util::fake::FakePlatform;

    use super::*;
    use crate::fixtures;

    /// Treats a fixed set of ports as taken by other processes
    struct TakenPorts(Mutex<BTreeSet<u16>>);

    impl PortProbe for TakenPorts {
        fn is_free(&self, _address: IpAddr, port: u16) -> bool {
            !self.0.lock().contains(&port)
        }
    }

    fn manager(platform: Arc<FakePlatform>, taken: &[u16]) -> PortForwardManager {
        PortForwardManager::new(
            platform,
            Arc::new(TakenPorts(Mutex::new(taken.iter().copied().collect()))),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            20000..20010,
            Events::disabled(),
        )
    }

    fn target(container: &str, port: u16) -> ForwardTarget {
        ForwardTarget {
            container: container.to_owned(),
            container_port: port,
            name: None,
            is_debug: false,
        }
    }

    fn ports(forwards: &[ForwardedPort]) -> Vec<(u16, u16)> {
        forwards
            .iter()
            .map(|forward| (forward.container_port, forward.local_port))
            .collect()
    }

    #[test]
    fn debug_endpoints_only_in_debug_mode() {
        let devfile = fixtures::devfile(
            r#"
schemaVersion: 2.2.0
metadata:
  name: debuggable
components:
  - name: web
    container:
      image: node:18
      endpoints:
        - name: http
          targetPort: 3000
        - name: debug
          targetPort: 5858
        - name: hidden
          targetPort: 9000
          exposure: none
commands:
  - id: r
    exec:
      component: web
      commandLine: node app.js
      group:
        kind: run
"#,
        );
        let ports = |debug| -> Vec<u16> {
            forward_targets(&devfile, debug)
                .iter()
                .map(|target| target.container_port)
                .collect()
        };
        assert_eq!(ports(false), vec![3000]);
        assert_eq!(ports(true), vec![3000, 5858]);
    }

    #[test]
    fn allocation_is_stable_across_reconciles() {
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let mut manager = manager(platform, &[20000]);
        let targets = vec![target("web", 3000), target("web", 8080)];
        let first = manager.allocate(&targets).unwrap();
        assert_eq!(ports(&first), vec![(3000, 20001), (8080, 20002)]);

        // Held ports stay with their endpoint even when the probe would now say otherwise.
        let second = manager.allocate(&targets).unwrap();
        assert_eq!(ports(&second), ports(&first));

        let reordered = manager.allocate(&[target("web", 8080), target("web", 3000)]).unwrap();
        assert_eq!(ports(&reordered), vec![(8080, 20002), (3000, 20001)]);
    }

    #[test]
    fn overrides_win_and_conflicts_fail() {
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let mut manager = manager(platform.clone(), &[20005]).with_overrides(vec![PortOverride {
            container: Some("web".to_owned()),
            local_port: 20001,
            container_port: 8080,
        }]);
        let forwards = manager.allocate(&[target("web", 3000), target("web", 8080)]).unwrap();
        assert_eq!(ports(&forwards), vec![(3000, 20000), (8080, 20001)]);

        let mut taken = manager_with_taken_override(platform);
        assert!(matches!(
            taken.allocate(&[target("web", 3000)]),
            Err(DevError::PortUnavailable { port: 20005, .. })
        ));
    }

    fn manager_with_taken_override(platform: Arc<FakePlatform>) -> PortForwardManager {
        manager(platform, &[20005]).with_overrides(vec![PortOverride {
            container: None,
            local_port: 20005,
            container_port: 3000,
        }])
    }

    #[test]
    fn exhausted_range() {
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let taken: Vec<u16> = (20000..20010).collect();
        let mut manager = manager(platform, &taken);
        assert!(matches!(
            manager.allocate(&[target("web", 3000)]),
            Err(DevError::NoFreePort { .. })
        ));
    }

    #[test]
    fn random_allocation_stays_in_range() {
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let mut manager = manager(platform, &[]).with_random_ports(true);
        let forwards = manager.allocate(&[target("web", 3000), target("web", 3001)]).unwrap();
        assert!(forwards.iter().all(|forward| (20000..20010).contains(&forward.local_port)));
        assert_ne!(forwards[0].local_port, forwards[1].local_port);
    }

    #[tokio::test]
    async fn tunnels_carry_traffic_and_release_ports() {
        odo_test_util::prep();
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let mut manager = PortForwardManager::new(
            platform.clone(),
            Arc::new(BindProbe),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            31000..31100,
            Events::disabled(),
        );
        let forwards = manager.allocate(&[target("web", 3000)]).unwrap();
        let local_port = forwards[0].local_port;
        let active = manager.update("web-app", forwards).await.unwrap();
        assert_eq!(active.len(), 1);

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, local_port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ping");
        drop(client);

        let stopped = manager.stop_all().await;
        assert_eq!(stopped.len(), 1);
        assert!(StdTcpListener::bind((Ipv4Addr::LOCALHOST, local_port)).is_ok());
        assert!(platform
            .calls()
            .iter()
            .any(|call| matches!(call, odo_test_util::fake::Call::PortForward { port: 3000, .. })));
    }

    #[tokio::test]
    async fn published_ports_need_no_listener() {
        let platform = FakePlatform::new(PlatformKind::Podman);
        let mut manager = manager(platform.clone(), &[]);
        let forwards = manager.allocate(&[target("web", 3000)]).unwrap();
        let active = manager.update("web-app", forwards.clone()).await.unwrap();
        assert_eq!(active, forwards);
        assert!(platform.calls().is_empty());
    }
}
