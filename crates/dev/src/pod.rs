//! Turns the devfile's container and volume components into the pod spec handed to the platform

use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

use tracing::warn;

use odo_core::{labels, labels::Mode, PlatformKind, SessionEnv};
use odo_devfile::{CommandKind, Container, Devfile, EventKind, DEFAULT_PROJECTS_ROOT};
use odo_platform::{ContainerSpec, MountSpec, PodSpec, PortSpec, Resources, VolumeSource, VolumeSpec};

pub const PROJECTS_VOLUME: &str = "odo-projects";
pub const SHARED_DATA_VOLUME: &str = "odo-shared-data";
pub const SHARED_DATA_PATH: &str = "/opt/odo/";
pub const RELAY_CONTAINER: &str = "odo-relay";
pub const RELAY_IMAGE: &str = "docker.io/alpine/socat:latest";
/// First container port used by relays, clear of the ports applications commonly use
pub const RELAY_PORT_BASE: u16 = 40001;

pub const PROJECTS_ROOT_VAR: &str = "PROJECTS_ROOT";
pub const PROJECT_SOURCE_VAR: &str = "PROJECT_SOURCE";
pub const DEBUG_PORT_VAR: &str = "DEBUG_PORT";

/// A loopback-only application port reached through the relay container
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Relay {
    pub container: String,
    pub target_port: u16,
    pub relay_port: u16,
}

pub struct PodInputs<'a> {
    pub env: &'a SessionEnv,
    pub mode: Mode,
    pub ephemeral: bool,
    /// Host address and port per `(container, container port)`, for platforms that publish ports
    pub published: &'a BTreeMap<(String, u16), (IpAddr, u16)>,
    pub relays: &'a [Relay],
    /// Built tag per image name, replacing matching container images
    pub built_images: &'a BTreeMap<String, String>,
}

/// Where a container sees the project sources
pub fn projects_root(container: &Container) -> &str {
    container.source_mapping.as_deref().unwrap_or(DEFAULT_PROJECTS_ROOT)
}

pub fn claim_name(volume: &str, pod: &str) -> String {
    format!("{}-{}", volume, pod)
}

pub fn materialize(devfile: &Devfile, inputs: &PodInputs) -> PodSpec {
    let pod_name = inputs.env.pod_name();
    let mut volumes = vec![
        VolumeSpec {
            name: PROJECTS_VOLUME.to_owned(),
            source: if inputs.ephemeral {
                VolumeSource::EmptyDir
            } else {
                VolumeSource::Claim {
                    claim_name: claim_name(PROJECTS_VOLUME, &pod_name),
                    size: None,
                }
            },
        },
        VolumeSpec {
            name: SHARED_DATA_VOLUME.to_owned(),
            source: VolumeSource::EmptyDir,
        },
    ];
    for (component, volume) in devfile.volume_components() {
        volumes.push(VolumeSpec {
            name: component.name.clone(),
            source: if volume.ephemeral.unwrap_or(false) {
                VolumeSource::EmptyDir
            } else {
                VolumeSource::Claim {
                    claim_name: claim_name(&component.name, &pod_name),
                    size: volume.size.clone(),
                }
            },
        });
    }

    let relayed: BTreeSet<(&str, u16)> = inputs
        .relays
        .iter()
        .map(|relay| (relay.container.as_str(), relay.target_port))
        .collect();

    let mut containers: Vec<ContainerSpec> = devfile
        .container_components()
        .map(|(component, container)| {
            let mut spec = base_container(&component.name, container, inputs);
            spec.ports = container
                .endpoints
                .iter()
                .map(|endpoint| {
                    let published = if relayed.contains(&(component.name.as_str(), endpoint.target_port)) {
                        None
                    } else {
                        inputs.published.get(&(component.name.clone(), endpoint.target_port))
                    };
                    PortSpec {
                        name: endpoint.name.clone(),
                        container_port: endpoint.target_port,
                        host_port: published.map(|(_, port)| *port),
                        host_ip: published.map(|(address, _)| address.to_string()),
                    }
                })
                .collect();
            let (command, args) = match &container.command {
                Some(command) if !command.is_empty() => (command.clone(), container.args.clone().unwrap_or_default()),
                _ => (
                    vec!["tail".to_owned()],
                    vec!["-f".to_owned(), "/dev/null".to_owned()],
                ),
            };
            spec.command = command;
            spec.args = args;
            spec
        })
        .collect();

    if !inputs.relays.is_empty() {
        containers.push(relay_container(inputs));
    }

    let init_containers = if inputs.env.platform == PlatformKind::Cluster {
        pre_start_containers(devfile, inputs)
    } else {
        Vec::new()
    };

    PodSpec {
        name: pod_name,
        labels: labels::ownership_labels(&inputs.env.component, &inputs.env.app, inputs.mode),
        annotations: BTreeMap::new(),
        containers,
        init_containers,
        volumes,
    }
}

fn base_container(name: &str, container: &Container, inputs: &PodInputs) -> ContainerSpec {
    let mut env: Vec<(String, String)> = container
        .env
        .iter()
        .map(|var| (var.name.clone(), var.value.clone()))
        .collect();
    let mut mounts = vec![MountSpec {
        volume: SHARED_DATA_VOLUME.to_owned(),
        path: SHARED_DATA_PATH.to_owned(),
    }];

    if container.mounts_sources() {
        let root = projects_root(container).to_owned();
        mounts.push(MountSpec {
            volume: PROJECTS_VOLUME.to_owned(),
            path: root.clone(),
        });
        for var in [PROJECTS_ROOT_VAR, PROJECT_SOURCE_VAR] {
            if !env.iter().any(|(name, _)| name == var) {
                env.push((var.to_owned(), root.clone()));
            }
        }
    }
    if let Some(debug) = container.endpoints.iter().find(|endpoint| endpoint.is_debug()) {
        if !env.iter().any(|(name, _)| name == DEBUG_PORT_VAR) {
            env.push((DEBUG_PORT_VAR.to_owned(), debug.target_port.to_string()));
        }
    }
    for mount in &container.volume_mounts {
        mounts.push(MountSpec {
            volume: mount.name.clone(),
            path: mount.mount_path(),
        });
    }

    let image = inputs
        .built_images
        .get(&container.image)
        .cloned()
        .unwrap_or_else(|| container.image.clone());

    ContainerSpec {
        name: name.to_owned(),
        image,
        command: Vec::new(),
        args: Vec::new(),
        env,
        ports: Vec::new(),
        mounts,
        resources: Resources {
            memory_limit: container.memory_limit.clone(),
            memory_request: container.memory_request.clone(),
            cpu_limit: container.cpu_limit.clone(),
            cpu_request: container.cpu_request.clone(),
        },
    }
}

fn relay_container(inputs: &PodInputs) -> ContainerSpec {
    let script = inputs
        .relays
        .iter()
        .map(|relay| {
            format!(
                "socat TCP-LISTEN:{},fork,reuseaddr TCP:127.0.0.1:{} &",
                relay.relay_port, relay.target_port
            )
        })
        .chain(std::iter::once("wait".to_owned()))
        .collect::<Vec<_>>()
        .join(" ");
    let ports = inputs
        .relays
        .iter()
        .map(|relay| {
            let published = inputs.published.get(&(relay.container.clone(), relay.target_port));
            PortSpec {
                name: format!("relay-{}", relay.target_port),
                container_port: relay.relay_port,
                host_port: published.map(|(_, port)| *port),
                host_ip: published.map(|(address, _)| address.to_string()),
            }
        })
        .collect();
    ContainerSpec {
        name: RELAY_CONTAINER.to_owned(),
        image: RELAY_IMAGE.to_owned(),
        command: vec!["sh".to_owned()],
        args: vec!["-c".to_owned(), script],
        ports,
        ..Default::default()
    }
}

/// `preStart` exec commands, in declaration order with composites flattened
fn pre_start_containers(devfile: &Devfile, inputs: &PodInputs) -> Vec<ContainerSpec> {
    let mut ids = Vec::new();
    let mut seen = BTreeSet::new();
    for id in devfile.events(EventKind::PreStart) {
        flatten_exec_ids(devfile, id, &mut seen, &mut ids);
    }

    let mut init_containers = Vec::new();
    for id in ids {
        let exec = match devfile.command(&id).map(|command| &command.kind) {
            Some(CommandKind::Exec(exec)) => exec,
            _ => continue,
        };
        let container = match devfile.container_components().find(|(component, _)| component.name == exec.component) {
            Some((_, container)) => container,
            None => {
                warn!(code = "pre_start_component_missing", command = %id, component = %exec.component);
                continue;
            }
        };
        let mut spec = base_container(&format!("{}-{}", exec.component, id), container, inputs);
        spec.command = vec!["/bin/sh".to_owned(), "-c".to_owned()];
        spec.args = vec![match &exec.working_dir {
            Some(dir) => format!("cd \"{}\" && {}", dir, exec.command_line),
            None => exec.command_line.clone(),
        }];
        spec.env.extend(exec.env.iter().map(|var| (var.name.clone(), var.value.clone())));
        init_containers.push(spec);
    }
    init_containers
}

fn flatten_exec_ids(devfile: &Devfile, id: &str, seen: &mut BTreeSet<String>, out: &mut Vec<String>) {
    if !seen.insert(id.to_owned()) {
        return;
    }
    match devfile.command(id).map(|command| &command.kind) {
        Some(CommandKind::Exec(_)) => out.push(id.to_owned()),
        Some(CommandKind::Composite(composite)) => {
            for member in &composite.commands {
                flatten_exec_ids(devfile, member, seen, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::fixtures;

    fn inputs<'a>(
        env: &'a SessionEnv,
        published: &'a BTreeMap<(String, u16), (IpAddr, u16)>,
        relays: &'a [Relay],
        built: &'a BTreeMap<String, String>,
    ) -> PodInputs<'a> {
        PodInputs {
            env,
            mode: Mode::Dev,
            ephemeral: true,
            published,
            relays,
            built_images: built,
        }
    }

    #[test]
    fn container_defaults() {
        let devfile = fixtures::devfile(fixtures::ENDPOINT_DEVFILE);
        let env = fixtures::session_env(std::path::Path::new("/work"), PlatformKind::Cluster);
        let (published, built) = (BTreeMap::new(), BTreeMap::new());
        let spec = materialize(&devfile, &inputs(&env, &published, &[], &built));

        assert_eq!(spec.name, "web-app");
        assert_eq!(spec.labels.get(labels::MODE).map(String::as_str), Some("dev"));
        let web = spec.container("web").unwrap();
        assert_eq!(web.command, vec!["tail"]);
        assert_eq!(web.args, vec!["-f", "/dev/null"]);
        assert!(web
            .mounts
            .iter()
            .any(|mount| mount.volume == PROJECTS_VOLUME && mount.path == "/projects"));
        assert!(web
            .mounts
            .iter()
            .any(|mount| mount.volume == SHARED_DATA_VOLUME && mount.path == SHARED_DATA_PATH));
        assert!(web
            .env
            .contains(&(PROJECT_SOURCE_VAR.to_owned(), "/projects".to_owned())));
        assert_eq!(web.ports[0].container_port, 3000);
        assert_eq!(web.ports[0].host_port, None);
        assert_eq!(spec.volumes[0].source, VolumeSource::EmptyDir);
    }

    #[test]
    fn persistent_volumes_and_published_ports() {
        let devfile = fixtures::devfile(fixtures::ENDPOINT_DEVFILE);
        let env = fixtures::session_env(std::path::Path::new("/work"), PlatformKind::Podman);
        let mut published = BTreeMap::new();
        published.insert(("web".to_owned(), 3000), (IpAddr::V4(Ipv4Addr::LOCALHOST), 20000));
        let built = BTreeMap::new();
        let mut inputs = inputs(&env, &published, &[], &built);
        inputs.ephemeral = false;
        let spec = materialize(&devfile, &inputs);

        let web = spec.container("web").unwrap();
        assert_eq!(web.ports[0].host_port, Some(20000));
        assert_eq!(web.ports[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(
            spec.claims().collect::<Vec<_>>(),
            vec![("odo-projects-web-app", None), ("cache-web-app", Some("2Gi"))]
        );
        assert!(spec.init_containers.is_empty());
    }

    #[test]
    fn relay_takes_over_published_port() {
        let devfile = fixtures::devfile(fixtures::ENDPOINT_DEVFILE);
        let env = fixtures::session_env(std::path::Path::new("/work"), PlatformKind::Podman);
        let mut published = BTreeMap::new();
        published.insert(("web".to_owned(), 3000), (IpAddr::V4(Ipv4Addr::LOCALHOST), 20000));
        let relays = vec![Relay {
            container: "web".to_owned(),
            target_port: 3000,
            relay_port: RELAY_PORT_BASE,
        }];
        let built = BTreeMap::new();
        let spec = materialize(&devfile, &inputs(&env, &published, &relays, &built));

        assert_eq!(spec.container("web").unwrap().ports[0].host_port, None);
        let relay = spec.container(RELAY_CONTAINER).unwrap();
        assert_eq!(relay.ports[0].container_port, RELAY_PORT_BASE);
        assert_eq!(relay.ports[0].host_port, Some(20000));
        assert!(relay.args[1].contains("TCP-LISTEN:40001,fork,reuseaddr TCP:127.0.0.1:3000"));
        assert_ne!(
            spec.spec_hash(),
            materialize(&devfile, &PodInputs {
                relays: &[],
                ..inputs(&env, &published, &relays, &built)
            })
            .spec_hash()
        );
    }

    #[test]
    fn pre_start_becomes_init_container_on_cluster() {
        let devfile = fixtures::devfile(fixtures::ENDPOINT_DEVFILE);
        let env = fixtures::session_env(std::path::Path::new("/work"), PlatformKind::Cluster);
        let (published, built) = (BTreeMap::new(), BTreeMap::new());
        let spec = materialize(&devfile, &inputs(&env, &published, &[], &built));

        assert_eq!(spec.init_containers.len(), 1);
        let init = &spec.init_containers[0];
        assert_eq!(init.name, "web-prepare");
        assert_eq!(init.command, vec!["/bin/sh", "-c"]);
        assert_eq!(init.args, vec!["mkdir -p /projects/tmp"]);
    }

    #[test]
    fn built_image_replaces_container_image() {
        let devfile = fixtures::devfile(fixtures::ENDPOINT_DEVFILE);
        let env = fixtures::session_env(std::path::Path::new("/work"), PlatformKind::Cluster);
        let published = BTreeMap::new();
        let mut built = BTreeMap::new();
        built.insert("node:18".to_owned(), "registry.local/node:18".to_owned());
        let spec = materialize(&devfile, &inputs(&env, &published, &[], &built));
        assert_eq!(spec.container("web").unwrap().image, "registry.local/node:18");
    }
}
