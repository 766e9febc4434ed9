use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Container, ContainerPort, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaim, PersistentVolumeClaimSpec,
        PersistentVolumeClaimVolumeSource, Pod, PodSpec as KubePodSpec, ResourceRequirements as KubeResources,
        Volume, VolumeMount, VolumeResourceRequirements,
    },
    apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
};
use ring::digest::SHA256;
use serde::{Deserialize, Serialize};

use odo_core::labels;

/// Platform-neutral description of the dev workload
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub struct PodSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub init_containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub resources: Resources,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct PortSpec {
    pub name: String,
    pub container_port: u16,
    /// Only used by platforms that publish ports instead of tunnelling
    pub host_port: Option<u16>,
    pub host_ip: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct MountSpec {
    pub volume: String,
    pub path: String,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub struct Resources {
    pub memory_limit: Option<String>,
    pub memory_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub cpu_request: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct VolumeSpec {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub enum VolumeSource {
    EmptyDir,
    Claim { claim_name: String, size: Option<String> },
}

pub const DEFAULT_CLAIM_SIZE: &str = "1Gi";

impl PodSpec {
    /// Digest of everything that affects the deployed workload
    ///
    /// Two specs with the same hash are treated as semantically equal, so an unchanged manifest never replaces the
    /// running pod.
    pub fn spec_hash(&self) -> String {
        let mut hashed = self.clone();
        hashed.labels.remove(labels::SPEC_HASH);
        let encoded = match serde_json::to_vec(&hashed) {
            Ok(encoded) => encoded,
            Err(_) => unreachable!("pod specs always serialize"),
        };
        let digest = ring::digest::digest(&SHA256, &encoded);
        let mut hex = hex::encode(digest.as_ref());
        hex.truncate(32);
        hex
    }

    /// Returns a copy with the hash label set
    pub fn stamped(&self) -> PodSpec {
        let mut stamped = self.clone();
        stamped.labels.insert(labels::SPEC_HASH.to_owned(), self.spec_hash());
        stamped
    }

    pub fn container(&self, name: &str) -> Option<&ContainerSpec> {
        self.containers.iter().find(|container| container.name == name)
    }

    pub fn claims(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.volumes.iter().filter_map(|volume| match &volume.source {
            VolumeSource::Claim { claim_name, size } => Some((claim_name.as_str(), size.as_deref())),
            VolumeSource::EmptyDir => None,
        })
    }

    pub fn to_kube_pod(&self, namespace: Option<&str>) -> Pod {
        let stamped = self.stamped();
        Pod {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: namespace.map(str::to_owned),
                labels: Some(stamped.labels),
                annotations: if self.annotations.is_empty() {
                    None
                } else {
                    Some(self.annotations.clone())
                },
                ..Default::default()
            },
            spec: Some(KubePodSpec {
                containers: self.containers.iter().map(ContainerSpec::to_kube).collect(),
                init_containers: if self.init_containers.is_empty() {
                    None
                } else {
                    Some(self.init_containers.iter().map(ContainerSpec::to_kube).collect())
                },
                volumes: Some(self.volumes.iter().map(VolumeSpec::to_kube).collect()),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Claims backing the pod's persistent volumes, labelled like the pod
    pub fn to_kube_claims(&self, namespace: Option<&str>) -> Vec<PersistentVolumeClaim> {
        let mut claim_labels = self.labels.clone();
        claim_labels.remove(labels::SPEC_HASH);
        self.claims()
            .map(|(claim_name, size)| {
                let mut requests = BTreeMap::new();
                requests.insert(
                    "storage".to_owned(),
                    Quantity(size.unwrap_or(DEFAULT_CLAIM_SIZE).to_owned()),
                );
                PersistentVolumeClaim {
                    metadata: ObjectMeta {
                        name: Some(claim_name.to_owned()),
                        namespace: namespace.map(str::to_owned),
                        labels: Some(claim_labels.clone()),
                        ..Default::default()
                    },
                    spec: Some(PersistentVolumeClaimSpec {
                        access_modes: Some(vec!["ReadWriteOnce".to_owned()]),
                        resources: Some(VolumeResourceRequirements {
                            requests: Some(requests),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    status: None,
                }
            })
            .collect()
    }
}

impl ContainerSpec {
    fn to_kube(&self) -> Container {
        let quantities = |memory: &Option<String>, cpu: &Option<String>| {
            let mut values = BTreeMap::new();
            if let Some(memory) = memory {
                values.insert("memory".to_owned(), Quantity(memory.clone()));
            }
            if let Some(cpu) = cpu {
                values.insert("cpu".to_owned(), Quantity(cpu.clone()));
            }
            if values.is_empty() {
                None
            } else {
                Some(values)
            }
        };
        let limits = quantities(&self.resources.memory_limit, &self.resources.cpu_limit);
        let requests = quantities(&self.resources.memory_request, &self.resources.cpu_request);

        Container {
            name: self.name.clone(),
            image: Some(self.image.clone()),
            command: if self.command.is_empty() {
                None
            } else {
                Some(self.command.clone())
            },
            args: if self.args.is_empty() {
                None
            } else {
                Some(self.args.clone())
            },
            env: Some(
                self.env
                    .iter()
                    .map(|(name, value)| EnvVar {
                        name: name.clone(),
                        value: Some(value.clone()),
                        value_from: None,
                    })
                    .collect(),
            ),
            ports: Some(
                self.ports
                    .iter()
                    .map(|port| ContainerPort {
                        name: Some(port_name(&port.name)),
                        container_port: i32::from(port.container_port),
                        host_port: port.host_port.map(i32::from),
                        host_ip: port.host_ip.clone(),
                        protocol: Some("TCP".to_owned()),
                    })
                    .collect(),
            ),
            volume_mounts: Some(
                self.mounts
                    .iter()
                    .map(|mount| VolumeMount {
                        name: mount.volume.clone(),
                        mount_path: mount.path.clone(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            resources: if limits.is_none() && requests.is_none() {
                None
            } else {
                Some(KubeResources {
                    limits,
                    requests,
                    ..Default::default()
                })
            },
            ..Default::default()
        }
    }
}

impl VolumeSpec {
    fn to_kube(&self) -> Volume {
        match &self.source {
            VolumeSource::EmptyDir => Volume {
                name: self.name.clone(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
            VolumeSource::Claim { claim_name, .. } => Volume {
                name: self.name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.clone(),
                    read_only: None,
                }),
                ..Default::default()
            },
        }
    }
}

// Port names are limited to 15 characters by the API server.
fn port_name(name: &str) -> String {
    let mut name: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    name.truncate(15);
    name.trim_end_matches('-').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PodSpec {
        PodSpec {
            name: "web-app".to_owned(),
            labels: labels::ownership_labels("web", "app", labels::Mode::Dev),
            containers: vec![ContainerSpec {
                name: "web".to_owned(),
                image: "node:18".to_owned(),
                ports: vec![PortSpec {
                    name: "http-node-server".to_owned(),
                    container_port: 3000,
                    host_port: None,
                    host_ip: None,
                }],
                ..Default::default()
            }],
            volumes: vec![VolumeSpec {
                name: "odo-projects".to_owned(),
                source: VolumeSource::EmptyDir,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn hash_ignores_existing_hash_label() {
        let spec = sample();
        assert_eq!(spec.spec_hash(), spec.stamped().spec_hash());
    }

    #[test]
    fn hash_tracks_changes() {
        let spec = sample();
        let mut changed = spec.clone();
        changed.containers[0].image = "node:20".to_owned();
        assert_ne!(spec.spec_hash(), changed.spec_hash());
    }

    #[test]
    fn kube_pod_carries_labels() {
        let pod = sample().to_kube_pod(Some("dev"));
        let pod_labels = pod.metadata.labels.unwrap();
        assert_eq!(pod_labels.get(labels::MANAGED_BY).map(String::as_str), Some("odo"));
        assert!(pod_labels.contains_key(labels::SPEC_HASH));
        let container = &pod.spec.unwrap().containers[0];
        assert_eq!(container.ports.as_ref().unwrap()[0].name.as_deref(), Some("http-node-serve"));
    }
}
