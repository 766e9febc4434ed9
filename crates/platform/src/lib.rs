//! Uniform surface over the execution platforms a session can target
//!
//! The dev loop only ever talks to `dyn PlatformClient`. [`Platform`] is the production implementation and dispatches
//! to the cluster or local engine backend.

mod cluster;
mod engine;
mod error;
mod resource;
mod spec;

pub use crate::{
    cluster::{ClusterBackend, ClusterOptions},
    engine::{EngineBackend, EngineOptions, PODMAN_CMD_VAR},
    error::PlatformError,
    resource::{sort_for_display, without_dependents, OwnerRef, ResourceRecord, KIND_CLAIM, KIND_ENGINE_VOLUME, KIND_POD},
    spec::{ContainerSpec, MountSpec, PodSpec, PortSpec, Resources, VolumeSource, VolumeSpec, DEFAULT_CLAIM_SIZE},
};

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use odo_core::{labels::Selector, PlatformKind};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

pub type Result<T, E = PlatformError> = std::result::Result<T, E>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PodChange {
    Unchanged,
    Created,
    Replaced,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> PodPhase {
        match phase.to_ascii_lowercase().as_str() {
            "pending" | "created" | "initialized" => PodPhase::Pending,
            "running" | "degraded" => PodPhase::Running,
            "succeeded" | "exited" | "stopped" => PodPhase::Succeeded,
            "failed" | "error" | "dead" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PodInfo {
    pub name: String,
    pub phase: PodPhase,
    pub spec_hash: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum WorkloadEvent {
    Changed { pod: String, phase: PodPhase },
    Deleted { pod: String },
}

#[derive(Clone, Debug)]
pub struct ExecRequest {
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl ExecRequest {
    pub fn new<I, S>(pod: &str, container: &str, command: I) -> ExecRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecRequest {
            pod: pod.to_owned(),
            container: container.to_owned(),
            command: command.into_iter().map(Into::into).collect(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: Vec<u8>) -> ExecRequest {
        self.stdin = Some(stdin);
        self
    }
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// How local ports reach container ports on a platform
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ForwardingMode {
    /// Each connection is carried over a platform tunnel opened on demand
    Tunnel,
    /// Host ports are baked into the pod spec and published by the engine
    PublishedPorts,
}

pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelIo for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Options shared by every platform operation
#[derive(Clone, Debug)]
pub struct PlatformOptions {
    /// Deadline for individual platform calls
    pub timeout: Duration,
}

impl Default for PlatformOptions {
    fn default() -> Self {
        PlatformOptions {
            timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// Namespace resources are created in, if the platform has namespaces
    fn namespace(&self) -> Option<&str>;

    fn forwarding(&self) -> ForwardingMode;

    /// Deploys `spec`, replacing any previous pod of the same name whose spec differs
    async fn create_or_replace_pod(&self, spec: &PodSpec) -> Result<PodChange>;

    async fn get_pod(&self, name: &str) -> Result<Option<PodInfo>>;

    async fn wait_for_pod_ready(&self, name: &str, timeout: Duration) -> Result<PodInfo>;

    /// Lists resources matching `selector`, sorted by kind then name
    async fn list_resources_by_selector(&self, selector: &Selector, namespace: Option<&str>)
        -> Result<Vec<ResourceRecord>>;

    async fn exec_in_container(&self, request: ExecRequest) -> Result<ExecOutput>;

    async fn pod_logs(&self, pod: &str, container: &str, follow: bool) -> Result<BoxStream<'static, Result<String>>>;

    /// Opens a byte stream to `port` inside `pod`
    async fn port_forward(&self, pod: &str, port: u16) -> Result<TunnelStream>;

    /// Streams state changes of pods matching `selector`
    async fn watch_workload(&self, selector: &Selector) -> Result<BoxStream<'static, Result<WorkloadEvent>>>;

    /// Deletes the given resources, waiting until they are gone when `wait` is set
    async fn delete_resources(&self, records: &[ResourceRecord], wait: bool) -> Result<()>;

    /// Creates or updates an arbitrary manifest object, returning its record
    async fn apply_manifest(&self, object: serde_json::Value) -> Result<ResourceRecord>;

    /// Removes every resource matching `selector`, workloads before the volumes they use
    async fn tear_down(&self, selector: &Selector, wait: bool) -> Result<Vec<ResourceRecord>> {
        let records = self.list_resources_by_selector(selector, self.namespace()).await?;
        let (volumes, workloads): (Vec<_>, Vec<_>) = records.into_iter().partition(ResourceRecord::is_volume);
        debug!(
            code = "tear_down",
            %selector,
            workloads = workloads.len(),
            volumes = volumes.len()
        );
        // Volumes cannot be released while a pod still mounts them.
        self.delete_resources(&workloads, wait || !volumes.is_empty()).await?;
        self.delete_resources(&volumes, wait).await?;
        let mut removed = workloads;
        removed.extend(volumes);
        Ok(removed)
    }
}

/// The production platform selected on the command line
pub enum Platform {
    Cluster(ClusterBackend),
    Engine(EngineBackend),
}

impl Platform {
    #[tracing::instrument(level = "debug", err, skip(cluster, engine))]
    pub async fn connect(kind: PlatformKind, cluster: ClusterOptions, engine: EngineOptions) -> Result<Platform> {
        match kind {
            PlatformKind::Cluster => Ok(Platform::Cluster(ClusterBackend::connect(cluster).await?)),
            PlatformKind::Podman => Ok(Platform::Engine(EngineBackend::connect(engine).await?)),
        }
    }

    fn backend(&self) -> &dyn PlatformClient {
        match self {
            Platform::Cluster(backend) => backend,
            Platform::Engine(backend) => backend,
        }
    }
}

#[async_trait]
impl PlatformClient for Platform {
    fn kind(&self) -> PlatformKind {
        match self {
            Platform::Cluster(_) => PlatformKind::Cluster,
            Platform::Engine(_) => PlatformKind::Podman,
        }
    }

    fn namespace(&self) -> Option<&str> {
        self.backend().namespace()
    }

    fn forwarding(&self) -> ForwardingMode {
        self.backend().forwarding()
    }

    async fn create_or_replace_pod(&self, spec: &PodSpec) -> Result<PodChange> {
        self.backend().create_or_replace_pod(spec).await
    }

    async fn get_pod(&self, name: &str) -> Result<Option<PodInfo>> {
        self.backend().get_pod(name).await
    }

    async fn wait_for_pod_ready(&self, name: &str, timeout: Duration) -> Result<PodInfo> {
        self.backend().wait_for_pod_ready(name, timeout).await
    }

    async fn list_resources_by_selector(
        &self,
        selector: &Selector,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceRecord>> {
        self.backend().list_resources_by_selector(selector, namespace).await
    }

    async fn exec_in_container(&self, request: ExecRequest) -> Result<ExecOutput> {
        self.backend().exec_in_container(request).await
    }

    async fn pod_logs(&self, pod: &str, container: &str, follow: bool) -> Result<BoxStream<'static, Result<String>>> {
        self.backend().pod_logs(pod, container, follow).await
    }

    async fn port_forward(&self, pod: &str, port: u16) -> Result<TunnelStream> {
        self.backend().port_forward(pod, port).await
    }

    async fn watch_workload(&self, selector: &Selector) -> Result<BoxStream<'static, Result<WorkloadEvent>>> {
        self.backend().watch_workload(selector).await
    }

    async fn delete_resources(&self, records: &[ResourceRecord], wait: bool) -> Result<()> {
        self.backend().delete_resources(records, wait).await
    }

    async fn apply_manifest(&self, object: serde_json::Value) -> Result<ResourceRecord> {
        self.backend().apply_manifest(object).await
    }

    async fn tear_down(&self, selector: &Selector, wait: bool) -> Result<Vec<ResourceRecord>> {
        self.backend().tear_down(selector, wait).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_parsing_covers_both_backends() {
        assert_eq!(PodPhase::parse("Running"), PodPhase::Running);
        assert_eq!(PodPhase::parse("Degraded"), PodPhase::Running);
        assert_eq!(PodPhase::parse("Created"), PodPhase::Pending);
        assert_eq!(PodPhase::parse("Exited"), PodPhase::Succeeded);
        assert_eq!(PodPhase::parse("something"), PodPhase::Unknown);
    }
}
