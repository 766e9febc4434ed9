use std::{
    fmt::Debug,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures::{prelude::*, stream::BoxStream};
use k8s_openapi::{
    api::core::v1::{PersistentVolumeClaim, Pod},
    apimachinery::pkg::apis::meta::v1::Status,
};
use kube_client::{
    api::{
        AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, Portforwarder, WatchEvent, WatchParams,
    },
    config::KubeConfigOptions,
    core::{DynamicObject, GroupVersionKind},
    discovery::{self, verbs, ApiResource, Discovery, Scope},
    Api, Client,
};
use odo_core::{labels, labels::Selector, PlatformKind};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, warn};

use crate::{
    resource::{check_ownership, sort_for_display, without_dependents},
    ExecOutput, ExecRequest, ForwardingMode, PlatformClient, PlatformError, PodChange, PodInfo, PodPhase, PodSpec,
    ResourceRecord, Result, TunnelStream, WorkloadEvent,
};

pub const FIELD_MANAGER: &str = "odo";

// Never owned by the tool even when they carry copied labels.
const SKIPPED_KINDS: &[&str] = &["Event", "Endpoints", "EndpointSlice", "ControllerRevision"];

const IMAGE_PULL_FAILURES: &[&str] = &["ErrImagePull", "ImagePullBackOff", "InvalidImageName", "ErrImageNeverPull"];

#[derive(Clone, Debug)]
pub struct ClusterOptions {
    pub context: Option<String>,
    pub namespace: Option<String>,
    pub timeout: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            context: None,
            namespace: None,
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct ClusterBackend {
    client: Client,
    namespace: String,
    timeout: Duration,
}

impl ClusterBackend {
    pub async fn connect(options: ClusterOptions) -> Result<ClusterBackend> {
        let unavailable = |message: String| PlatformError::Unavailable { message };
        let config = match &options.context {
            Some(context) => {
                let mut config_options = KubeConfigOptions::default();
                config_options.context = Some(context.to_owned());
                kube_client::Config::from_kubeconfig(&config_options)
                    .await
                    .map_err(|err| unavailable(format!("failed to load kubeconfig: {}", err)))?
            }
            None => kube_client::Config::infer()
                .await
                .map_err(|err| unavailable(format!("failed to load kubeconfig: {}", err)))?,
        };
        let namespace = options
            .namespace
            .clone()
            .unwrap_or_else(|| config.default_namespace.clone());
        let client = Client::try_from(config).map_err(|err| unavailable(err.to_string()))?;

        match tokio::time::timeout(options.timeout, client.apiserver_version()).await {
            Ok(Ok(version)) => {
                debug!(code = "cluster_connected", version = %version.git_version, %namespace);
            }
            Ok(Err(err)) => return Err(unavailable(format!("cluster API server unreachable: {}", err))),
            Err(_) => return Err(unavailable("timed out contacting cluster API server".to_owned())),
        }

        Ok(ClusterBackend {
            client,
            namespace,
            timeout: options.timeout,
        })
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = kube_client::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err @ kube_client::Error::Api(_))) => Err(err.into()),
            Ok(Err(err)) => Err(PlatformError::Unavailable {
                message: err.to_string(),
            }),
            Err(_) => Err(PlatformError::Timeout(self.timeout)),
        }
    }

    async fn delete_object<K>(&self, api: &Api<K>, kind: &str, name: &str, wait: bool) -> Result<()>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        let params = if wait {
            DeleteParams::foreground()
        } else {
            DeleteParams::background()
        };
        match self.deadline(api.delete(name, &params)).await {
            Ok(_) => debug!(code = "resource_deleted", kind, name),
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        }
        if !wait {
            return Ok(());
        }

        let poll = async {
            loop {
                if self.deadline(api.get_opt(name)).await?.is_none() {
                    return Ok(());
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        };
        match tokio::time::timeout(self.timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout(self.timeout)),
        }
    }

    fn dynamic_api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace.unwrap_or(&self.namespace), resource)
    }
}

fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

fn api_resource(record: &ResourceRecord) -> ApiResource {
    let (group, version) = match record.api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", record.api_version.as_str()),
    };
    let gvk = GroupVersionKind::gvk(group, version, &record.kind);
    if record.resource.is_empty() {
        ApiResource::from_gvk(&gvk)
    } else {
        ApiResource::from_gvk_with_plural(&gvk, &record.resource)
    }
}

fn pod_info(pod: &Pod) -> PodInfo {
    PodInfo {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: pod
            .status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            .map(PodPhase::parse)
            .unwrap_or(PodPhase::Pending),
        spec_hash: pod
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(labels::SPEC_HASH).cloned()),
    }
}

/// Returns the pod's info once every container reports ready, or the reason it never will
fn pod_readiness(pod: &Pod) -> Result<Option<PodInfo>> {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let status = match &pod.status {
        Some(status) => status,
        None => return Ok(None),
    };
    let statuses = status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten());
    for container in statuses {
        let waiting = container.state.as_ref().and_then(|state| state.waiting.as_ref());
        if let Some(waiting) = waiting {
            let reason = waiting.reason.as_deref().unwrap_or_default();
            if IMAGE_PULL_FAILURES.contains(&reason) {
                return Err(PlatformError::ImageUnresolved {
                    image: container.image.clone(),
                    reason: waiting.message.clone().unwrap_or_else(|| reason.to_owned()),
                });
            }
            if reason == "CrashLoopBackOff" || reason == "CreateContainerConfigError" {
                return Err(PlatformError::PodFailed {
                    pod: name,
                    reason: format!("container {:?}: {}", container.name, reason),
                });
            }
        }
    }
    let info = pod_info(pod);
    match info.phase {
        PodPhase::Failed | PodPhase::Succeeded => Err(PlatformError::PodFailed {
            pod: name,
            reason: status.reason.clone().unwrap_or_else(|| format!("pod phase is {:?}", info.phase)),
        }),
        PodPhase::Running
            if status
                .container_statuses
                .iter()
                .flatten()
                .all(|container| container.ready) =>
        {
            Ok(Some(info))
        }
        _ => Ok(None),
    }
}

fn exit_code(status: Option<Status>, container: &str) -> Result<i32> {
    let status = status.ok_or_else(|| PlatformError::Exec {
        container: container.to_owned(),
        message: "connection closed before the command reported its status".to_owned(),
    })?;
    if status.status.as_deref() == Some("Success") {
        return Ok(0);
    }
    let code = status
        .details
        .as_ref()
        .and_then(|details| details.causes.as_ref())
        .into_iter()
        .flatten()
        .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        .and_then(|cause| cause.message.as_deref())
        .and_then(|message| message.parse().ok());
    code.ok_or_else(|| PlatformError::Exec {
        container: container.to_owned(),
        message: status.message.unwrap_or_else(|| "unknown failure".to_owned()),
    })
}

#[async_trait]
impl PlatformClient for ClusterBackend {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Cluster
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }

    fn forwarding(&self) -> ForwardingMode {
        ForwardingMode::Tunnel
    }

    #[tracing::instrument(level = "debug", err, skip(self, spec), fields(pod = %spec.name))]
    async fn create_or_replace_pod(&self, spec: &PodSpec) -> Result<PodChange> {
        let pods = self.pods();
        let desired_hash = spec.spec_hash();

        let change = match self.deadline(pods.get_opt(&spec.name)).await? {
            Some(existing) => {
                let existing_labels = existing.metadata.labels.clone().unwrap_or_default();
                check_ownership("Pod", &spec.name, &existing_labels, &spec.labels)?;
                let terminating = existing.metadata.deletion_timestamp.is_some();
                if existing_labels.get(labels::SPEC_HASH) == Some(&desired_hash) && !terminating {
                    debug!(code = "pod_unchanged", pod = %spec.name);
                    return Ok(PodChange::Unchanged);
                }
                info!(code = "pod_replaced", pod = %spec.name, "pod spec changed, replacing pod");
                self.delete_object(&pods, "Pod", &spec.name, true).await?;
                PodChange::Replaced
            }
            None => PodChange::Created,
        };

        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &self.namespace);
        for claim in spec.to_kube_claims(Some(&self.namespace)) {
            let name = claim.metadata.name.clone().unwrap_or_default();
            if self.deadline(claims.get_opt(&name)).await?.is_none() {
                self.deadline(claims.patch(&name, &apply_params(), &Patch::Apply(&claim)))
                    .await?;
                debug!(code = "claim_created", claim = %name);
            }
        }

        let pod = spec.to_kube_pod(Some(&self.namespace));
        self.deadline(pods.patch(&spec.name, &apply_params(), &Patch::Apply(&pod)))
            .await?;
        Ok(change)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<PodInfo>> {
        Ok(self.deadline(self.pods().get_opt(name)).await?.as_ref().map(pod_info))
    }

    #[tracing::instrument(level = "debug", err, skip(self))]
    async fn wait_for_pod_ready(&self, name: &str, timeout: Duration) -> Result<PodInfo> {
        let pods = self.pods();
        let wait = async {
            loop {
                if let Some(pod) = self.deadline(pods.get_opt(name)).await? {
                    if let Some(info) = pod_readiness(&pod)? {
                        return Ok(info);
                    }
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout(timeout)),
        }
    }

    #[tracing::instrument(level = "debug", err, skip(self))]
    async fn list_resources_by_selector(
        &self,
        selector: &Selector,
        namespace: Option<&str>,
    ) -> Result<Vec<ResourceRecord>> {
        let discovery = self.deadline(Discovery::new(self.client.clone()).run()).await?;
        let mut candidates = Vec::new();
        for group in discovery.groups() {
            for (resource, capabilities) in group.recommended_resources() {
                if !matches!(capabilities.scope, Scope::Namespaced)
                    || !capabilities.supports_operation(verbs::LIST)
                    || SKIPPED_KINDS.contains(&resource.kind.as_str())
                {
                    continue;
                }
                candidates.push(resource);
            }
        }

        let params = ListParams::default().labels(&selector.to_string());
        let requests: Vec<_> = candidates
            .into_iter()
            .map(|resource| {
                let api = self.dynamic_api(&resource, namespace);
                let params = params.clone();
                async move {
                    let list = self.deadline(api.list(&params)).await;
                    (resource, list)
                }
                .boxed()
            })
            .collect();
        let lists: Vec<_> = futures::stream::iter(requests).buffer_unordered(8).collect().await;

        let mut records = Vec::new();
        for (resource, list) in lists {
            match list {
                Ok(list) => {
                    for object in &list.items {
                        let mut record = ResourceRecord::from_dynamic(object, &resource.plural);
                        record.kind = resource.kind.clone();
                        record.api_version = resource.api_version.clone();
                        if selector.matches(&record.labels) {
                            records.push(record);
                        }
                    }
                }
                Err(PlatformError::Kube(kube_client::Error::Api(response)))
                    if matches!(response.code, 403 | 404 | 405) =>
                {
                    debug!(code = "list_skipped", kind = %resource.kind, status = response.code);
                }
                Err(err) => return Err(err),
            }
        }
        let mut records = without_dependents(records);
        sort_for_display(&mut records);
        Ok(records)
    }

    #[tracing::instrument(level = "debug", err, skip(self, request), fields(pod = %request.pod, container = %request.container))]
    async fn exec_in_container(&self, request: ExecRequest) -> Result<ExecOutput> {
        let params = AttachParams::default()
            .container(request.container.clone())
            .stdin(request.stdin.is_some())
            .stdout(true)
            .stderr(true);
        let mut attached = self
            .deadline(self.pods().exec(&request.pod, request.command.clone(), &params))
            .await?;
        let status = attached.take_status();
        let stdin = attached.stdin();
        let stdout = attached.stdout();
        let stderr = attached.stderr();

        let write_stdin = async {
            if let (Some(mut writer), Some(input)) = (stdin, request.stdin.as_ref()) {
                writer.write_all(input).await?;
                writer.shutdown().await?;
            }
            Ok::<_, io::Error>(())
        };
        let read_stdout = async {
            let mut buffer = Vec::new();
            if let Some(mut reader) = stdout {
                reader.read_to_end(&mut buffer).await?;
            }
            Ok::<_, io::Error>(buffer)
        };
        let read_stderr = async {
            let mut buffer = Vec::new();
            if let Some(mut reader) = stderr {
                reader.read_to_end(&mut buffer).await?;
            }
            Ok::<_, io::Error>(buffer)
        };
        let ((), stdout, stderr) = futures::try_join!(write_stdin, read_stdout, read_stderr)?;

        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        let exit_code = exit_code(status, &request.container)?;
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn pod_logs(&self, pod: &str, container: &str, follow: bool) -> Result<BoxStream<'static, Result<String>>> {
        let params = LogParams {
            container: Some(container.to_owned()),
            follow,
            ..Default::default()
        };
        let reader = self.deadline(self.pods().log_stream(pod, &params)).await?;
        Ok(reader.lines().map_err(PlatformError::from).boxed())
    }

    async fn port_forward(&self, pod: &str, port: u16) -> Result<TunnelStream> {
        let mut forwarder = self.deadline(self.pods().portforward(pod, &[port])).await?;
        let stream = forwarder.take_stream(port).ok_or_else(|| PlatformError::Exec {
            container: pod.to_owned(),
            message: format!("missing port forward stream for port {}", port),
        })?;
        Ok(Box::new(KubeTunnel {
            stream: Box::new(stream),
            _forwarder: Box::new(forwarder),
        }))
    }

    async fn watch_workload(&self, selector: &Selector) -> Result<BoxStream<'static, Result<WorkloadEvent>>> {
        let params = WatchParams::default().labels(&selector.to_string());
        let stream = self.deadline(self.pods().watch(&params, "0")).await?;
        Ok(stream
            .filter_map(|event| async move {
                match event {
                    Ok(WatchEvent::Added(pod)) | Ok(WatchEvent::Modified(pod)) => {
                        let info = pod_info(&pod);
                        Some(Ok(WorkloadEvent::Changed {
                            pod: info.name,
                            phase: info.phase,
                        }))
                    }
                    Ok(WatchEvent::Deleted(pod)) => Some(Ok(WorkloadEvent::Deleted {
                        pod: pod.metadata.name.unwrap_or_default(),
                    })),
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(response)) => Some(Err(kube_client::Error::Api(response).into())),
                    Err(err) => Some(Err(err.into())),
                }
            })
            .boxed())
    }

    async fn delete_resources(&self, records: &[ResourceRecord], wait: bool) -> Result<()> {
        let deletes: Vec<_> = records
            .iter()
            .map(|record| {
                let api = self.dynamic_api(&api_resource(record), record.namespace.as_deref());
                let (kind, name) = (record.kind.clone(), record.name.clone());
                async move { self.delete_object(&api, &kind, &name, wait).await }.boxed()
            })
            .collect();
        futures::stream::iter(deletes).buffer_unordered(8).try_collect().await
    }

    #[tracing::instrument(level = "debug", err, skip(self, object))]
    async fn apply_manifest(&self, object: serde_json::Value) -> Result<ResourceRecord> {
        let object: DynamicObject = serde_json::from_value(object)?;
        let types = object
            .types
            .as_ref()
            .ok_or_else(|| PlatformError::InvalidResource("missing apiVersion or kind".to_owned()))?;
        let gvk = GroupVersionKind::try_from(types).map_err(|err| PlatformError::InvalidResource(err.to_string()))?;
        let name = object
            .metadata
            .name
            .clone()
            .ok_or_else(|| PlatformError::InvalidResource(format!("{} is missing metadata.name", types.kind)))?;
        let (resource, capabilities) = self.deadline(discovery::pinned_kind(&self.client, &gvk)).await?;
        let api = if matches!(capabilities.scope, Scope::Namespaced) {
            if let Some(namespace) = &object.metadata.namespace {
                if namespace != &self.namespace {
                    warn!(code = "foreign_namespace", %namespace, current = %self.namespace, "{} {} names namespace {}", types.kind, name, namespace);
                }
            }
            self.dynamic_api(&resource, object.metadata.namespace.as_deref())
        } else {
            Api::all_with(self.client.clone(), &resource)
        };
        let applied = self
            .deadline(api.patch(&name, &apply_params(), &Patch::Apply(&object)))
            .await?;
        info!(code = "manifest_applied", kind = %types.kind, %name);
        let mut record = ResourceRecord::from_dynamic(&applied, &resource.plural);
        record.kind = resource.kind.clone();
        record.api_version = resource.api_version.clone();
        Ok(record)
    }
}

/// Keeps the forwarder alive for as long as its stream is in use
struct KubeTunnel {
    stream: TunnelStream,
    _forwarder: Box<Portforwarder>,
}

impl AsyncRead for KubeTunnel {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for KubeTunnel {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus},
        apimachinery::pkg::apis::meta::v1::{StatusCause, StatusDetails},
    };

    use super::*;

    fn pod_with(phase: &str, containers: Vec<ContainerStatus>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some("web-app".to_owned());
        pod.status = Some(PodStatus {
            phase: Some(phase.to_owned()),
            container_statuses: Some(containers),
            ..Default::default()
        });
        pod
    }

    fn container(ready: bool, waiting: Option<&str>) -> ContainerStatus {
        ContainerStatus {
            name: "web".to_owned(),
            image: "node:18".to_owned(),
            ready,
            state: waiting.map(|reason| ContainerState {
                waiting: Some(ContainerStateWaiting {
                    reason: Some(reason.to_owned()),
                    message: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn running_and_ready_pod_is_ready() {
        let pod = pod_with("Running", vec![container(true, None)]);
        assert_eq!(pod_readiness(&pod).unwrap().unwrap().phase, PodPhase::Running);
    }

    #[test]
    fn pending_pod_is_not_ready() {
        let pod = pod_with("Pending", vec![container(false, Some("ContainerCreating"))]);
        assert!(pod_readiness(&pod).unwrap().is_none());
    }

    #[test]
    fn pull_failure_is_image_unresolved() {
        let pod = pod_with("Pending", vec![container(false, Some("ImagePullBackOff"))]);
        match pod_readiness(&pod) {
            Err(PlatformError::ImageUnresolved { image, .. }) => assert_eq!(image, "node:18"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn exit_code_from_status_causes() {
        let status = Status {
            status: Some("Failure".to_owned()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".to_owned()),
                    message: Some("3".to_owned()),
                    field: None,
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code(Some(status), "web").unwrap(), 3);
        let success = Status {
            status: Some("Success".to_owned()),
            ..Default::default()
        };
        assert_eq!(exit_code(Some(success), "web").unwrap(), 0);
        assert!(exit_code(None, "web").is_err());
    }

    #[test]
    fn api_resource_splits_group() {
        let record = ResourceRecord {
            kind: "Deployment".to_owned(),
            api_version: "apps/v1".to_owned(),
            resource: "deployments".to_owned(),
            name: "api".to_owned(),
            namespace: None,
            labels: Default::default(),
            annotations: Default::default(),
            owner_refs: Vec::new(),
        };
        let resource = api_resource(&record);
        assert_eq!(resource.group, "apps");
        assert_eq!(resource.version, "v1");
        assert_eq!(resource.plural, "deployments");
    }

    fn unreachable_backend() -> ClusterBackend {
        let config = kube_client::Config::new("http://127.0.0.1:9".parse().unwrap());
        ClusterBackend {
            client: Client::try_from(config).unwrap(),
            namespace: "dev".to_owned(),
            timeout: Duration::from_secs(5),
        }
    }

    fn claim(name: &str) -> ResourceRecord {
        ResourceRecord {
            kind: "PersistentVolumeClaim".to_owned(),
            api_version: "v1".to_owned(),
            resource: "persistentvolumeclaims".to_owned(),
            name: name.to_owned(),
            namespace: None,
            labels: Default::default(),
            annotations: Default::default(),
            owner_refs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn delete_resources_runs_every_delete() {
        let backend = unreachable_backend();
        backend.delete_resources(&[], true).await.unwrap();

        let records = vec![claim("web-data"), claim("web-cache")];
        let err = backend.delete_resources(&records, false).await.unwrap_err();
        assert!(matches!(err, PlatformError::Unavailable { .. } | PlatformError::Timeout(_)));
    }
}
