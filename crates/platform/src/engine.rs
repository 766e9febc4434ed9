use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    env,
    ffi::OsStr,
    io::Write as _,
    path::PathBuf,
    pin::Pin,
    process::{Output, Stdio},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures::{prelude::*, stream::BoxStream};
use odo_core::{labels, labels::Selector, PlatformKind};
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
};
use tracing::{debug, info};

use crate::{
    resource::{check_ownership, sort_for_display},
    ExecOutput, ExecRequest, ForwardingMode, PlatformClient, PlatformError, PodChange, PodInfo, PodPhase, PodSpec,
    ResourceRecord, Result, TunnelStream, WorkloadEvent, KIND_ENGINE_VOLUME, KIND_POD,
};

pub const PODMAN_CMD_VAR: &str = "PODMAN_CMD";

// Exit status podman itself uses for failures that are not the container's.
const ENGINE_FAILURE_STATUS: i32 = 125;

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl EngineOptions {
    /// Uses `$PODMAN_CMD` when set, else `podman` from the search path
    pub fn from_env(timeout: Duration) -> EngineOptions {
        EngineOptions {
            program: env::var_os(PODMAN_CMD_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("podman")),
            timeout,
        }
    }
}

pub struct EngineBackend {
    cli: PodmanCli,
}

#[derive(Clone)]
struct PodmanCli {
    program: PathBuf,
    timeout: Duration,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct PodInspect {
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

impl EngineBackend {
    pub async fn connect(options: EngineOptions) -> Result<EngineBackend> {
        let program = which::which(&options.program).map_err(|err| PlatformError::Unavailable {
            message: format!("container engine {:?} not found: {}", options.program, err),
        })?;
        let cli = PodmanCli {
            program,
            timeout: options.timeout,
        };
        let output = cli.run(["version", "--format", "{{.Client.Version}}"], None).await?;
        if !output.status.success() {
            return Err(PlatformError::Unavailable {
                message: format!(
                    "{} is not usable: {}",
                    cli.program.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        debug!(
            code = "engine_connected",
            program = %cli.program.display(),
            version = %String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(EngineBackend { cli })
    }
}

impl PodmanCli {
    async fn run<I, S>(&self, args: I, stdin: Option<&[u8]>) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let run = async {
            let mut child = command.spawn()?;
            if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(input).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };
        match tokio::time::timeout(self.timeout, run).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(PlatformError::Timeout(self.timeout)),
        }
    }

    async fn run_checked<I, S>(&self, args: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self.run(args, None).await?;
        if !output.status.success() {
            return Err(self.failure(&output));
        }
        Ok(output.stdout)
    }

    fn failure(&self, output: &Output) -> PlatformError {
        PlatformError::Engine {
            program: self.program.display().to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        }
    }

    async fn exists(&self, noun: &str, name: &str) -> Result<bool> {
        let output = self.run([noun, "exists", name], None).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(self.failure(&output)),
        }
    }

    async fn inspect_pod(&self, name: &str) -> Result<Option<PodInspect>> {
        if !self.exists("pod", name).await? {
            return Ok(None);
        }
        let stdout = self.run_checked(["pod", "inspect", "--format", "json", name]).await?;
        parse_inspect(&stdout).map(Some)
    }

    async fn list(&self, noun: &str, selector: &Selector) -> Result<Vec<ListEntry>> {
        let mut args = vec![noun.to_owned()];
        args.push(if noun == "pod" { "ps" } else { "ls" }.to_owned());
        args.extend(["--format".to_owned(), "json".to_owned()]);
        for (key, value) in selector.terms() {
            args.push("--filter".to_owned());
            args.push(format!("label={}={}", key, value));
        }
        let stdout = self.run_checked(&args).await?;
        if stdout.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let entries: Option<Vec<ListEntry>> = serde_json::from_slice(&stdout)?;
        Ok(entries
            .unwrap_or_default()
            .into_iter()
            .filter(|entry| selector.matches(entry.labels.as_ref().unwrap_or(&BTreeMap::new())))
            .collect())
    }

    async fn pod_phases(&self, selector: &Selector) -> Result<HashMap<String, PodPhase>> {
        Ok(self
            .list("pod", selector)
            .await?
            .into_iter()
            .map(|entry| {
                let phase = PodPhase::parse(entry.status.as_deref().unwrap_or_default());
                (entry.name, phase)
            })
            .collect())
    }
}

fn parse_inspect(stdout: &[u8]) -> Result<PodInspect> {
    // Newer releases wrap the document in an array.
    let value: serde_json::Value = serde_json::from_slice(stdout)?;
    let value = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        other => other,
    };
    Ok(serde_json::from_value(value)?)
}

fn container_name(pod: &str, container: &str) -> String {
    format!("{}-{}", pod, container)
}

fn record(kind: &str, entry: ListEntry) -> ResourceRecord {
    ResourceRecord {
        kind: kind.to_owned(),
        api_version: "v1".to_owned(),
        resource: String::new(),
        name: entry.name,
        namespace: None,
        labels: entry.labels.unwrap_or_default(),
        annotations: Default::default(),
        owner_refs: Vec::new(),
    }
}

fn looks_like_pull_failure(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    ["pull", "manifest unknown", "image not known", "initializing source", "unauthorized"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

fn line_stream<R>(reader: Option<R>) -> BoxStream<'static, Result<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let lines = reader.map(|reader| BufReader::new(reader).lines());
    futures::stream::unfold(lines, |lines| async move {
        let mut lines = lines?;
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), Some(lines))),
            Ok(None) => None,
            Err(err) => Some((Err(err.into()), None)),
        }
    })
    .boxed()
}

/// Keeps a subprocess alive while its output is consumed; dropping the stream kills it
struct ChildStream<T> {
    _child: Child,
    inner: BoxStream<'static, T>,
}

impl<T> Stream for ChildStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().inner.poll_next_unpin(cx)
    }
}

struct WatchState {
    cli: PodmanCli,
    selector: Selector,
    events: BoxStream<'static, Result<String>>,
    known: HashMap<String, PodPhase>,
    pending: VecDeque<WorkloadEvent>,
    primed: bool,
}

impl WatchState {
    /// Re-lists matching pods and queues an event for every difference from the last listing
    async fn refresh(&mut self) -> Result<()> {
        let current = self.cli.pod_phases(&self.selector).await?;
        for (pod, phase) in &current {
            if self.known.get(pod) != Some(phase) {
                self.pending.push_back(WorkloadEvent::Changed {
                    pod: pod.clone(),
                    phase: *phase,
                });
            }
        }
        for pod in self.known.keys() {
            if !current.contains_key(pod) {
                self.pending.push_back(WorkloadEvent::Deleted { pod: pod.clone() });
            }
        }
        self.known = current;
        Ok(())
    }
}

#[async_trait]
impl PlatformClient for EngineBackend {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Podman
    }

    fn namespace(&self) -> Option<&str> {
        None
    }

    fn forwarding(&self) -> ForwardingMode {
        ForwardingMode::PublishedPorts
    }

    #[tracing::instrument(level = "debug", err, skip(self, spec), fields(pod = %spec.name))]
    async fn create_or_replace_pod(&self, spec: &PodSpec) -> Result<PodChange> {
        let desired_hash = spec.spec_hash();
        let change = match self.cli.inspect_pod(&spec.name).await? {
            Some(existing) => {
                let existing_labels = existing.labels.unwrap_or_default();
                check_ownership("Pod", &spec.name, &existing_labels, &spec.labels)?;
                if existing_labels.get(labels::SPEC_HASH) == Some(&desired_hash)
                    && PodPhase::parse(&existing.state) == PodPhase::Running
                {
                    debug!(code = "pod_unchanged", pod = %spec.name);
                    return Ok(PodChange::Unchanged);
                }
                info!(code = "pod_replaced", pod = %spec.name, "pod spec changed, replacing pod");
                self.cli.run_checked(["pod", "rm", "--force", &spec.name]).await?;
                PodChange::Replaced
            }
            None => PodChange::Created,
        };

        let mut volume_labels = spec.labels.clone();
        volume_labels.remove(labels::SPEC_HASH);
        for (claim, _) in spec.claims() {
            if !self.cli.exists("volume", claim).await? {
                let mut args = vec!["volume".to_owned(), "create".to_owned()];
                for (key, value) in &volume_labels {
                    args.push("--label".to_owned());
                    args.push(format!("{}={}", key, value));
                }
                args.push(claim.to_owned());
                self.cli.run_checked(&args).await?;
                debug!(code = "volume_created", volume = %claim);
            }
        }

        let document = serde_yaml::to_string(&spec.to_kube_pod(None))
            .map_err(|err| PlatformError::InvalidResource(err.to_string()))?;
        let mut manifest = tempfile::Builder::new().prefix("odo-pod-").suffix(".yaml").tempfile()?;
        manifest.write_all(document.as_bytes())?;
        manifest.flush()?;

        let output = self
            .cli
            .run(
                [OsStr::new("play"), OsStr::new("kube"), manifest.path().as_os_str()],
                None,
            )
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
            if looks_like_pull_failure(&stderr) {
                let image = spec
                    .containers
                    .iter()
                    .map(|container| container.image.as_str())
                    .find(|image| stderr.contains(image))
                    .or_else(|| spec.containers.first().map(|container| container.image.as_str()))
                    .unwrap_or_default();
                return Err(PlatformError::ImageUnresolved {
                    image: image.to_owned(),
                    reason: stderr,
                });
            }
            return Err(self.cli.failure(&output));
        }
        Ok(change)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<PodInfo>> {
        Ok(self.cli.inspect_pod(name).await?.map(|inspect| PodInfo {
            phase: PodPhase::parse(&inspect.state),
            spec_hash: inspect
                .labels
                .as_ref()
                .and_then(|labels| labels.get(labels::SPEC_HASH).cloned()),
            name: inspect.name,
        }))
    }

    #[tracing::instrument(level = "debug", err, skip(self))]
    async fn wait_for_pod_ready(&self, name: &str, timeout: Duration) -> Result<PodInfo> {
        let wait = async {
            loop {
                if let Some(info) = self.get_pod(name).await? {
                    match info.phase {
                        PodPhase::Running => return Ok(info),
                        PodPhase::Failed | PodPhase::Succeeded => {
                            return Err(PlatformError::PodFailed {
                                pod: name.to_owned(),
                                reason: format!("pod phase is {:?}", info.phase),
                            })
                        }
                        _ => {}
                    }
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout(timeout)),
        }
    }

    async fn list_resources_by_selector(
        &self,
        selector: &Selector,
        _namespace: Option<&str>,
    ) -> Result<Vec<ResourceRecord>> {
        let mut records: Vec<ResourceRecord> = self
            .cli
            .list("pod", selector)
            .await?
            .into_iter()
            .map(|entry| record(KIND_POD, entry))
            .collect();
        records.extend(
            self.cli
                .list("volume", selector)
                .await?
                .into_iter()
                .map(|entry| record(KIND_ENGINE_VOLUME, entry)),
        );
        sort_for_display(&mut records);
        Ok(records)
    }

    #[tracing::instrument(level = "debug", err, skip(self, request), fields(pod = %request.pod, container = %request.container))]
    async fn exec_in_container(&self, request: ExecRequest) -> Result<ExecOutput> {
        let mut args = vec!["exec".to_owned()];
        if request.stdin.is_some() {
            args.push("--interactive".to_owned());
        }
        args.push(container_name(&request.pod, &request.container));
        args.extend(request.command.iter().cloned());
        let output = self.cli.run(&args, request.stdin.as_deref()).await?;
        match output.status.code() {
            Some(ENGINE_FAILURE_STATUS) | None => Err(PlatformError::Exec {
                container: request.container.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }),
            Some(exit_code) => Ok(ExecOutput {
                exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
        }
    }

    async fn pod_logs(&self, pod: &str, container: &str, follow: bool) -> Result<BoxStream<'static, Result<String>>> {
        let mut command = Command::new(&self.cli.program);
        command.arg("logs");
        if follow {
            command.arg("--follow");
        }
        command
            .arg(container_name(pod, container))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let stdout = line_stream(child.stdout.take());
        let stderr = line_stream(child.stderr.take());
        Ok(ChildStream {
            _child: child,
            inner: futures::stream::select(stdout, stderr).boxed(),
        }
        .boxed())
    }

    async fn port_forward(&self, _pod: &str, _port: u16) -> Result<TunnelStream> {
        Err(PlatformError::Unsupported("port tunnelling"))
    }

    async fn watch_workload(&self, selector: &Selector) -> Result<BoxStream<'static, Result<WorkloadEvent>>> {
        let mut command = Command::new(&self.cli.program);
        command
            .args(["events", "--format", "json", "--filter", "type=pod", "--filter", "type=container"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let events = line_stream(child.stdout.take());
        let state = WatchState {
            cli: self.cli.clone(),
            selector: selector.clone(),
            events,
            known: HashMap::new(),
            pending: VecDeque::new(),
            primed: false,
        };
        let stream = futures::stream::unfold(Some(state), |state| async move {
            let mut state = state?;
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((Ok(event), Some(state)));
                }
                if !state.primed {
                    state.primed = true;
                } else {
                    match state.events.next().await {
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Some((Err(err), None)),
                        None => return None,
                    }
                }
                if let Err(err) = state.refresh().await {
                    return Some((Err(err), None));
                }
            }
        });
        Ok(ChildStream {
            _child: child,
            inner: stream.boxed(),
        }
        .boxed())
    }

    async fn delete_resources(&self, records: &[ResourceRecord], _wait: bool) -> Result<()> {
        // Engine removals are synchronous, so there is nothing further to wait for.
        for record in records {
            let args: [&str; 4] = match record.kind.as_str() {
                KIND_POD => ["pod", "rm", "--force", &record.name],
                KIND_ENGINE_VOLUME => ["volume", "rm", "--force", &record.name],
                other => {
                    debug!(code = "delete_skipped", kind = other, name = %record.name);
                    continue;
                }
            };
            let output = self.cli.run(args, None).await?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !output.status.success() && !stderr.contains("no such") {
                return Err(self.cli.failure(&output));
            }
            debug!(code = "resource_deleted", kind = %record.kind, name = %record.name);
        }
        Ok(())
    }

    async fn apply_manifest(&self, _object: serde_json::Value) -> Result<ResourceRecord> {
        Err(PlatformError::Unsupported("applying kubernetes manifests"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inspect_object_and_array_forms() {
        let object = br#"{"Name":"web-app","State":"Running","Labels":{"app":"app"}}"#;
        let array = br#"[{"Name":"web-app","State":"Degraded","Labels":null}]"#;
        let parsed = parse_inspect(object).unwrap();
        assert_eq!(parsed.name, "web-app");
        assert_eq!(parsed.labels.unwrap().get("app").map(String::as_str), Some("app"));
        let parsed = parse_inspect(array).unwrap();
        assert_eq!(parsed.state, "Degraded");
        assert!(parsed.labels.is_none());
    }

    #[test]
    fn pull_failures_recognised() {
        assert!(looks_like_pull_failure(
            "Error: initializing source docker://nope:latest: reading manifest latest"
        ));
        assert!(!looks_like_pull_failure("Error: pod already exists"));
    }

    #[tokio::test]
    async fn line_stream_splits_lines() {
        let input: &[u8] = b"one\ntwo\n";
        let lines: Vec<String> = line_stream(Some(input)).try_collect().await.unwrap();
        assert_eq!(lines, vec!["one", "two"]);
    }
}
