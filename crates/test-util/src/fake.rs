//! In-memory platform for exercising the dev loop without a cluster or engine
//!
//! The fake understands the handful of commands the loop execs: archive extraction, `cat`, `rm -rf`, the process
//! supervisor and the socket table probe. Every other `sh -c` script succeeds unless a failure was registered for it.

use std::{
    collections::BTreeMap,
    io::Read,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::{channel::mpsc, stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use odo_core::{labels::Selector, PlatformKind};
use odo_platform::{
    ExecOutput, ExecRequest, ForwardingMode, PlatformClient, PlatformError, PodChange, PodInfo, PodPhase, PodSpec,
    ResourceRecord, Result, TunnelStream, WorkloadEvent, KIND_CLAIM, KIND_ENGINE_VOLUME, KIND_POD,
};

const SUPERVISOR_SUFFIX: &str = "odo-supervisor.sh";

#[derive(Clone, PartialEq, Debug)]
pub enum Call {
    CreatePod { name: String, change: PodChange },
    GetPod { name: String },
    WaitReady { name: String },
    List { selector: String },
    Exec { pod: String, container: String, command: Vec<String> },
    Logs { pod: String, container: String },
    PortForward { pod: String, port: u16 },
    Watch { selector: String },
    /// Deleted resources as `Kind/name`
    Delete { resources: Vec<String>, wait: bool },
    Apply { kind: String, name: String },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FakeProcessState {
    Running,
    Stopped,
    Exited(i32),
}

#[derive(Clone, PartialEq, Debug)]
pub struct FakeProcess {
    pub command_line: String,
    pub working_dir: String,
    pub env: Vec<String>,
    pub state: FakeProcessState,
    pub starts: u32,
    pub log: Vec<u8>,
}

struct Failure {
    needle: String,
    exit_code: i32,
    output: String,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    pods: BTreeMap<String, PodSpec>,
    resources: Vec<ResourceRecord>,
    files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    processes: BTreeMap<(String, String, String), FakeProcess>,
    script_failures: Vec<Failure>,
    process_failures: Vec<Failure>,
    listeners: BTreeMap<String, String>,
    watchers: Vec<mpsc::UnboundedSender<Result<WorkloadEvent>>>,
    unavailable: u32,
}

pub struct FakePlatform {
    kind: PlatformKind,
    state: Mutex<State>,
}

impl FakePlatform {
    pub fn new(kind: PlatformKind) -> Arc<FakePlatform> {
        Arc::new(FakePlatform {
            kind,
            state: Mutex::new(State::default()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Bodies of every `sh -c` script run so far, in order
    pub fn exec_scripts(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Exec { command, .. } if command.len() == 3 && command[0] == "sh" && command[1] == "-c" => {
                    Some(command[2].clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Scripts whose body contains `needle` exit with `exit_code`, writing `stderr`
    pub fn fail_scripts_containing(&self, needle: &str, exit_code: i32, stderr: &str) {
        self.state.lock().script_failures.push(Failure {
            needle: needle.to_owned(),
            exit_code,
            output: stderr.to_owned(),
        });
    }

    /// Supervised commands with this id exit immediately with `exit_code`, leaving `log` behind
    pub fn fail_process(&self, command_id: &str, exit_code: i32, log: &str) {
        self.state.lock().process_failures.push(Failure {
            needle: command_id.to_owned(),
            exit_code,
            output: log.to_owned(),
        });
    }

    /// The next `count` pod deployments fail as if the platform were unreachable
    pub fn set_unavailable(&self, count: u32) {
        self.state.lock().unavailable = count;
    }

    /// Content `/proc/net/tcp` shows inside `pod`
    pub fn set_listeners(&self, pod: &str, table: &str) {
        self.state.lock().listeners.insert(pod.to_owned(), table.to_owned());
    }

    pub fn file(&self, pod: &str, path: &str) -> Option<Vec<u8>> {
        self.state.lock().files.get(pod)?.get(path).cloned()
    }

    pub fn files(&self, pod: &str) -> BTreeMap<String, Vec<u8>> {
        self.state.lock().files.get(pod).cloned().unwrap_or_default()
    }

    pub fn process(&self, pod: &str, container: &str, command_id: &str) -> Option<FakeProcess> {
        self.state
            .lock()
            .processes
            .get(&(pod.to_owned(), container.to_owned(), command_id.to_owned()))
            .cloned()
    }

    pub fn process_starts(&self, pod: &str, container: &str, command_id: &str) -> u32 {
        self.process(pod, container, command_id)
            .map(|process| process.starts)
            .unwrap_or(0)
    }

    /// Appends output to a supervised command's log
    pub fn append_output(&self, pod: &str, container: &str, command_id: &str, output: &str) {
        if let Some(process) = self.state.lock().processes.get_mut(&(
            pod.to_owned(),
            container.to_owned(),
            command_id.to_owned(),
        )) {
            process.log.extend_from_slice(output.as_bytes());
        }
    }

    /// Marks a running command as exited, as if the application crashed
    pub fn exit_process(&self, pod: &str, container: &str, command_id: &str, exit_code: i32) {
        if let Some(process) = self.state.lock().processes.get_mut(&(
            pod.to_owned(),
            container.to_owned(),
            command_id.to_owned(),
        )) {
            process.state = FakeProcessState::Exited(exit_code);
        }
    }

    pub fn pods(&self) -> Vec<PodSpec> {
        self.state.lock().pods.values().cloned().collect()
    }

    pub fn resources(&self) -> Vec<ResourceRecord> {
        self.state.lock().resources.clone()
    }

    /// Adds a resource created by someone else
    pub fn insert_resource(&self, record: ResourceRecord) {
        let mut state = self.state.lock();
        state
            .resources
            .retain(|existing| !(existing.kind == record.kind && existing.name == record.name));
        state.resources.push(record);
    }

    /// Delivers a workload event to every open watch
    pub fn emit(&self, event: WorkloadEvent) {
        let mut state = self.state.lock();
        if let WorkloadEvent::Deleted { pod } = &event {
            remove_pod(&mut state, pod);
        }
        state
            .watchers
            .retain(|watcher| watcher.unbounded_send(Ok(event.clone())).is_ok());
    }

    fn record(&self, call: Call) {
        self.state.lock().calls.push(call);
    }

    fn namespace_owned(&self) -> Option<String> {
        self.namespace().map(str::to_owned)
    }
}

fn resource_record(
    kind: &str,
    api_version: &str,
    name: &str,
    namespace: Option<String>,
    labels: &BTreeMap<String, String>,
) -> ResourceRecord {
    ResourceRecord {
        kind: kind.to_owned(),
        api_version: api_version.to_owned(),
        resource: String::new(),
        name: name.to_owned(),
        namespace,
        labels: labels.clone(),
        annotations: BTreeMap::new(),
        owner_refs: Vec::new(),
    }
}

fn remove_pod(state: &mut State, pod: &str) {
    state.pods.remove(pod);
    state.files.remove(pod);
    state.processes.retain(|(process_pod, _, _), _| process_pod != pod);
    state
        .resources
        .retain(|resource| !(resource.kind == KIND_POD && resource.name == pod));
}

fn exited(exit_code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> ExecOutput {
    ExecOutput {
        exit_code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

fn ok(stdout: impl Into<Vec<u8>>) -> ExecOutput {
    exited(0, stdout, Vec::new())
}

fn join_path(target: &str, relative: &str) -> String {
    let relative = relative.trim_start_matches("./");
    format!("{}/{}", target.trim_end_matches('/'), relative)
}

impl State {
    fn extract(&mut self, pod: &str, target: &str, stdin: &[u8]) -> ExecOutput {
        let mut archive = tar::Archive::new(stdin);
        let entries = match archive.entries() {
            Ok(entries) => entries,
            Err(err) => return exited(2, Vec::new(), err.to_string()),
        };
        let files = self.files.entry(pod.to_owned()).or_default();
        for entry in entries {
            let mut entry = match entry {
                Ok(entry) => entry,
                Err(err) => return exited(2, Vec::new(), err.to_string()),
            };
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = match entry.path() {
                Ok(path) => join_path(target, &path.to_string_lossy()),
                Err(err) => return exited(2, Vec::new(), err.to_string()),
            };
            let mut content = Vec::new();
            if let Err(err) = entry.read_to_end(&mut content) {
                return exited(2, Vec::new(), err.to_string());
            }
            files.insert(path, content);
        }
        ok(Vec::new())
    }

    fn cat(&self, pod: &str, path: &str) -> ExecOutput {
        match self.files.get(pod).and_then(|files| files.get(path)) {
            Some(content) => ok(content.clone()),
            None => exited(1, Vec::new(), format!("cat: {}: No such file or directory", path)),
        }
    }

    fn remove(&mut self, pod: &str, paths: &[&str]) -> ExecOutput {
        if let Some(files) = self.files.get_mut(pod) {
            for path in paths {
                let prefix = format!("{}/", path.trim_end_matches('/'));
                files.retain(|existing, _| existing != path && !existing.starts_with(&prefix));
            }
        }
        ok(Vec::new())
    }

    fn supervisor_installed(&self, pod: &str, script: &str) -> bool {
        self.files
            .get(pod)
            .map(|files| files.contains_key(script))
            .unwrap_or(false)
    }

    fn supervise(&mut self, pod: &str, container: &str, args: &[&str]) -> ExecOutput {
        let key = |id: &str| (pod.to_owned(), container.to_owned(), id.to_owned());
        match args {
            ["start", id, working_dir, command_line, env @ ..] => {
                let failure = self
                    .process_failures
                    .iter()
                    .find(|failure| failure.needle == *id)
                    .map(|failure| (failure.exit_code, failure.output.clone()));
                let process = self.processes.entry(key(*id)).or_insert_with(|| FakeProcess {
                    command_line: String::new(),
                    working_dir: String::new(),
                    env: Vec::new(),
                    state: FakeProcessState::Stopped,
                    starts: 0,
                    log: Vec::new(),
                });
                if process.state == FakeProcessState::Running {
                    return ok("running\n");
                }
                process.command_line = (*command_line).to_owned();
                process.working_dir = (*working_dir).to_owned();
                process.env = env.iter().map(|assignment| (*assignment).to_owned()).collect();
                process.starts += 1;
                match failure {
                    Some((exit_code, log)) => {
                        process.state = FakeProcessState::Exited(exit_code);
                        process.log = log.into_bytes();
                    }
                    None => {
                        process.state = FakeProcessState::Running;
                        process.log.clear();
                    }
                }
                ok("starting\n")
            }
            ["status", id] => match self.processes.get(&key(*id)).map(|process| process.state) {
                Some(FakeProcessState::Running) => ok("running\n"),
                Some(FakeProcessState::Stopped) => ok("stopped\n"),
                Some(FakeProcessState::Exited(code)) => ok(format!("exited {}\n", code)),
                None => ok("absent\n"),
            },
            ["stop", id, ..] => {
                if let Some(process) = self.processes.get_mut(&key(*id)) {
                    if process.state == FakeProcessState::Running {
                        process.state = FakeProcessState::Stopped;
                    }
                }
                ok("stopped\n")
            }
            ["stop-all", ..] => {
                for ((process_pod, _, _), process) in self.processes.iter_mut() {
                    if process_pod == pod && process.state == FakeProcessState::Running {
                        process.state = FakeProcessState::Stopped;
                    }
                }
                ok("stopped\n")
            }
            ["log", id, offset] => {
                let offset: usize = offset.parse().unwrap_or(0);
                match self.processes.get(&key(*id)) {
                    Some(process) if offset < process.log.len() => ok(process.log[offset..].to_vec()),
                    _ => ok(Vec::new()),
                }
            }
            _ => exited(2, Vec::new(), "unknown verb"),
        }
    }

    fn script(&self, script: &str) -> ExecOutput {
        match self.script_failures.iter().find(|failure| script.contains(&failure.needle)) {
            Some(failure) => exited(failure.exit_code, Vec::new(), failure.output.clone()),
            None => ok(Vec::new()),
        }
    }
}

#[async_trait]
impl PlatformClient for FakePlatform {
    fn kind(&self) -> PlatformKind {
        self.kind
    }

    fn namespace(&self) -> Option<&str> {
        match self.kind {
            PlatformKind::Cluster => Some("default"),
            PlatformKind::Podman => None,
        }
    }

    fn forwarding(&self) -> ForwardingMode {
        match self.kind {
            PlatformKind::Cluster => ForwardingMode::Tunnel,
            PlatformKind::Podman => ForwardingMode::PublishedPorts,
        }
    }

    async fn create_or_replace_pod(&self, spec: &PodSpec) -> Result<PodChange> {
        let namespace = self.namespace_owned();
        let mut state = self.state.lock();
        if state.unavailable > 0 {
            state.unavailable -= 1;
            return Err(PlatformError::Unavailable {
                message: "connection refused".to_owned(),
            });
        }
        let hash = spec.spec_hash();
        let change = match state.pods.get(&spec.name) {
            Some(existing) if existing.spec_hash() == hash => PodChange::Unchanged,
            Some(_) => PodChange::Replaced,
            None => PodChange::Created,
        };
        state.calls.push(Call::CreatePod {
            name: spec.name.clone(),
            change,
        });
        if change == PodChange::Unchanged {
            return Ok(change);
        }
        if change == PodChange::Replaced {
            remove_pod(&mut state, &spec.name);
        }
        let stamped = spec.stamped();
        state
            .resources
            .push(resource_record(KIND_POD, "v1", &spec.name, namespace.clone(), &stamped.labels));
        let (claim_kind, claim_version) = match self.kind {
            PlatformKind::Cluster => (KIND_CLAIM, "v1"),
            PlatformKind::Podman => (KIND_ENGINE_VOLUME, "podman/v1"),
        };
        for (claim, _) in spec.claims() {
            if !state
                .resources
                .iter()
                .any(|resource| resource.kind == claim_kind && resource.name == claim)
            {
                let claim_record = resource_record(claim_kind, claim_version, claim, namespace.clone(), &spec.labels);
                state.resources.push(claim_record);
            }
        }
        state.pods.insert(spec.name.clone(), spec.clone());
        Ok(change)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<PodInfo>> {
        let mut state = self.state.lock();
        state.calls.push(Call::GetPod { name: name.to_owned() });
        Ok(state.pods.get(name).map(|spec| PodInfo {
            name: name.to_owned(),
            phase: PodPhase::Running,
            spec_hash: Some(spec.spec_hash()),
        }))
    }

    async fn wait_for_pod_ready(&self, name: &str, _timeout: Duration) -> Result<PodInfo> {
        let mut state = self.state.lock();
        state.calls.push(Call::WaitReady { name: name.to_owned() });
        match state.pods.get(name) {
            Some(spec) => Ok(PodInfo {
                name: name.to_owned(),
                phase: PodPhase::Running,
                spec_hash: Some(spec.spec_hash()),
            }),
            None => Err(PlatformError::NotFound {
                kind: KIND_POD.to_owned(),
                name: name.to_owned(),
            }),
        }
    }

    async fn list_resources_by_selector(
        &self,
        selector: &Selector,
        _namespace: Option<&str>,
    ) -> Result<Vec<ResourceRecord>> {
        let mut state = self.state.lock();
        state.calls.push(Call::List {
            selector: selector.to_string(),
        });
        let mut records: Vec<ResourceRecord> = state
            .resources
            .iter()
            .filter(|resource| selector.matches(&resource.labels))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.display_order(b));
        Ok(records)
    }

    async fn exec_in_container(&self, request: ExecRequest) -> Result<ExecOutput> {
        let mut state = self.state.lock();
        state.calls.push(Call::Exec {
            pod: request.pod.clone(),
            container: request.container.clone(),
            command: request.command.clone(),
        });
        let args: Vec<&str> = request.command.iter().map(String::as_str).collect();
        let output = match args.as_slice() {
            ["sh", "-c", script, _, target] if script.contains("tar -xf -") => {
                let stdin = request.stdin.as_deref().unwrap_or_default();
                state.extract(&request.pod, *target, stdin)
            }
            ["cat", path] => state.cat(&request.pod, *path),
            ["rm", "-rf", "--", paths @ ..] => state.remove(&request.pod, paths),
            ["sh", script, verb @ ..] if script.ends_with(SUPERVISOR_SUFFIX) => {
                if state.supervisor_installed(&request.pod, *script) {
                    state.supervise(&request.pod, &request.container, verb)
                } else {
                    exited(127, Vec::new(), format!("sh: {}: not found", script))
                }
            }
            ["sh", "-c", script] if script.contains("/proc/net/tcp") => {
                ok(state.listeners.get(&request.pod).cloned().unwrap_or_default())
            }
            ["sh", "-c", script] => state.script(*script),
            _ => ok(Vec::new()),
        };
        Ok(output)
    }

    async fn pod_logs(&self, pod: &str, container: &str, _follow: bool) -> Result<BoxStream<'static, Result<String>>> {
        self.record(Call::Logs {
            pod: pod.to_owned(),
            container: container.to_owned(),
        });
        Ok(futures::stream::empty().boxed())
    }

    /// Tunnels echo every byte back
    async fn port_forward(&self, pod: &str, port: u16) -> Result<TunnelStream> {
        self.record(Call::PortForward {
            pod: pod.to_owned(),
            port,
        });
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let mut buffer = [0u8; 4096];
            loop {
                match server.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(count) => {
                        if server.write_all(&buffer[..count]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Ok(Box::new(client))
    }

    async fn watch_workload(&self, selector: &Selector) -> Result<BoxStream<'static, Result<WorkloadEvent>>> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock();
        state.calls.push(Call::Watch {
            selector: selector.to_string(),
        });
        state.watchers.push(tx);
        Ok(rx.boxed())
    }

    async fn delete_resources(&self, records: &[ResourceRecord], wait: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(Call::Delete {
            resources: records
                .iter()
                .map(|record| format!("{}/{}", record.kind, record.name))
                .collect(),
            wait,
        });
        for deleted in records {
            if deleted.kind == KIND_POD {
                remove_pod(&mut state, &deleted.name);
            }
            state
                .resources
                .retain(|resource| !(resource.kind == deleted.kind && resource.name == deleted.name));
        }
        Ok(())
    }

    async fn apply_manifest(&self, object: serde_json::Value) -> Result<ResourceRecord> {
        let text = |pointer: &str| {
            object
                .pointer(pointer)
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };
        let (kind, api_version, name) = (text("/kind"), text("/apiVersion"), text("/metadata/name"));
        if kind.is_empty() || name.is_empty() {
            return Err(PlatformError::InvalidResource(
                "manifest needs a kind and metadata.name".to_owned(),
            ));
        }
        let labels: BTreeMap<String, String> = object
            .pointer("/metadata/labels")
            .and_then(serde_json::Value::as_object)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(key, value)| Some((key.clone(), value.as_str()?.to_owned())))
                    .collect()
            })
            .unwrap_or_default();
        let applied = resource_record(&kind, &api_version, &name, self.namespace_owned(), &labels);
        self.record(Call::Apply {
            kind: kind.clone(),
            name: name.clone(),
        });
        self.insert_resource(applied.clone());
        Ok(applied)
    }
}
