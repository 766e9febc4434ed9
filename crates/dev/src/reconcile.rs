//! One reconcile tick: bring the dev pod, its sources, its processes and the local forwards in line with the devfile

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Instant,
};

use tracing::{debug, info, warn};

use odo_core::{
    labels::{Mode, Selector},
    tracing::error_value,
    Cancellation, PlatformKind, SessionEnv,
};
use odo_devfile::{ComponentKind, Devfile, EventKind, GroupKind};
use odo_platform::{ForwardingMode, PlatformClient, PodChange, PodInfo, PodPhase, ResourceRecord};
use odo_session::{ForwardedPort, StateStore};
use odo_sync::{IgnoreRules, SyncEngine, SyncOutcome, SyncRequest};

use crate::{
    events::{DevEvent, Events},
    image::{auto_build_images, ImageBuilder},
    logs::follow_log,
    loopback::{self, LoopbackReport},
    options::{DevOptions, LoopbackPolicy},
    pod::{self, PodInputs, Relay, RELAY_PORT_BASE},
    portforward::{forward_targets, BindProbe, PortForwardManager, PortProbe},
    process::RemoteProcessController,
    runtime::{CommandRuntime, ExecContext, RunOutcome, RunRequest},
    status::{ComponentState, ComponentStatus},
    DevError,
};

/// Why a tick was scheduled
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Trigger {
    Startup,
    FilesChanged,
    WorkloadChanged,
    /// The user asked for a push; the run command restarts even if nothing changed
    PushNow,
    Retry,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TickOutcome {
    Ready,
    /// The pod spec changed during the tick (a relay was added) and another tick must follow at once
    Redeploy,
}

pub struct Reconciler {
    env: SessionEnv,
    options: DevOptions,
    platform: Arc<dyn PlatformClient>,
    runtime: CommandRuntime,
    sync: SyncEngine,
    forwards: PortForwardManager,
    store: StateStore,
    events: Events,
    devfile: Devfile,
    ignore: IgnoreRules,
    status: ComponentStatus,
    relays: Vec<Relay>,
    images_built: bool,
    unsupported_warned: bool,
    logs: Option<Cancellation>,
}

impl Reconciler {
    pub fn new(
        env: SessionEnv,
        options: DevOptions,
        platform: Arc<dyn PlatformClient>,
        images: Arc<dyn ImageBuilder>,
        store: StateStore,
        devfile: Devfile,
        events: Events,
    ) -> Reconciler {
        let processes = Arc::new(RemoteProcessController::new(
            platform.clone(),
            options.timeouts.process_grace,
            options.timeouts.platform,
        ));
        let runtime = CommandRuntime::new(
            env.clone(),
            platform.clone(),
            processes,
            images,
            events.clone(),
            options.timeouts.platform,
        )
        .with_image_registry(options.image_registry.clone());
        let forwards = forward_manager(&options, platform.clone(), Arc::new(BindProbe), events.clone());
        let ignore = IgnoreRules::load(&env.workspace_root, &options.ignore_patterns);
        Reconciler {
            sync: SyncEngine::new(platform.clone()),
            env,
            options,
            platform,
            runtime,
            forwards,
            store,
            events,
            devfile,
            ignore,
            status: ComponentStatus::new(),
            relays: Vec::new(),
            images_built: false,
            unsupported_warned: false,
            logs: None,
        }
    }

    pub fn with_port_probe(mut self, probe: Arc<dyn PortProbe>) -> Reconciler {
        self.forwards = forward_manager(&self.options, self.platform.clone(), probe, self.events.clone());
        self
    }

    pub fn env(&self) -> &SessionEnv {
        &self.env
    }

    pub fn status(&self) -> &ComponentStatus {
        &self.status
    }

    pub fn devfile(&self) -> &Devfile {
        &self.devfile
    }

    pub fn forwarded_ports(&self) -> Vec<ForwardedPort> {
        self.forwards.snapshot()
    }

    pub fn store_mut(&mut self) -> &mut StateStore {
        &mut self.store
    }

    /// Swaps in a re-read devfile; the next tick reconciles against it
    pub fn reload(&mut self, devfile: Devfile) {
        self.devfile = devfile;
        self.images_built = false;
        self.unsupported_warned = false;
        self.ignore = IgnoreRules::load(&self.env.workspace_root, &self.options.ignore_patterns);
    }

    pub fn mark_outdated(&mut self) {
        if self.status.state == ComponentState::Ready {
            self.status.state = ComponentState::SyncOutdated;
        }
    }

    #[tracing::instrument(level = "info", err, skip(self, cancel), fields(pod = %self.env.pod_name()))]
    pub async fn tick(&mut self, trigger: Trigger, cancel: &Cancellation) -> Result<TickOutcome, DevError> {
        let pod = self.env.pod_name();

        self.warn_unsupported();
        self.build_images(trigger, cancel).await?;

        let targets = forward_targets(&self.devfile, self.options.debug);
        let forwards = self.forwards.allocate(&targets)?;
        self.deploy(&pod, &forwards, cancel).await?;

        let synced = self.sync_sources(&pod, cancel).await?;
        self.post_start(&pod, cancel).await?;
        let restarted = self.run(&pod, synced.exec_required, trigger, cancel).await?;

        if restarted && self.platform.forwarding() == ForwardingMode::PublishedPorts && !forwards.is_empty() {
            if self.check_loopback(&pod, &forwards, cancel).await? {
                self.status.deployed_hash = None;
                return Ok(TickOutcome::Redeploy);
            }
        }

        let active = self.forwards.update(&pod, forwards).await?;
        if active != self.store.record().forwarded_ports {
            self.events.push(DevEvent::Forwarded(active.clone()));
        }
        self.status.publish_forwards(&active);
        self.store.set_forwarded_ports(active)?;

        self.status.state = ComponentState::Ready;
        self.events.push(DevEvent::Ready);
        info!(code = "tick_ready", ?trigger, restarted);
        Ok(TickOutcome::Ready)
    }

    /// Runs a command requested through the control API
    pub async fn run_command(&mut self, id: &str, cancel: &Cancellation) -> Result<(), DevError> {
        let pod = self.env.pod_name();
        let ctx = ExecContext {
            pod: self.status.deployed_hash.as_ref().map(|_| pod.as_str()),
            mode: Mode::Dev,
            cancel,
        };
        self.events.progress(format!("Executing command {}", id));
        self.runtime.execute_id(&self.devfile, id, ctx).await?;
        Ok(())
    }

    /// Undoes everything the session created
    ///
    /// Runs `preStop` commands, stops supervised processes, closes the local forwards, deletes the workload and then
    /// its volumes, and finally releases the session record. Failures are logged and the remaining steps still run;
    /// the first failure is returned.
    #[tracing::instrument(level = "info", err, skip(self, cancel), fields(pod = %self.env.pod_name()))]
    pub async fn teardown(mut self, cancel: &Cancellation) -> Result<Vec<ResourceRecord>, DevError> {
        let pod = self.env.pod_name();
        let mut first_error: Option<DevError> = None;
        let mut record_error = |err: DevError, step: &'static str| {
            warn!(code = "teardown_step_failed", step, error = error_value(&err));
            if first_error.is_none() {
                first_error = Some(err);
            }
        };

        if let Some(logs) = self.logs.take() {
            logs.cancel();
        }

        if self.status.deployed_hash.is_some() {
            let ctx = ExecContext {
                pod: Some(&pod),
                mode: Mode::Dev,
                cancel,
            };
            for id in self.devfile.events(EventKind::PreStop) {
                self.events.progress(format!("Executing pre-stop command {}", id));
                if let Err(err) = self.runtime.execute_id(&self.devfile, id, ctx).await {
                    record_error(err.into(), "pre_stop");
                }
            }
            if let Err(err) = self
                .runtime
                .stop_processes(&pod, &self.status.running_commands, cancel)
                .await
            {
                record_error(err.into(), "stop_processes");
            }
        }
        if !self.devfile.events(EventKind::PostStop).is_empty() {
            debug!(code = "post_stop_skipped", commands = ?self.devfile.events(EventKind::PostStop));
        }

        self.forwards.stop_all().await;

        self.events.progress(format!("Deleting resources of component {}", self.env.component));
        let selector = Selector::component(&self.env.component, Some(Mode::Dev));
        let removed = match cancel
            .run_with_deadline(self.options.timeouts.teardown, self.platform.tear_down(&selector, false))
            .await
        {
            Ok(Ok(removed)) => removed,
            Ok(Err(err)) => {
                record_error(err.into(), "tear_down");
                Vec::new()
            }
            Err(err) => {
                record_error(err.into(), "tear_down");
                Vec::new()
            }
        };
        for record in &removed {
            info!(code = "resource_deleted", kind = %record.kind, name = %record.name);
        }

        if let Err(err) = self.store.release() {
            record_error(err.into(), "release_state");
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(removed),
        }
    }

    fn warn_unsupported(&mut self) {
        if self.unsupported_warned {
            return;
        }
        self.unsupported_warned = true;
        if self.platform.kind() != PlatformKind::Podman {
            return;
        }
        for component in &self.devfile.components {
            if let ComponentKind::Kubernetes(_) | ComponentKind::Openshift(_) = component.kind {
                warn!(code = "component_unsupported", component = %component.name);
                self.events.warning(format!(
                    "{} component {:?} is not supported on podman and will be ignored",
                    component.kind.type_name(),
                    component.name
                ));
            }
        }
        if !self.devfile.events(EventKind::PreStart).is_empty() {
            self.events
                .warning("preStart events are not supported on podman and will be ignored");
        }
    }

    async fn build_images(&mut self, trigger: Trigger, cancel: &Cancellation) -> Result<(), DevError> {
        if self.images_built && trigger != Trigger::PushNow {
            return Ok(());
        }
        let components: Vec<String> = auto_build_images(&self.devfile)
            .into_iter()
            .map(|(component, _)| component.name.clone())
            .collect();
        for component in components {
            self.runtime.build_image(&self.devfile, &component, cancel).await?;
        }
        self.images_built = true;
        Ok(())
    }

    async fn deploy(&mut self, pod: &str, forwards: &[ForwardedPort], cancel: &Cancellation) -> Result<(), DevError> {
        let published = match self.platform.forwarding() {
            ForwardingMode::PublishedPorts => PortForwardManager::published(forwards, self.forwards.address()),
            ForwardingMode::Tunnel => BTreeMap::new(),
        };
        let built_images = self.runtime.built_images();
        let spec = pod::materialize(
            &self.devfile,
            &PodInputs {
                env: &self.env,
                mode: Mode::Dev,
                ephemeral: self.options.ephemeral,
                published: &published,
                relays: &self.relays,
                built_images: &built_images,
            },
        );
        let hash = spec.spec_hash();
        let timeout = self.options.timeouts.platform;

        if self.status.deployed_hash.as_deref() == Some(hash.as_str()) {
            match cancel.run_with_deadline(timeout, self.platform.get_pod(pod)).await?? {
                Some(PodInfo {
                    phase: PodPhase::Running,
                    ..
                }) => return Ok(()),
                info => {
                    warn!(code = "pod_not_running", pod, phase = ?info.map(|info| info.phase));
                    self.forget_pod(pod);
                }
            }
        }

        let change = cancel
            .run_with_deadline(timeout, self.platform.create_or_replace_pod(&spec))
            .await??;
        match change {
            PodChange::Unchanged => debug!(code = "pod_unchanged", pod),
            PodChange::Created | PodChange::Replaced => {
                info!(code = "pod_deployed", pod, ?change, hash = %hash);
                self.events.progress(format!("Deploying pod {}", pod));
                self.forget_pod(pod);
            }
        }

        self.events.progress("Waiting for the dev pod to be running");
        let ready = self.options.timeouts.pod_ready;
        cancel
            .run_with_deadline(ready, self.platform.wait_for_pod_ready(pod, ready))
            .await??;
        self.status.deployed_hash = Some(hash);
        Ok(())
    }

    // Everything known about the previous pod's contents is now stale.
    fn forget_pod(&mut self, pod: &str) {
        self.status.pod_replaced();
        self.status.deployed_hash = None;
        self.sync.invalidate(pod);
        self.runtime.processes().invalidate(pod);
        if let Some(logs) = self.logs.take() {
            logs.cancel();
        }
    }

    async fn sync_sources(&mut self, pod: &str, cancel: &Cancellation) -> Result<SyncOutcome, DevError> {
        let mut total = SyncOutcome::default();
        let mut targets = BTreeSet::new();
        for (component, container) in self.devfile.container_components() {
            if !container.mounts_sources() {
                continue;
            }
            // Containers mounting the project volume at the same path see the same files.
            let target_path = pod::projects_root(container).to_owned();
            if !targets.insert(target_path.clone()) {
                continue;
            }
            let request = SyncRequest {
                local_root: self.env.workspace_root.clone(),
                ignore: self.ignore.clone(),
                force_push: false,
                files: Vec::new(),
                pod: pod.to_owned(),
                container: component.name.clone(),
                target_path,
            };
            let outcome = match cancel.run(self.sync.sync(&request)).await? {
                Err(err) if err.is_transient() => {
                    warn!(code = "sync_retry", container = %component.name, error = error_value(&err));
                    cancel.run(self.sync.sync(&request)).await??
                }
                result => result?,
            };
            total.exec_required |= outcome.exec_required;
            total.transferred += outcome.transferred;
            total.deleted += outcome.deleted;
            total.bytes += outcome.bytes;
        }
        if total.transferred > 0 || total.deleted > 0 {
            self.events.progress(format!(
                "Synced {} changed and {} deleted files",
                total.transferred, total.deleted
            ));
        }
        self.status.last_sync_completed = Some(Instant::now());
        Ok(total)
    }

    async fn post_start(&mut self, pod: &str, cancel: &Cancellation) -> Result<(), DevError> {
        if self.status.post_start_events_done {
            return Ok(());
        }
        let ctx = ExecContext {
            pod: Some(pod),
            mode: Mode::Dev,
            cancel,
        };
        for id in self.devfile.events(EventKind::PostStart) {
            self.events.progress(format!("Executing post-start command {}", id));
            self.runtime.execute_id(&self.devfile, id, ctx).await?;
        }
        self.status.post_start_events_done = true;
        Ok(())
    }

    /// Returns whether the run command was (re)started
    async fn run(
        &mut self,
        pod: &str,
        files_changed: bool,
        trigger: Trigger,
        cancel: &Cancellation,
    ) -> Result<bool, DevError> {
        let (kind, command) = if self.options.debug {
            (GroupKind::Debug, self.options.debug_command.as_deref())
        } else {
            (GroupKind::Run, self.options.run_command.as_deref())
        };
        let previous = self.status.running_commands.clone();
        let request = RunRequest {
            kind,
            command,
            build_command: self.options.build_command.as_deref(),
            files_changed,
            force: trigger == Trigger::PushNow,
            previous: &previous,
        };
        let ctx = ExecContext {
            pod: Some(pod),
            mode: Mode::Dev,
            cancel,
        };
        let outcome = self.runtime.run_kind(&self.devfile, &request, ctx).await?;
        self.status.running_commands = outcome.processes().to_vec();
        match outcome {
            RunOutcome::AlreadyRunning { .. } => Ok(false),
            RunOutcome::Started { started_at, .. } => {
                self.status.run_executed = true;
                self.status.last_run_started = Some(started_at);
                self.follow_logs(pod, cancel);
                Ok(true)
            }
        }
    }

    fn follow_logs(&mut self, pod: &str, cancel: &Cancellation) {
        if let Some(previous) = self.logs.take() {
            previous.cancel();
        }
        let token = cancel.child();
        for (container, id) in &self.status.running_commands {
            tokio::spawn(follow_log(
                self.runtime.processes().clone(),
                pod.to_owned(),
                container.clone(),
                id.clone(),
                self.events.clone(),
                token.clone(),
            ));
        }
        self.logs = Some(token);
    }

    /// Applies the loopback policy; returns true when relays were added and the pod must be redeployed
    async fn check_loopback(
        &mut self,
        pod: &str,
        forwards: &[ForwardedPort],
        cancel: &Cancellation,
    ) -> Result<bool, DevError> {
        let mut by_container: BTreeMap<&str, Vec<u16>> = BTreeMap::new();
        for forward in forwards {
            let relayed = self
                .relays
                .iter()
                .any(|relay| relay.container == forward.container_name && relay.target_port == forward.container_port);
            if !relayed {
                by_container
                    .entry(forward.container_name.as_str())
                    .or_default()
                    .push(forward.container_port);
            }
        }

        let mut added = Vec::new();
        for (container, ports) in by_container {
            let report = self.probe_until_bound(pod, container, &ports, cancel).await?;
            if !report.unbound.is_empty() {
                debug!(code = "ports_not_listening", container, ports = ?report.unbound);
            }
            if report.loopback_only.is_empty() {
                continue;
            }
            match self.options.loopback {
                LoopbackPolicy::Reject => {
                    return Err(DevError::LoopbackBindingRejected {
                        container: container.to_owned(),
                        ports: report.loopback_only,
                    })
                }
                LoopbackPolicy::Ignore => {
                    warn!(code = "loopback_ignored", container, ports = ?report.loopback_only);
                    self.events.warning(format!(
                        "container {:?} listens only on localhost for port(s) {:?}; they will not be reachable",
                        container, report.loopback_only
                    ));
                }
                LoopbackPolicy::Redirect => {
                    for target_port in report.loopback_only {
                        let relay_port = RELAY_PORT_BASE + (self.relays.len() + added.len()) as u16;
                        added.push(Relay {
                            container: container.to_owned(),
                            target_port,
                            relay_port,
                        });
                    }
                }
            }
        }

        if added.is_empty() {
            return Ok(false);
        }
        info!(code = "loopback_relays_added", relays = ?added);
        self.events
            .progress("Relaying localhost-only ports through a side container");
        self.relays.extend(added);
        Ok(true)
    }

    // A freshly started application may not have bound its sockets yet.
    async fn probe_until_bound(
        &self,
        pod: &str,
        container: &str,
        ports: &[u16],
        cancel: &Cancellation,
    ) -> Result<LoopbackReport, DevError> {
        let attempts = self.options.loopback_probe_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let report = loopback::probe(
                self.platform.as_ref(),
                pod,
                container,
                ports,
                cancel,
                self.options.timeouts.platform,
            )
            .await?;
            if report.unbound.is_empty() || attempt >= attempts {
                return Ok(report);
            }
            cancel
                .run(tokio::time::sleep(self.options.loopback_probe_interval))
                .await?;
        }
    }
}

fn forward_manager(
    options: &DevOptions,
    platform: Arc<dyn PlatformClient>,
    probe: Arc<dyn PortProbe>,
    events: Events,
) -> PortForwardManager {
    PortForwardManager::new(platform, probe, options.address, options.port_range.clone(), events)
        .with_random_ports(options.random_ports)
        .with_overrides(options.port_overrides.clone())
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path, time::Duration};

    use odo_platform::KIND_POD;
    use odo_session::SystemProbe;
    use odo_test_util::fake::{Call, FakePlatform, FakeProcessState};

    use super::*;
    use crate::{
        error::ErrorClass,
        fixtures,
        image::ImageBuildRequest,
        pod::RELAY_CONTAINER,
        CommandError,
    };

    struct NoImages;

    #[async_trait::async_trait]
    impl ImageBuilder for NoImages {
        async fn build(&self, _request: &ImageBuildRequest) -> Result<(), CommandError> {
            Ok(())
        }
    }

    fn options() -> DevOptions {
        let mut options = DevOptions::default();
        options.loopback_probe_attempts = 2;
        options.loopback_probe_interval = Duration::from_millis(10);
        options.port_range = 32000..32500;
        options
    }

    fn reconciler(platform: Arc<FakePlatform>, root: &Path, source: &str, options: DevOptions) -> Reconciler {
        let env = fixtures::session_env(root, platform.kind());
        let store = StateStore::init(&env, Arc::new(SystemProbe)).unwrap();
        Reconciler::new(
            env,
            options,
            platform,
            Arc::new(NoImages),
            store,
            fixtures::devfile(source),
            Events::disabled(),
        )
    }

    fn workspace() -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("app.js"), "require('http').createServer().listen(3000)").unwrap();
        tmp
    }

    const LOOPBACK_3000: &str = "  sl  local_address rem_address   st
   0: 0100007F:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 1001
";

    #[tokio::test]
    async fn hello_sync() {
        odo_test_util::prep();
        let tmp = workspace();
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let mut reconciler = reconciler(platform.clone(), tmp.path(), fixtures::HELLO_DEVFILE, options());
        let cancel = Cancellation::new();

        assert_eq!(reconciler.tick(Trigger::Startup, &cancel).await.unwrap(), TickOutcome::Ready);

        assert_eq!(platform.pods().len(), 1);
        assert_eq!(platform.pods()[0].name, "web-app");
        assert!(platform.file("web-app", "/projects/app.js").is_some());
        assert_eq!(
            platform.process("web-app", "web", "r").map(|process| process.state),
            Some(FakeProcessState::Running)
        );
        assert_eq!(reconciler.status().state, ComponentState::Ready);
        assert!(reconciler.status().endpoints_forwarded.is_empty());

        let status = reconciler.status();
        assert!(status.last_run_started.unwrap() >= status.last_sync_completed.unwrap());
        reconciler.teardown(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn second_tick_without_changes_is_a_no_op() {
        odo_test_util::prep();
        let tmp = workspace();
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let mut reconciler = reconciler(platform.clone(), tmp.path(), fixtures::HELLO_DEVFILE, options());
        let cancel = Cancellation::new();
        reconciler.tick(Trigger::Startup, &cancel).await.unwrap();
        platform.clear_calls();

        reconciler.tick(Trigger::WorkloadChanged, &cancel).await.unwrap();

        let calls = platform.calls();
        assert!(calls.iter().all(|call| !matches!(call, Call::CreatePod { .. })), "{:?}", calls);
        assert!(calls.iter().any(|call| matches!(call, Call::GetPod { .. })));
        assert!(calls.iter().all(|call| match call {
            Call::Exec { command, .. } => command[0] != "rm" && !command.iter().any(|arg| arg.contains("tar -xf")),
            _ => true,
        }));
        assert_eq!(platform.process_starts("web-app", "web", "r"), 1);
        reconciler.teardown(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn source_change_restarts_run_command_after_sync() {
        odo_test_util::prep();
        let tmp = workspace();
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let mut reconciler = reconciler(platform.clone(), tmp.path(), fixtures::HELLO_DEVFILE, options());
        let cancel = Cancellation::new();
        reconciler.tick(Trigger::Startup, &cancel).await.unwrap();
        let first_run = reconciler.status().last_run_started.unwrap();

        fs::write(tmp.path().join("app.js"), "console.log('changed')").unwrap();
        reconciler.mark_outdated();
        assert_eq!(reconciler.status().state, ComponentState::SyncOutdated);
        reconciler.tick(Trigger::FilesChanged, &cancel).await.unwrap();

        assert_eq!(
            platform.file("web-app", "/projects/app.js").unwrap(),
            b"console.log('changed')".to_vec()
        );
        assert_eq!(platform.process_starts("web-app", "web", "r"), 2);
        let status = reconciler.status();
        assert!(status.last_run_started.unwrap() > first_run);
        assert!(status.last_run_started.unwrap() >= status.last_sync_completed.unwrap());
        reconciler.teardown(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn endpoint_forwarded_and_stable() {
        odo_test_util::prep();
        let tmp = workspace();
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let mut reconciler = reconciler(platform.clone(), tmp.path(), fixtures::ENDPOINT_DEVFILE, options());
        let cancel = Cancellation::new();

        reconciler.tick(Trigger::Startup, &cancel).await.unwrap();
        let first = reconciler.status().endpoints_forwarded.clone();
        let ports = &first["web"];
        assert_eq!(ports.len(), 1);
        assert!((32000..32500).contains(&ports[0]));
        assert_eq!(reconciler.store_mut().record().forwarded_ports[0].local_port, ports[0]);

        reconciler.tick(Trigger::PushNow, &cancel).await.unwrap();
        assert_eq!(reconciler.status().endpoints_forwarded, first);
        assert_eq!(platform.process_starts("web-app", "web", "r"), 2);
        assert!(platform.exec_scripts().iter().any(|script| script.ends_with("echo started")));
        reconciler.teardown(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn loopback_binding_rejected_by_default() {
        odo_test_util::prep();
        let tmp = workspace();
        let platform = FakePlatform::new(PlatformKind::Podman);
        platform.set_listeners("web-app", LOOPBACK_3000);
        let mut reconciler = reconciler(platform.clone(), tmp.path(), fixtures::ENDPOINT_DEVFILE, options());
        let cancel = Cancellation::new();

        let err = reconciler.tick(Trigger::Startup, &cancel).await.unwrap_err();
        match &err {
            DevError::LoopbackBindingRejected { container, ports } => {
                assert_eq!(container, "web");
                assert_eq!(ports, &vec![3000]);
            }
            other => panic!("expected a loopback rejection, got {:?}", other),
        }
        assert_eq!(err.class(), ErrorClass::Fatal);
        let hint = err.hint().unwrap();
        assert!(hint.contains("--ignore-localhost") && hint.contains("--forward-localhost"));
        reconciler.teardown(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn loopback_ports_relayed_on_request() {
        odo_test_util::prep();
        let tmp = workspace();
        let platform = FakePlatform::new(PlatformKind::Podman);
        platform.set_listeners("web-app", LOOPBACK_3000);
        let mut options = options();
        options.loopback = LoopbackPolicy::Redirect;
        let mut reconciler = reconciler(platform.clone(), tmp.path(), fixtures::ENDPOINT_DEVFILE, options);
        let cancel = Cancellation::new();

        assert_eq!(reconciler.tick(Trigger::Startup, &cancel).await.unwrap(), TickOutcome::Redeploy);
        platform.set_listeners("web-app", LOOPBACK_3000);
        assert_eq!(reconciler.tick(Trigger::Retry, &cancel).await.unwrap(), TickOutcome::Ready);

        let pod = &platform.pods()[0];
        let relay = pod.container(RELAY_CONTAINER).unwrap();
        assert_eq!(relay.ports[0].container_port, RELAY_PORT_BASE);
        let local_port = reconciler.status().endpoints_forwarded["web"][0];
        assert_eq!(relay.ports[0].host_port, Some(local_port));
        assert_eq!(pod.container("web").unwrap().ports[0].host_port, None);
        reconciler.teardown(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn unavailable_platform_is_transient() {
        odo_test_util::prep();
        let tmp = workspace();
        let platform = FakePlatform::new(PlatformKind::Cluster);
        platform.set_unavailable(1);
        let mut reconciler = reconciler(platform.clone(), tmp.path(), fixtures::HELLO_DEVFILE, options());
        let cancel = Cancellation::new();

        let err = reconciler.tick(Trigger::Startup, &cancel).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.hint().is_some());
        assert_eq!(reconciler.tick(Trigger::Retry, &cancel).await.unwrap(), TickOutcome::Ready);
        reconciler.teardown(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn crashed_run_command_restarted_on_next_tick() {
        odo_test_util::prep();
        let tmp = workspace();
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let mut reconciler = reconciler(platform.clone(), tmp.path(), fixtures::HELLO_DEVFILE, options());
        let cancel = Cancellation::new();
        reconciler.tick(Trigger::Startup, &cancel).await.unwrap();

        platform.exit_process("web-app", "web", "r", 1);
        reconciler.tick(Trigger::WorkloadChanged, &cancel).await.unwrap();
        assert_eq!(platform.process_starts("web-app", "web", "r"), 2);
        reconciler.teardown(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn teardown_order() {
        odo_test_util::prep();
        let tmp = workspace();
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let mut reconciler = reconciler(platform.clone(), tmp.path(), fixtures::ENDPOINT_DEVFILE, options());
        let cancel = Cancellation::new();
        reconciler.tick(Trigger::Startup, &cancel).await.unwrap();
        let local_port = reconciler.status().endpoints_forwarded["web"][0];
        let state_file = tmp.path().join(".odo").join(odo_session::state_file_name(4242));
        assert!(state_file.exists());
        platform.clear_calls();

        let removed = reconciler.teardown(&cancel).await.unwrap();

        let calls = platform.calls();
        let position = |predicate: &dyn Fn(&Call) -> bool| calls.iter().position(|call| predicate(call)).unwrap();
        let pre_stop = position(&|call| match call {
            Call::Exec { command, .. } => command.last().map(|arg| arg.ends_with("echo started")).unwrap_or(false),
            _ => false,
        });
        let stop = position(&|call| match call {
            Call::Exec { command, .. } => command.get(2).map(|verb| verb == "stop").unwrap_or(false),
            _ => false,
        });
        let delete_pod = position(&|call| match call {
            Call::Delete { resources, .. } => resources.iter().any(|resource| resource.starts_with(KIND_POD)),
            _ => false,
        });
        let delete_volumes = position(&|call| match call {
            Call::Delete { resources, .. } => resources.iter().any(|resource| resource.starts_with("PersistentVolumeClaim")),
            _ => false,
        });
        assert!(pre_stop < stop && stop < delete_pod && delete_pod < delete_volumes, "{:?}", calls);

        assert!(removed.iter().any(|record| record.kind == KIND_POD));
        assert!(platform.pods().is_empty());
        assert!(platform.resources().is_empty());
        assert!(std::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, local_port)).is_ok());
        assert!(!state_file.exists());
    }
}
