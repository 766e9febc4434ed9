//! Expands devfile commands into execution plans and runs them against the dev pod

use std::{
    borrow::Cow,
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{
    future::{self, BoxFuture},
    prelude::*,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use odo_core::{labels, labels::Mode, Cancellation, PlatformKind, SessionEnv};
use odo_devfile::{CommandKind, ComponentKind, Devfile, DevfileError, GroupKind, KubernetesResource, DEFAULT_PROJECTS_ROOT};
use odo_platform::{ExecRequest, PlatformClient};

use crate::{
    events::{DevEvent, Events},
    image::{build_context, image_tag, DockerfileCache, ImageBuildRequest, ImageBuilder},
    pod::projects_root,
    process::{ProcessSpec, ProcessStatus, RemoteProcessController},
    CommandError,
};

/// A single exec command with everything needed to run it
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ExecStep {
    pub id: String,
    pub component: String,
    pub command_line: String,
    pub working_dir: Option<String>,
    pub env: Vec<(String, String)>,
    pub hot_reload: bool,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum PlanNode {
    Exec(ExecStep),
    ApplyImage { id: String, component: String },
    ApplyK8s { id: String, component: String },
    Composite {
        id: String,
        parallel: bool,
        members: Vec<PlanNode>,
    },
}

impl PlanNode {
    pub fn id(&self) -> &str {
        match self {
            PlanNode::Exec(step) => &step.id,
            PlanNode::ApplyImage { id, .. } | PlanNode::ApplyK8s { id, .. } | PlanNode::Composite { id, .. } => id,
        }
    }

    /// Exec steps in execution order
    pub fn exec_steps(&self) -> Vec<&ExecStep> {
        let mut steps = Vec::new();
        self.collect_exec_steps(&mut steps);
        steps
    }

    fn collect_exec_steps<'a>(&'a self, steps: &mut Vec<&'a ExecStep>) {
        match self {
            PlanNode::Exec(step) => steps.push(step),
            PlanNode::Composite { members, .. } => {
                for member in members {
                    member.collect_exec_steps(steps);
                }
            }
            _ => {}
        }
    }
}

/// Expands `id` into a plan, rejecting composite cycles before anything runs
pub fn plan(devfile: &Devfile, id: &str) -> Result<PlanNode, CommandError> {
    check_cycles(devfile, id)?;
    build_node(devfile, id)
}

// Breadth-first over the composite graph; each queue entry is the path from the root.
fn check_cycles(devfile: &Devfile, root: &str) -> Result<(), CommandError> {
    let mut queue = VecDeque::new();
    queue.push_back(vec![root.to_owned()]);
    while let Some(path) = queue.pop_front() {
        let id = match path.last() {
            Some(id) => id,
            None => continue,
        };
        let command = devfile
            .command(id)
            .ok_or_else(|| CommandError::UnknownCommand(id.clone()))?;
        if let CommandKind::Composite(composite) = &command.kind {
            for member in &composite.commands {
                if let Some(start) = path.iter().position(|ancestor| ancestor == member) {
                    return Err(CommandError::CompositeCycle(path[start..].to_vec()));
                }
                let mut next = path.clone();
                next.push(member.clone());
                queue.push_back(next);
            }
        }
    }
    Ok(())
}

fn build_node(devfile: &Devfile, id: &str) -> Result<PlanNode, CommandError> {
    let command = devfile
        .command(id)
        .ok_or_else(|| CommandError::UnknownCommand(id.to_owned()))?;
    let component_kind = |name: &str| devfile.component(name).map(|component| &component.kind);
    match &command.kind {
        CommandKind::Exec(exec) => match component_kind(&exec.component) {
            Some(ComponentKind::Container(_)) => Ok(PlanNode::Exec(ExecStep {
                id: id.to_owned(),
                component: exec.component.clone(),
                command_line: exec.command_line.clone(),
                working_dir: exec.working_dir.clone(),
                env: exec.env.iter().map(|var| (var.name.clone(), var.value.clone())).collect(),
                hot_reload: exec.hot_reload_capable,
            })),
            _ => Err(CommandError::WrongComponent {
                id: id.to_owned(),
                component: exec.component.clone(),
                expected: "container",
            }),
        },
        CommandKind::Apply(apply) => match component_kind(&apply.component) {
            Some(ComponentKind::Image(_)) => Ok(PlanNode::ApplyImage {
                id: id.to_owned(),
                component: apply.component.clone(),
            }),
            Some(ComponentKind::Kubernetes(_) | ComponentKind::Openshift(_)) => Ok(PlanNode::ApplyK8s {
                id: id.to_owned(),
                component: apply.component.clone(),
            }),
            _ => Err(CommandError::WrongComponent {
                id: id.to_owned(),
                component: apply.component.clone(),
                expected: "image, kubernetes or openshift",
            }),
        },
        CommandKind::Composite(composite) => Ok(PlanNode::Composite {
            id: id.to_owned(),
            parallel: composite.parallel,
            members: composite
                .commands
                .iter()
                .map(|member| build_node(devfile, member))
                .collect::<Result<_, _>>()?,
        }),
    }
}

#[derive(Clone, Copy)]
pub struct ExecContext<'a> {
    /// The dev pod, absent for `deploy`
    pub pod: Option<&'a str>,
    pub mode: Mode,
    pub cancel: &'a Cancellation,
}

#[derive(Clone, Debug)]
pub struct RunRequest<'a> {
    pub kind: GroupKind,
    pub command: Option<&'a str>,
    pub build_command: Option<&'a str>,
    /// Sources changed since the running command started
    pub files_changed: bool,
    /// Restart even when nothing changed
    pub force: bool,
    /// Processes started by an earlier tick, as `(container, command id)`
    pub previous: &'a [(String, String)],
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum RunOutcome {
    AlreadyRunning {
        processes: Vec<(String, String)>,
    },
    Started {
        processes: Vec<(String, String)>,
        started_at: Instant,
    },
}

impl RunOutcome {
    pub fn processes(&self) -> &[(String, String)] {
        match self {
            RunOutcome::AlreadyRunning { processes } | RunOutcome::Started { processes, .. } => processes,
        }
    }
}

pub struct CommandRuntime {
    env: SessionEnv,
    platform: Arc<dyn PlatformClient>,
    processes: Arc<RemoteProcessController>,
    images: Arc<dyn ImageBuilder>,
    image_registry: Option<String>,
    dockerfiles: DockerfileCache,
    // Tag built in this session per devfile image name
    built: Mutex<BTreeMap<String, String>>,
    events: Events,
    timeout: Duration,
}

impl CommandRuntime {
    pub fn new(
        env: SessionEnv,
        platform: Arc<dyn PlatformClient>,
        processes: Arc<RemoteProcessController>,
        images: Arc<dyn ImageBuilder>,
        events: Events,
        timeout: Duration,
    ) -> CommandRuntime {
        CommandRuntime {
            env,
            platform,
            processes,
            images,
            image_registry: None,
            dockerfiles: DockerfileCache::default(),
            built: Mutex::new(BTreeMap::new()),
            events,
            timeout,
        }
    }

    pub fn with_image_registry(mut self, registry: Option<String>) -> CommandRuntime {
        self.image_registry = registry;
        self
    }

    pub fn with_dockerfile_cache(mut self, cache: DockerfileCache) -> CommandRuntime {
        self.dockerfiles = cache;
        self
    }

    pub fn processes(&self) -> &Arc<RemoteProcessController> {
        &self.processes
    }

    pub fn built_images(&self) -> BTreeMap<String, String> {
        self.built.lock().clone()
    }

    pub fn plan(&self, devfile: &Devfile, id: &str) -> Result<PlanNode, CommandError> {
        plan(devfile, id)
    }

    /// Runs a plan to completion; exec steps must exit before the next step starts
    pub fn execute<'a>(
        &'a self,
        devfile: &'a Devfile,
        node: &'a PlanNode,
        ctx: ExecContext<'a>,
    ) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            match node {
                PlanNode::Exec(step) => self.run_to_completion(devfile, step, ctx).await,
                PlanNode::ApplyImage { component, .. } => {
                    self.build_image(devfile, component, ctx.cancel).await?;
                    Ok(())
                }
                PlanNode::ApplyK8s { id, component } => self.apply_resources(devfile, id, component, ctx).await,
                PlanNode::Composite {
                    parallel: true, members, ..
                } => {
                    future::try_join_all(members.iter().map(|member| self.execute(devfile, member, ctx))).await?;
                    Ok(())
                }
                PlanNode::Composite { members, .. } => {
                    for member in members {
                        self.execute(devfile, member, ctx).await?;
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }

    /// Resolves and executes a command by id
    pub async fn execute_id(&self, devfile: &Devfile, id: &str, ctx: ExecContext<'_>) -> Result<(), CommandError> {
        let node = plan(devfile, id)?;
        self.execute(devfile, &node, ctx).await
    }

    /// Brings the run (or debug) command of `request.kind` up, building first when it has to restart
    #[tracing::instrument(level = "debug", err, skip(self, devfile, request, ctx), fields(kind = %request.kind))]
    pub async fn run_kind(
        &self,
        devfile: &Devfile,
        request: &RunRequest<'_>,
        ctx: ExecContext<'_>,
    ) -> Result<RunOutcome, CommandError> {
        let command = devfile.select_command(request.kind, request.command)?;
        let node = plan(devfile, &command.id)?;
        let steps = node.exec_steps();
        let processes: Vec<(String, String)> = steps
            .iter()
            .map(|step| (step.component.clone(), step.id.clone()))
            .collect();
        let pod = ctx.pod.ok_or_else(|| CommandError::NoWorkload { id: command.id.clone() })?;

        if !request.force && !steps.is_empty() {
            let restart_for_changes = request.files_changed && !steps.iter().all(|step| step.hot_reload);
            if !restart_for_changes {
                let mut all_running = true;
                for step in &steps {
                    if self.processes.status(pod, &step.component, &step.id, ctx.cancel).await? != ProcessStatus::Running {
                        all_running = false;
                        break;
                    }
                }
                if all_running {
                    debug!(code = "run_command_unchanged", command = %command.id);
                    return Ok(RunOutcome::AlreadyRunning { processes });
                }
            }
        }

        let mut to_stop: Vec<(String, String)> = request.previous.to_vec();
        for process in &processes {
            if !to_stop.contains(process) {
                to_stop.push(process.clone());
            }
        }
        for (container, id) in &to_stop {
            self.processes.stop(pod, container, id, ctx.cancel).await?;
        }

        match devfile.select_command(GroupKind::Build, request.build_command) {
            Ok(build) => {
                self.events
                    .progress(format!("Building your application in container {}", describe_target(devfile, build)));
                self.execute_id(devfile, &build.id, ctx).await?;
            }
            Err(DevfileError::CommandNotFound { name: None, .. }) => {
                debug!(code = "no_build_command");
            }
            Err(err) => return Err(err.into()),
        }

        let started_at = Instant::now();
        self.events
            .progress(format!("Executing the application (command: {})", command.id));
        self.start(devfile, &node, ctx).await?;
        Ok(RunOutcome::Started { processes, started_at })
    }

    /// Stops processes started through the supervisor
    pub async fn stop_processes(
        &self,
        pod: &str,
        processes: &[(String, String)],
        cancel: &Cancellation,
    ) -> Result<(), CommandError> {
        for (container, id) in processes {
            self.processes.stop(pod, container, id, cancel).await?;
        }
        Ok(())
    }

    /// Like `execute`, but exec steps are launched as supervised long-running processes
    fn start<'a>(
        &'a self,
        devfile: &'a Devfile,
        node: &'a PlanNode,
        ctx: ExecContext<'a>,
    ) -> BoxFuture<'a, Result<(), CommandError>> {
        async move {
            match node {
                PlanNode::Exec(step) => {
                    let pod = ctx.pod.ok_or_else(|| CommandError::NoWorkload { id: step.id.clone() })?;
                    let spec = ProcessSpec {
                        command_id: step.id.clone(),
                        command_line: step.command_line.clone(),
                        working_dir: working_dir(devfile, step),
                        env: step.env.clone(),
                    };
                    if self.processes.start(pod, &step.component, &spec, ctx.cancel).await? == ProcessStatus::Stopped {
                        info!(code = "run_command_exited", command = %step.id, "run command exited immediately");
                    }
                    Ok(())
                }
                PlanNode::Composite {
                    parallel: true, members, ..
                } => {
                    future::try_join_all(members.iter().map(|member| self.start(devfile, member, ctx))).await?;
                    Ok(())
                }
                PlanNode::Composite { members, .. } => {
                    for member in members {
                        self.start(devfile, member, ctx).await?;
                    }
                    Ok(())
                }
                _ => self.execute(devfile, node, ctx).await,
            }
        }
        .boxed()
    }

    async fn run_to_completion(&self, devfile: &Devfile, step: &ExecStep, ctx: ExecContext<'_>) -> Result<(), CommandError> {
        let pod = ctx.pod.ok_or_else(|| CommandError::NoWorkload { id: step.id.clone() })?;
        let script = shell_script(step, &working_dir(devfile, step));
        debug!(code = "exec_command", command = %step.id, container = %step.component, %script);
        let output = ctx
            .cancel
            .run(
                self.platform
                    .exec_in_container(ExecRequest::new(pod, &step.component, ["sh".to_owned(), "-c".to_owned(), script])),
            )
            .await??;

        let stdout = output.stdout_lossy();
        let stderr = output.stderr_lossy();
        for line in stdout.lines().chain(stderr.lines()) {
            self.events.push(DevEvent::Output {
                container: step.component.clone(),
                line: line.to_owned(),
            });
        }
        if !output.success() {
            return Err(CommandError::Failed {
                id: step.id.clone(),
                exit_code: output.exit_code,
                output: format!("{}{}", stdout, stderr),
            });
        }
        Ok(())
    }

    /// Builds an image component, returning the tag it was built as
    pub async fn build_image(&self, devfile: &Devfile, component: &str, cancel: &Cancellation) -> Result<String, CommandError> {
        let image = match devfile.component(component).map(|component| &component.kind) {
            Some(ComponentKind::Image(image)) => image,
            _ => {
                return Err(CommandError::WrongComponent {
                    id: component.to_owned(),
                    component: component.to_owned(),
                    expected: "image",
                })
            }
        };
        let tag = image_tag(&image.image_name, self.image_registry.as_deref());
        let devfile_dir = self.env.devfile_dir();
        let dockerfile = self.dockerfiles.resolve(&image.dockerfile.uri, devfile_dir).await?;
        let request = ImageBuildRequest {
            component: component.to_owned(),
            tag: tag.clone(),
            dockerfile,
            context: build_context(devfile_dir, image),
            args: image.dockerfile.args.clone(),
            push: self.platform.kind() == PlatformKind::Cluster,
        };
        self.events.progress(format!("Building image {}", tag));
        cancel.run(self.images.build(&request)).await??;
        self.built.lock().insert(image.image_name.clone(), tag.clone());
        Ok(tag)
    }

    async fn apply_resources(&self, devfile: &Devfile, id: &str, component: &str, ctx: ExecContext<'_>) -> Result<(), CommandError> {
        let resource = match devfile.component(component).map(|component| &component.kind) {
            Some(ComponentKind::Kubernetes(resource) | ComponentKind::Openshift(resource)) => resource,
            _ => {
                return Err(CommandError::WrongComponent {
                    id: id.to_owned(),
                    component: component.to_owned(),
                    expected: "kubernetes or openshift",
                })
            }
        };
        if self.platform.kind() == PlatformKind::Podman {
            warn!(code = "apply_unsupported", component, "kubernetes components are not supported on podman");
            self.events.warning(format!(
                "Kubernetes component {:?} is not supported on podman and was skipped",
                component
            ));
            return Ok(());
        }

        let source = self.resource_source(component, resource).await?;
        let ownership = labels::ownership_labels(&self.env.component, &self.env.app, ctx.mode);
        for mut object in parse_manifests(component, &source)? {
            stamp_labels(&mut object, &ownership);
            let record = ctx
                .cancel
                .run_with_deadline(self.timeout, self.platform.apply_manifest(object))
                .await??;
            info!(code = "resource_applied", kind = %record.kind, name = %record.name);
            self.events.progress(format!("Applied {} {}", record.kind, record.name));
        }
        Ok(())
    }

    async fn resource_source(&self, component: &str, resource: &KubernetesResource) -> Result<String, CommandError> {
        let invalid = |message: String| CommandError::InvalidResource {
            component: component.to_owned(),
            message,
        };
        match (&resource.inlined, &resource.uri) {
            (Some(inlined), _) => Ok(inlined.clone()),
            (None, Some(uri)) if uri.starts_with("http://") || uri.starts_with("https://") => {
                let response = reqwest::get(uri.as_str())
                    .await
                    .and_then(|response| response.error_for_status())
                    .map_err(|err| invalid(err.to_string()))?;
                response.text().await.map_err(|err| invalid(err.to_string()))
            }
            (None, Some(uri)) => {
                let path = self.env.devfile_dir().join(uri);
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|err| invalid(format!("failed to read {}: {}", path.display(), err)))
            }
            (None, None) => Err(invalid("neither `inlined` nor `uri` is set".to_owned())),
        }
    }
}

fn describe_target(devfile: &Devfile, command: &odo_devfile::Command) -> String {
    match &command.kind {
        CommandKind::Exec(exec) => exec.component.clone(),
        _ => devfile.name().to_owned(),
    }
}

fn working_dir(devfile: &Devfile, step: &ExecStep) -> String {
    match &step.working_dir {
        Some(dir) => dir.clone(),
        None => devfile
            .container_components()
            .find(|(component, _)| component.name == step.component)
            .map(|(_, container)| projects_root(container).to_owned())
            .unwrap_or_else(|| DEFAULT_PROJECTS_ROOT.to_owned()),
    }
}

/// `sh -c` script running a terminating exec step
///
/// The working directory is double-quoted rather than escaped so `$PROJECT_SOURCE` style references still expand.
pub fn shell_script(step: &ExecStep, working_dir: &str) -> String {
    let mut script = String::new();
    for (name, value) in &step.env {
        script.push_str(&format!(
            "export {}={}; ",
            name,
            shell_escape::unix::escape(Cow::from(value.as_str()))
        ));
    }
    script.push_str(&format!("cd \"{}\" && {}", working_dir, step.command_line));
    script
}

/// Splits a multi-document YAML manifest into JSON objects, skipping empty documents
pub fn parse_manifests(component: &str, source: &str) -> Result<Vec<Value>, CommandError> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(source) {
        let value = Value::deserialize(document).map_err(|err| CommandError::InvalidResource {
            component: component.to_owned(),
            message: err.to_string(),
        })?;
        match value {
            Value::Null => continue,
            Value::Object(_) => objects.push(value),
            _ => {
                return Err(CommandError::InvalidResource {
                    component: component.to_owned(),
                    message: "every document must be a mapping".to_owned(),
                })
            }
        }
    }
    Ok(objects)
}

fn stamp_labels(object: &mut Value, ownership: &BTreeMap<String, String>) {
    let metadata = match object.as_object_mut() {
        Some(object) => object.entry("metadata").or_insert_with(|| Value::Object(Map::new())),
        None => return,
    };
    let labels = match metadata.as_object_mut() {
        Some(metadata) => metadata.entry("labels").or_insert_with(|| Value::Object(Map::new())),
        None => return,
    };
    if let Some(labels) = labels.as_object_mut() {
        for (key, value) in ownership {
            labels.insert(key.clone(), Value::String(value.clone()));
        }
    }
}
