use std::{
    collections::BTreeMap,
    future::Future,
    io::{self, Write},
    net::{IpAddr, Ipv4Addr},
    process,
    sync::Arc,
    time::Duration,
};

use anyhow::{bail, Result};
use clap::{CommandFactory, Parser, Subcommand};
use futures::{channel::mpsc, prelude::*};
use serde::Serialize;
use tokio::{signal, task::JoinHandle};
use tracing::debug;

use odo_cli_support::{
    console::{Console, ConsoleOptions},
    find_workspace, logging,
    preferences::Preferences,
    session_env, OutputOpts,
};
use odo_core::{labels::Mode, tracing::error_value, Cancellation, PlatformKind, SessionEnv};
use odo_dev::{
    delete_component, deploy, deploy_namespace, DeleteOptions, DeleteReport, DeployOptions, DeployReport, DevError,
    DevEvent, DevOptions, DevSession, EngineImageBuilder, ErrorClass, Events, LoopbackPolicy, PortOverride,
    SessionExit, StdinPrompt, Timeouts,
};
use odo_platform::{ClusterOptions, EngineOptions, Platform, PlatformClient};
use odo_session::SystemProbe;

const EXIT_FAILURE: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser)]
#[clap(name = "odo", version = "0.0.0")]
struct Opts {
    /// Enable debug level logging of odo itself
    #[clap(long = "debug-self", global = true)]
    debug_self: bool,

    #[clap(subcommand)]
    sub_command: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Run the component in development mode
    ///
    /// Builds and deploys the dev pod, syncs local sources into it, runs the build and run commands and forwards
    /// its endpoints to the local machine. Source changes are pushed until Ctrl+c, which removes everything the
    /// session created.
    Dev(DevOpts),
    /// Run the component's deploy command once
    Deploy(DeployOpts),
    /// Delete resources created for a component
    #[clap(subcommand)]
    Delete(DeleteCommand),
    #[clap(hide = true)]
    ShellAutocomplete(ShellAutocompleteOpts),
}

#[derive(Subcommand)]
enum DeleteCommand {
    /// Delete the component's resources from the platform
    Component(DeleteComponentOpts),
}

#[derive(Parser, Debug)]
pub struct DevOpts {
    /// Where the dev pod runs
    #[clap(long, default_value = "cluster")]
    platform: PlatformKind,

    /// Build command to run instead of the default one
    #[clap(long)]
    build_command: Option<String>,

    /// Run command to run instead of the default one
    #[clap(long)]
    run_command: Option<String>,

    /// Run the debug command instead of the run command and forward debug endpoints
    #[clap(long)]
    debug: bool,

    /// Debug command to run instead of the default one
    #[clap(long, requires = "debug")]
    debug_command: Option<String>,

    /// Pin a forwarded port, as [CONTAINER:]LOCAL_PORT:CONTAINER_PORT
    #[clap(long = "port-forward", value_parser = parse_port_override)]
    port_forwards: Vec<PortOverride>,

    /// Local address forwarded ports listen on
    #[clap(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    address: IpAddr,

    /// Pick local ports at random instead of sequentially from 20000
    #[clap(long)]
    random_ports: bool,

    /// Skip ports the application only listens to on the container's loopback interface
    #[clap(long, conflicts_with = "forward_localhost")]
    ignore_localhost: bool,

    /// Relay ports the application only listens to on the container's loopback interface
    #[clap(long)]
    forward_localhost: bool,

    /// Do not push source changes automatically; press p to push
    #[clap(long)]
    no_watch: bool,

    /// Override a devfile variable, as KEY=VALUE
    #[clap(long = "var", value_parser = parse_variable)]
    variables: Vec<(String, String)>,

    /// Do not start the local control API
    #[clap(long)]
    no_api_server: bool,

    /// Port of the local control API
    #[clap(long, conflicts_with = "no_api_server")]
    api_server_port: Option<u16>,
}

#[derive(Parser, Debug)]
pub struct DeployOpts {
    #[clap(flatten)]
    output: OutputOpts,

    /// Namespace to deploy to, instead of the one from .odo/env/env.yaml or the current context
    #[clap(long)]
    namespace: Option<String>,

    /// Override a devfile variable, as KEY=VALUE
    #[clap(long = "var", value_parser = parse_variable)]
    variables: Vec<(String, String)>,
}

#[derive(Parser, Debug)]
pub struct DeleteComponentOpts {
    #[clap(flatten)]
    output: OutputOpts,

    /// Component to delete, instead of the one in the current directory
    #[clap(long)]
    name: Option<String>,

    #[clap(long)]
    namespace: Option<String>,

    #[clap(long, default_value = "cluster")]
    platform: PlatformKind,

    /// Only delete resources created by `dev` or by `deploy`
    #[clap(long)]
    running_in: Option<Mode>,

    /// Also remove files odo created in the workspace
    #[clap(long, conflicts_with = "name")]
    files: bool,

    /// Delete without asking for confirmation
    #[clap(long, short)]
    force: bool,

    /// Wait until every resource is gone
    #[clap(long, short)]
    wait: bool,
}

#[derive(Parser, Debug)]
pub struct ShellAutocompleteOpts {
    shell: clap_complete::Shell,
}

fn main() {
    let opts = Opts::parse();

    let evloop = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(evloop) => evloop,
        Err(err) => {
            eprintln!("failed to start the async runtime: {}", err);
            process::exit(EXIT_FAILURE);
        }
    };

    if let Err(err) = logging::init(opts.debug_self) {
        eprintln!("{:#}", err);
        process::exit(EXIT_USAGE);
    }

    let retval = match opts.sub_command {
        SubCommand::Dev(dev_opts) => evloop.block_on(dev_command(dev_opts)),
        SubCommand::Deploy(deploy_opts) => evloop.block_on(deploy_command(deploy_opts)),
        SubCommand::Delete(DeleteCommand::Component(delete_opts)) => evloop.block_on(delete_command(delete_opts)),
        SubCommand::ShellAutocomplete(autocomplete_opts) => autocomplete(autocomplete_opts),
    };

    // The key reader and blocking prompt threads must not hold the exit.
    evloop.shutdown_timeout(Duration::from_secs(1));
    process::exit(retval);
}

#[tracing::instrument("driver::dev", level = "info", skip_all)]
async fn dev_command(dev_opts: DevOpts) -> i32 {
    let tty = atty::is(atty::Stream::Stderr);
    let mut console = Console::new(ConsoleOptions { tty });

    let (env, options, platform) = match until_interrupted(prepare_dev(&dev_opts)).await {
        Some(Ok(prepared)) => prepared,
        Some(Err(err)) => return report_error(&mut console, false, &err),
        None => return EXIT_INTERRUPTED,
    };

    let (events, receiver) = Events::channel();
    let console_task = spawn_console(console, receiver);
    let images = Arc::new(EngineImageBuilder::for_platform(dev_opts.platform));
    let result = DevSession::new(env, options, platform, images, events)
        .run(&Cancellation::new())
        .await;
    let mut console = finish_console(console_task, tty).await;

    match result {
        Ok(SessionExit::Graceful) => 0,
        Ok(SessionExit::Interrupted) => EXIT_INTERRUPTED,
        Err(err) => report_error(&mut console, false, &err.into()),
    }
}

async fn prepare_dev(dev_opts: &DevOpts) -> Result<(SessionEnv, DevOptions, Arc<dyn PlatformClient>)> {
    let preferences = Preferences::load()?;
    let workspace_root = find_workspace()?;
    let env = session_env(&workspace_root, dev_opts.platform)?;
    debug!(code = "dev_session_env", component = %env.component, pid = env.pid);

    let timeouts = timeouts(&preferences);
    let loopback = if dev_opts.ignore_localhost {
        LoopbackPolicy::Ignore
    } else if dev_opts.forward_localhost {
        LoopbackPolicy::Redirect
    } else {
        LoopbackPolicy::Reject
    };
    let options = DevOptions {
        build_command: dev_opts.build_command.clone(),
        run_command: dev_opts.run_command.clone(),
        debug: dev_opts.debug,
        debug_command: dev_opts.debug_command.clone(),
        port_overrides: dev_opts.port_forwards.clone(),
        address: dev_opts.address,
        random_ports: dev_opts.random_ports,
        loopback,
        watch: !dev_opts.no_watch,
        variables: variables(&dev_opts.variables),
        api_server: !dev_opts.no_api_server,
        api_port: dev_opts.api_server_port,
        ephemeral: preferences.ephemeral(),
        image_registry: preferences.image_registry().map(str::to_owned),
        timeouts: timeouts.clone(),
        ..DevOptions::default()
    };
    let platform = connect(dev_opts.platform, None, timeouts.platform).await?;
    Ok((env, options, platform))
}

#[tracing::instrument("driver::deploy", level = "info", skip_all)]
async fn deploy_command(deploy_opts: DeployOpts) -> i32 {
    let json = deploy_opts.output.json();
    let tty = deploy_opts.output.should_use_terminal();
    let console = Console::new(ConsoleOptions { tty });

    let cancel = Cancellation::new();
    let interrupt = cancel_on_interrupt(&cancel);
    let (events, console_task) = if json {
        (Events::disabled(), None)
    } else {
        let (events, receiver) = Events::channel();
        (events, Some(spawn_console(console, receiver)))
    };
    let result = run_deploy(&deploy_opts, events, &cancel).await;
    interrupt.abort();
    let mut console = match console_task {
        Some(task) => finish_console(task, tty).await,
        None => Console::new(ConsoleOptions { tty }),
    };

    match result {
        Ok(report) if json => print_json(&report),
        Ok(report) => {
            console.push_event(&DevEvent::Progress(format!(
                "Deployed {} resource(s) with command {:?}",
                report.resources.len(),
                report.command
            )));
            0
        }
        Err(err) => report_error(&mut console, json, &err),
    }
}

async fn run_deploy(deploy_opts: &DeployOpts, events: Events, cancel: &Cancellation) -> Result<DeployReport> {
    let preferences = Preferences::load()?;
    let workspace_root = find_workspace()?;
    let env = session_env(&workspace_root, PlatformKind::Cluster)?;
    let namespace = deploy_namespace(deploy_opts.namespace.as_deref(), &env.state_dir())?;

    let timeouts = timeouts(&preferences);
    let platform = connect(PlatformKind::Cluster, namespace, timeouts.platform).await?;
    let options = DeployOptions {
        command: None,
        variables: variables(&deploy_opts.variables),
        image_registry: preferences.image_registry().map(str::to_owned),
        timeouts,
    };
    let images = Arc::new(EngineImageBuilder::for_platform(PlatformKind::Cluster));
    Ok(deploy(&env, &options, platform, images, &events, cancel).await?)
}

#[tracing::instrument("driver::delete", level = "info", skip_all)]
async fn delete_command(delete_opts: DeleteComponentOpts) -> i32 {
    let json = delete_opts.output.json();
    let mut console = Console::new(ConsoleOptions {
        tty: delete_opts.output.should_use_terminal(),
    });
    if json && !delete_opts.force {
        console.error("--force is required with -o json", None);
        return EXIT_USAGE;
    }

    let cancel = Cancellation::new();
    let interrupt = cancel_on_interrupt(&cancel);
    let result = run_delete(&delete_opts, &cancel).await;
    interrupt.abort();

    match result {
        Ok(report) if json => print_json(&report),
        Ok(report) => {
            if report.deleted {
                console.push_event(&DevEvent::Progress(format!(
                    "Deleted {} resource(s) and {} file(s)",
                    report.resources.len(),
                    report.files.len()
                )));
            }
            0
        }
        Err(err) => report_error(&mut console, json, &err),
    }
}

async fn run_delete(delete_opts: &DeleteComponentOpts, cancel: &Cancellation) -> Result<DeleteReport> {
    let preferences = Preferences::load()?;
    let (component, files_of) = match &delete_opts.name {
        Some(name) => (name.clone(), None),
        None => {
            let workspace_root = find_workspace()?;
            let env = session_env(&workspace_root, delete_opts.platform)?;
            (env.component, delete_opts.files.then_some(workspace_root))
        }
    };
    if component.is_empty() {
        bail!("component name must not be empty");
    }

    let platform = connect(delete_opts.platform, delete_opts.namespace.clone(), preferences.timeout()).await?;
    let options = DeleteOptions {
        component,
        running_in: delete_opts.running_in,
        files_of,
        force: delete_opts.force,
        wait: delete_opts.wait,
        timeout: preferences.timeout(),
    };
    // Stdout carries only the JSON document in JSON mode.
    let mut out: Box<dyn Write> = if delete_opts.output.json() {
        Box::new(io::sink())
    } else {
        Box::new(io::stdout())
    };
    let report = delete_component(
        platform.as_ref(),
        &options,
        &SystemProbe,
        &mut StdinPrompt,
        out.as_mut(),
        cancel,
    )
    .await?;
    out.flush()?;
    Ok(report)
}

fn autocomplete(autocomplete_opts: ShellAutocompleteOpts) -> i32 {
    clap_complete::generate(autocomplete_opts.shell, &mut Opts::command(), "odo", &mut io::stdout());
    0
}

async fn connect(kind: PlatformKind, namespace: Option<String>, timeout: Duration) -> Result<Arc<dyn PlatformClient>> {
    let cluster = ClusterOptions {
        context: None,
        namespace,
        timeout,
    };
    let platform = Platform::connect(kind, cluster, EngineOptions::from_env(timeout))
        .await
        .map_err(DevError::from)?;
    Ok(Arc::new(platform))
}

fn timeouts(preferences: &Preferences) -> Timeouts {
    Timeouts {
        platform: preferences.timeout(),
        pod_ready: preferences.push_timeout(),
        ..Timeouts::default()
    }
}

fn variables(pairs: &[(String, String)]) -> BTreeMap<String, String> {
    pairs.iter().cloned().collect()
}

/// Resolves to `None` if the user interrupts before `fut` completes
async fn until_interrupted<F: Future>(fut: F) -> Option<F::Output> {
    tokio::select! {
        output = fut => Some(output),
        _ = signal::ctrl_c() => None,
    }
}

fn cancel_on_interrupt(cancel: &Cancellation) -> JoinHandle<()> {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    })
}

fn spawn_console(mut console: Console, mut receiver: mpsc::UnboundedReceiver<DevEvent>) -> JoinHandle<Console> {
    tokio::spawn(async move {
        while let Some(event) = receiver.next().await {
            console.push_event(&event);
        }
        console
    })
}

/// Waits for the event stream to drain so the final error lands after the last event
async fn finish_console(task: JoinHandle<Console>, tty: bool) -> Console {
    match task.await {
        Ok(console) => console,
        Err(err) => {
            debug!(code = "console_task_failed", error = error_value(&err));
            Console::new(ConsoleOptions { tty })
        }
    }
}

fn report_error(console: &mut Console, json: bool, err: &anyhow::Error) -> i32 {
    let dev_error = err.downcast_ref::<DevError>();
    if dev_error.map(DevError::class) == Some(ErrorClass::Shutdown) {
        return EXIT_INTERRUPTED;
    }
    let message = format!("{:#}", err);
    if json {
        let _ = serde_json::to_writer(io::stderr(), &serde_json::json!({ "message": message }));
        eprintln!();
    } else {
        let hint = dev_error.and_then(DevError::hint);
        console.error(&message, hint.as_deref());
    }
    EXIT_FAILURE
}

fn print_json<T: Serialize>(value: &T) -> i32 {
    let mut stdout = io::stdout().lock();
    let written = serde_json::to_writer_pretty(&mut stdout, value)
        .map_err(io::Error::from)
        .and_then(|()| writeln!(stdout));
    match written {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("failed to write output: {}", err);
            EXIT_FAILURE
        }
    }
}

fn parse_port_override(value: &str) -> Result<PortOverride, String> {
    value.parse().map_err(|err: DevError| err.to_string())
}

fn parse_variable(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("invalid variable {:?}, expected KEY=VALUE", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Opts::command().debug_assert();
    }

    #[test]
    fn dev_flags_parse() {
        let opts = Opts::try_parse_from([
            "odo",
            "dev",
            "--platform",
            "podman",
            "--port-forward",
            "runtime:8080:3000",
            "--var",
            "PORT=3000",
            "--forward-localhost",
        ])
        .unwrap();
        let SubCommand::Dev(dev_opts) = opts.sub_command else {
            panic!("expected dev");
        };
        assert_eq!(dev_opts.platform, PlatformKind::Podman);
        assert_eq!(dev_opts.port_forwards[0].container.as_deref(), Some("runtime"));
        assert_eq!(variables(&dev_opts.variables).get("PORT").map(String::as_str), Some("3000"));
        assert!(dev_opts.forward_localhost);
    }

    #[test]
    fn localhost_policies_are_exclusive() {
        assert!(Opts::try_parse_from(["odo", "dev", "--ignore-localhost", "--forward-localhost"]).is_err());
    }

    #[test]
    fn malformed_values_are_usage_errors() {
        let err = Opts::try_parse_from(["odo", "dev", "--port-forward", "8080"])
            .err()
            .unwrap();
        assert_eq!(err.exit_code(), EXIT_USAGE);
        assert!(Opts::try_parse_from(["odo", "dev", "--var", "=x"]).is_err());
        assert!(Opts::try_parse_from(["odo", "delete", "component", "--running-in", "prod"]).is_err());
    }

    #[test]
    fn delete_flags_parse() {
        let opts = Opts::try_parse_from([
            "odo",
            "delete",
            "component",
            "--name",
            "web",
            "--running-in",
            "deploy",
            "--force",
            "-o",
            "json",
        ])
        .unwrap();
        let SubCommand::Delete(DeleteCommand::Component(delete_opts)) = opts.sub_command else {
            panic!("expected delete component");
        };
        assert_eq!(delete_opts.running_in, Some(Mode::Deploy));
        assert!(delete_opts.output.json());
        assert!(Opts::try_parse_from(["odo", "delete", "component", "--name", "web", "--files"]).is_err());
    }
}
