//! The `dev` session: state acquisition, the reconcile loop and the graceful teardown

use std::{
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use odo_core::{files::STATE_DIRECTORY, tracing::error_value, Cancellation, SessionEnv};
use odo_devfile::Devfile;
use odo_platform::{PlatformClient, PodPhase, WorkloadEvent};
use odo_session::{GeneratedFiles, StateStore, SystemProbe};
use odo_sync::IgnoreRules;

use crate::{
    api::{ApiHandle, ApiRequest, ApiServer, ApiState, ComponentDescription, DEFAULT_API_PORT_RANGE},
    backoff::ExpBackoff,
    error::ErrorClass,
    events::{DevEvent, Events},
    image::ImageBuilder,
    options::DevOptions,
    portforward::PortProbe,
    reconcile::{Reconciler, TickOutcome, Trigger},
    watch::{Event, KeyAction, WatchSources, Watcher},
    DevError,
};

pub const MANAGED_BY: &str = "odo";

/// How a session ended without error
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SessionExit {
    /// Everything the session created was removed
    Graceful,
    /// A second interrupt abandoned the teardown; leftovers are reclaimed by the next session
    Interrupted,
}

pub struct DevSession {
    env: SessionEnv,
    options: DevOptions,
    platform: Arc<dyn PlatformClient>,
    images: Arc<dyn ImageBuilder>,
    events: Events,
    sources: WatchSources,
    port_probe: Option<Arc<dyn PortProbe>>,
}

impl DevSession {
    pub fn new(
        env: SessionEnv,
        options: DevOptions,
        platform: Arc<dyn PlatformClient>,
        images: Arc<dyn ImageBuilder>,
        events: Events,
    ) -> DevSession {
        DevSession {
            env,
            options,
            platform,
            images,
            events,
            sources: WatchSources::default(),
            port_probe: None,
        }
    }

    pub fn with_watch_sources(mut self, sources: WatchSources) -> DevSession {
        self.sources = sources;
        self
    }

    pub fn with_port_probe(mut self, probe: Arc<dyn PortProbe>) -> DevSession {
        self.port_probe = Some(probe);
        self
    }

    /// Runs until the user stops the session or a fatal error occurs, then tears everything down
    ///
    /// Cancelling `cancel` counts as a stop request. Teardown always runs under its own budget, so it is attempted
    /// even when the loop ended with an error.
    #[tracing::instrument(level = "info", err, skip(self, cancel), fields(component = %self.env.component))]
    pub async fn run(self, cancel: &Cancellation) -> Result<SessionExit, DevError> {
        let DevSession {
            env,
            options,
            platform,
            images,
            events,
            sources,
            port_probe,
        } = self;

        let devfile = load_devfile(&env, &options)?;
        let store = StateStore::init(&env, Arc::new(SystemProbe))?;
        if let Err(err) = GeneratedFiles::new(&env.workspace_root, &env.state_dir()).ignore_state_dir(STATE_DIRECTORY) {
            warn!(code = "gitignore_not_updated", error = error_value(&err));
        }

        let mut reconciler = Reconciler::new(
            env.clone(),
            options.clone(),
            platform.clone(),
            images,
            store,
            devfile,
            events.clone(),
        );
        if let Some(probe) = port_probe {
            reconciler = reconciler.with_port_probe(probe);
        }

        let sources = WatchSources {
            files: sources.files && options.watch,
            ..sources
        };
        let ignore = IgnoreRules::load(&env.workspace_root, &options.ignore_patterns);
        let mut watcher = match Watcher::spawn(&env.workspace_root, ignore, platform.clone(), &env.component, sources) {
            Ok(watcher) => watcher,
            Err(err) => {
                if let Err(teardown_err) = reconciler.teardown(&Cancellation::new()).await {
                    warn!(code = "teardown_step_failed", step = "abort", error = error_value(&teardown_err));
                }
                return Err(err.into());
            }
        };

        let description = Arc::new(Mutex::new(describe(&reconciler)));
        let api = if options.api_server {
            start_api(&env, &options, &mut reconciler, description.clone(), &watcher, &events)
        } else {
            None
        };

        let outcome = run_loop(&env, &options, &mut reconciler, &mut watcher, &description, &events, cancel).await;
        if let Err(err) = &outcome {
            error!(code = "session_failed", error = error_value(err));
        }

        events.push(DevEvent::Stopping);
        watcher.release_terminal();
        if let Some(api) = api {
            api.shutdown().await;
        }

        info!(code = "teardown_started", budget_secs = options.timeouts.teardown.as_secs());
        let teardown_cancel = Cancellation::new();
        let teardown = teardown_cancel.run_with_deadline(options.timeouts.teardown, reconciler.teardown(&teardown_cancel));
        let teardown = tokio::select! {
            result = teardown => result,
            _ = watcher.shutdown_requested() => {
                warn!(code = "teardown_abandoned", "second interrupt, exiting without cleanup");
                teardown_cancel.cancel();
                return outcome.map(|()| SessionExit::Interrupted);
            }
        };
        let teardown = match teardown {
            Ok(Ok(removed)) => {
                debug!(code = "teardown_finished", removed = removed.len());
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(err) => Err(DevError::from(err)),
        };

        outcome?;
        teardown?;
        Ok(SessionExit::Graceful)
    }
}

async fn run_loop(
    env: &SessionEnv,
    options: &DevOptions,
    reconciler: &mut Reconciler,
    watcher: &mut Watcher,
    description: &Mutex<ComponentDescription>,
    events: &Events,
    cancel: &Cancellation,
) -> Result<(), DevError> {
    let mut backoff = ExpBackoff::default();
    let mut trigger = Some(Trigger::Startup);

    loop {
        if let Some(current) = trigger.take() {
            let tick_cancel = cancel.child();
            let result = tokio::select! {
                result = reconciler.tick(current, &tick_cancel) => result,
                _ = watcher.shutdown_requested() => {
                    tick_cancel.cancel();
                    return Ok(());
                }
            };
            *description.lock() = describe(reconciler);
            match result {
                Ok(TickOutcome::Ready) => backoff.reset(),
                Ok(TickOutcome::Redeploy) => {
                    trigger = Some(Trigger::Retry);
                    continue;
                }
                Err(err) => match err.class() {
                    ErrorClass::Transient => {
                        let delay = backoff.next_delay();
                        warn!(code = "tick_failed_transient", error = error_value(&err), delay_ms = delay.as_millis() as u64);
                        events.push(failed(&err, Some(delay)));
                        watcher.schedule_tick(delay);
                    }
                    ErrorClass::Tick => {
                        warn!(code = "tick_failed", error = error_value(&err));
                        events.push(failed(&err, None));
                    }
                    ErrorClass::Fatal => return Err(err),
                    ErrorClass::Shutdown => return Ok(()),
                },
            }
        }

        let event = match watcher.next(cancel).await {
            Some(event) => event,
            None => return Ok(()),
        };
        debug!(code = "session_event", ?event);
        trigger = match event {
            Event::Key(KeyAction::Shutdown) | Event::Api(ApiRequest::Shutdown) => return Ok(()),
            Event::Fs(batch) => {
                if batch.touches(&env.devfile_path) {
                    match load_devfile(env, options) {
                        Ok(devfile) => {
                            info!(code = "devfile_reloaded");
                            events.progress("Devfile changed, reloading");
                            reconciler.reload(devfile);
                        }
                        Err(err) => {
                            // Keep running the last good manifest until the file is fixed.
                            events.push(failed(&err, None));
                            continue;
                        }
                    }
                }
                reconciler.mark_outdated();
                Some(Trigger::FilesChanged)
            }
            Event::Workload(WorkloadEvent::Changed {
                phase: PodPhase::Running | PodPhase::Pending,
                ..
            }) => None,
            Event::Workload(_) => Some(Trigger::WorkloadChanged),
            Event::Key(KeyAction::PushNow) => {
                events.progress("Pushing changes");
                Some(Trigger::PushNow)
            }
            Event::Api(ApiRequest::RunCommand(id)) => {
                if let Err(err) = reconciler.run_command(&id, cancel).await {
                    warn!(code = "api_command_failed", command = %id, error = error_value(&err));
                    events.push(failed(&err, None));
                }
                None
            }
            Event::Tick => Some(Trigger::Retry),
        };
    }
}

fn load_devfile(env: &SessionEnv, options: &DevOptions) -> Result<Devfile, DevError> {
    let devfile = Devfile::load(&env.devfile_path, &options.variables)?;
    devfile.require_dev_commands()?;
    Ok(devfile)
}

fn start_api(
    env: &SessionEnv,
    options: &DevOptions,
    reconciler: &mut Reconciler,
    description: Arc<Mutex<ComponentDescription>>,
    watcher: &Watcher,
    events: &Events,
) -> Option<ApiHandle> {
    let state = ApiState {
        component: description,
        pid: env.pid,
        workspace_root: env.workspace_root.clone(),
        requests: watcher.sender(),
    };
    let address = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let server = match ApiServer::bind(address, options.api_port, DEFAULT_API_PORT_RANGE, state) {
        Ok(server) => server,
        Err(err) => {
            warn!(code = "api_server_unavailable", error = error_value(&err));
            events.warning(format!("the control API is not available: {}", err));
            return None;
        }
    };
    let port = server.listen_addr().port();
    if let Err(err) = reconciler.store_mut().set_api_port(Some(port)) {
        warn!(code = "api_port_not_recorded", error = error_value(&err));
    }
    events.progress(format!("API server listening at http://{}", server.listen_addr()));
    Some(server.spawn())
}

fn describe(reconciler: &Reconciler) -> ComponentDescription {
    let env = reconciler.env();
    ComponentDescription {
        name: reconciler.devfile().name().to_owned(),
        devfile_path: env.devfile_path.clone(),
        running_on: env.platform,
        state: reconciler.status().state,
        dev_forwarded_ports: reconciler.forwarded_ports(),
        managed_by: MANAGED_BY.to_owned(),
    }
}

fn failed(err: &DevError, retry_in: Option<std::time::Duration>) -> DevEvent {
    DevEvent::Failed {
        message: err.to_string(),
        hint: err.hint(),
        retry_in,
    }
}
