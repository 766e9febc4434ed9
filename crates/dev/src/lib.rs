//! The inner development loop: keeps a dev pod in line with the devfile while the user edits sources
//!
//! [`DevSession`] owns a session from state acquisition to teardown. Each [`Reconciler::tick`] builds images, deploys
//! the pod, syncs sources, runs the build and run commands and forwards ports. `deploy` and `delete component` reuse
//! the same command runtime and platform surface as one-shot flows.

pub mod api;
pub mod backoff;
pub mod delete;
pub mod deploy;
mod error;
pub mod events;
pub mod fswatch;
pub mod image;
pub mod logs;
pub mod loopback;
pub mod options;
pub mod pod;
pub mod portforward;
pub mod process;
pub mod reconcile;
pub mod runtime;
pub mod session;
pub mod status;
pub mod watch;

#[cfg(test)]
mod fixtures;

pub use crate::{
    api::{ApiServer, BindError, DEFAULT_API_PORT_RANGE},
    delete::{delete_component, DeleteOptions, DeleteReport, Prompt, StdinPrompt},
    deploy::{deploy, deploy_namespace, DeployOptions, DeployReport},
    error::{CommandError, DevError, ErrorClass},
    events::{DevEvent, Events},
    image::{EngineImageBuilder, ImageBuilder},
    options::{DevOptions, LoopbackPolicy, PortOverride, Timeouts, DEFAULT_PORT_RANGE},
    reconcile::Reconciler,
    session::{DevSession, SessionExit},
    watch::WatchSources,
};
