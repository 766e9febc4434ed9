use std::{collections::BTreeMap, time::Instant};

use serde::Serialize;

use odo_session::ForwardedPort;

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Debug)]
pub enum ComponentState {
    WaitDeployment,
    SyncOutdated,
    Ready,
}

/// Per-session view of the component, owned by the reconciler
#[derive(Clone, Debug)]
pub struct ComponentStatus {
    pub state: ComponentState,
    pub post_start_events_done: bool,
    pub run_executed: bool,
    /// Local ports per container, in endpoint order
    pub endpoints_forwarded: BTreeMap<String, Vec<u16>>,
    /// Hash of the pod spec last deployed by this session
    pub deployed_hash: Option<String>,
    /// Commands started through the process supervisor, as `(container, command id)`
    pub running_commands: Vec<(String, String)>,
    pub last_sync_completed: Option<Instant>,
    pub last_run_started: Option<Instant>,
}

impl ComponentStatus {
    pub fn new() -> ComponentStatus {
        ComponentStatus {
            state: ComponentState::WaitDeployment,
            post_start_events_done: false,
            run_executed: false,
            endpoints_forwarded: BTreeMap::new(),
            deployed_hash: None,
            running_commands: Vec::new(),
            last_sync_completed: None,
            last_run_started: None,
        }
    }

    /// Forgets everything tied to the previous pod
    pub fn pod_replaced(&mut self) {
        self.state = ComponentState::WaitDeployment;
        self.post_start_events_done = false;
        self.run_executed = false;
        self.running_commands.clear();
    }

    pub fn publish_forwards(&mut self, forwards: &[ForwardedPort]) {
        let mut by_container: BTreeMap<String, Vec<u16>> = BTreeMap::new();
        for forward in forwards {
            by_container
                .entry(forward.container_name.clone())
                .or_default()
                .push(forward.local_port);
        }
        self.endpoints_forwarded = by_container;
    }
}

impl Default for ComponentStatus {
    fn default() -> Self {
        ComponentStatus::new()
    }
}
