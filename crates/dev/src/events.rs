use std::time::Duration;

use futures::channel::mpsc;

use odo_session::ForwardedPort;

/// Something the console (or the JSON writer) should show the user
#[derive(Clone, PartialEq, Debug)]
pub enum DevEvent {
    Progress(String),
    Output { container: String, line: String },
    Warning(String),
    Forwarded(Vec<ForwardedPort>),
    Ready,
    Failed {
        message: String,
        hint: Option<String>,
        retry_in: Option<Duration>,
    },
    Stopping,
}

/// Optional sender half for session events
///
/// A session without a listener (tests, `deploy -o json`) simply drops its events.
#[derive(Clone, Default)]
pub struct Events {
    tx: Option<mpsc::UnboundedSender<DevEvent>>,
}

impl Events {
    pub fn channel() -> (Events, mpsc::UnboundedReceiver<DevEvent>) {
        let (tx, rx) = mpsc::unbounded();
        (Events { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Events {
        Events { tx: None }
    }

    pub fn push(&self, event: DevEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.unbounded_send(event);
        }
    }

    pub fn progress(&self, message: impl Into<String>) {
        self.push(DevEvent::Progress(message.into()));
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.push(DevEvent::Warning(message.into()));
    }
}
