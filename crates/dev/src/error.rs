use std::{io, net::IpAddr, ops::Range, path::PathBuf};

use thiserror::Error;

use odo_core::Interrupted;
use odo_devfile::DevfileError;
use odo_platform::PlatformError;
use odo_session::StateError;
use odo_sync::SyncError;

/// How the session reacts to a failed tick
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorClass {
    /// Retried after an exponential backoff delay
    Transient,
    /// Fails the current tick; the session waits for the next change
    Tick,
    /// Ends the session with a non-zero exit
    Fatal,
    /// The user asked to stop; teardown follows
    Shutdown,
}

#[derive(Error, Debug)]
pub enum DevError {
    #[error("invalid devfile: {0}")]
    Manifest(#[from] DevfileError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(
        "container {container:?} listens only on the loopback interface for port(s) {}",
        join_ports(.ports)
    )]
    LoopbackBindingRejected { container: String, ports: Vec<u16> },
    #[error("local port {address}:{port} is not available")]
    PortUnavailable { address: IpAddr, port: u16 },
    #[error("no free local port in range {}..{}", .range.start, .range.end)]
    NoFreePort { range: Range<u16> },
    #[error("invalid port forward {0:?}, expected [CONTAINER:]LOCAL_PORT:CONTAINER_PORT")]
    InvalidPortForward(String),
    #[error("invalid environment file {}: {message}", .path.display())]
    EnvFile { path: PathBuf, message: String },
    #[error("interrupted by user")]
    Shutdown,
    #[error("{operation} did not finish within {seconds}s")]
    Timeout { operation: &'static str, seconds: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Resolve(#[from] DevfileError),
    #[error("no command named {0:?} in devfile")]
    UnknownCommand(String),
    #[error("composite commands form a cycle: {}", .0.join(" -> "))]
    CompositeCycle(Vec<String>),
    #[error("command {id:?} exited with code {exit_code}{}", tail(.output))]
    Failed {
        id: String,
        exit_code: i32,
        output: String,
    },
    #[error("failed to build image {image:?}: {message}")]
    ImageBuild { image: String, message: String },
    #[error("command {id:?} did not start: {reason}")]
    ProcessFailed { id: String, reason: String },
    #[error("command {id:?} references component {component:?} which is not a {expected} component")]
    WrongComponent {
        id: String,
        component: String,
        expected: &'static str,
    },
    #[error("command {id:?} needs the dev pod, which is not running")]
    NoWorkload { id: String },
    #[error("invalid resource in component {component:?}: {message}")]
    InvalidResource { component: String, message: String },
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("command interrupted: {0}")]
    Interrupted(#[from] Interrupted),
}

impl DevError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DevError::Shutdown => ErrorClass::Shutdown,
            DevError::Platform(err) if err.is_transient() => ErrorClass::Transient,
            DevError::Platform(PlatformError::ImageUnresolved { .. } | PlatformError::PodFailed { .. }) => {
                ErrorClass::Tick
            }
            DevError::Sync(err) if err.is_transient() => ErrorClass::Transient,
            DevError::Sync(_) => ErrorClass::Tick,
            DevError::Command(err) => err.class(),
            DevError::PortUnavailable { .. } | DevError::Timeout { .. } => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// A remediation line shown under the error, where one exists
    pub fn hint(&self) -> Option<String> {
        match self {
            DevError::LoopbackBindingRejected { .. } => Some(
                "make the application listen on 0.0.0.0, or rerun with --ignore-localhost to skip these ports or \
                 --forward-localhost to relay them through a side container"
                    .to_owned(),
            ),
            DevError::Platform(PlatformError::Unavailable { .. })
            | DevError::Command(CommandError::Platform(PlatformError::Unavailable { .. })) => Some(
                "check that `kubectl cluster-info` succeeds for the cluster platform, or that `podman version` \
                 succeeds for --platform=podman"
                    .to_owned(),
            ),
            DevError::Platform(PlatformError::ImageUnresolved { image, .. }) => {
                Some(format!("check that the image {:?} exists and that you are logged in to its registry", image))
            }
            DevError::State(StateError::AlreadyRunningOnPlatform { pid, .. }) => Some(format!(
                "stop the session running as pid {} first, or use another --platform",
                pid
            )),
            DevError::Manifest(DevfileError::AmbiguousDefault(kind))
            | DevError::Command(CommandError::Resolve(DevfileError::AmbiguousDefault(kind))) => Some(format!(
                "mark one {} command with `isDefault: true` or pass --{}-command",
                kind, kind
            )),
            DevError::NoFreePort { .. } | DevError::PortUnavailable { .. } => {
                Some("pass --random-ports or choose ports explicitly with --port-forward".to_owned())
            }
            _ => None,
        }
    }
}

impl CommandError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CommandError::Platform(err) if err.is_transient() => ErrorClass::Transient,
            CommandError::Interrupted(Interrupted::Cancelled) => ErrorClass::Shutdown,
            CommandError::Interrupted(Interrupted::TimedOut(_)) => ErrorClass::Transient,
            CommandError::Failed { .. }
            | CommandError::ImageBuild { .. }
            | CommandError::ProcessFailed { .. }
            | CommandError::InvalidResource { .. } => ErrorClass::Tick,
            _ => ErrorClass::Fatal,
        }
    }
}

impl From<Interrupted> for DevError {
    fn from(err: Interrupted) -> Self {
        match err {
            Interrupted::Cancelled => DevError::Shutdown,
            Interrupted::TimedOut(after) => DevError::Timeout {
                operation: "platform operation",
                seconds: after.as_secs(),
            },
        }
    }
}

fn join_ports(ports: &[u16]) -> String {
    ports.iter().map(u16::to_string).collect::<Vec<_>>().join(", ")
}

fn tail(output: &str) -> String {
    let trimmed = output.trim_end();
    if trimmed.is_empty() {
        return String::new();
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    let start = lines.len().saturating_sub(5);
    format!(":\n{}", lines[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn classification() {
        assert_eq!(
            DevError::Platform(PlatformError::Unavailable {
                message: "refused".to_owned()
            })
            .class(),
            ErrorClass::Transient
        );
        assert_eq!(
            DevError::Command(CommandError::CompositeCycle(vec!["a".to_owned(), "b".to_owned()])).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            DevError::Command(CommandError::Failed {
                id: "build".to_owned(),
                exit_code: 1,
                output: String::new()
            })
            .class(),
            ErrorClass::Tick
        );
        assert_eq!(DevError::Sync(SyncError::Fatal("denied".to_owned())).class(), ErrorClass::Tick);
        assert_eq!(DevError::from(Interrupted::Cancelled).class(), ErrorClass::Shutdown);
        assert_eq!(
            DevError::from(Interrupted::TimedOut(Duration::from_secs(60))).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            DevError::LoopbackBindingRejected {
                container: "web".to_owned(),
                ports: vec![3000]
            }
            .class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn loopback_hint_names_both_flags() {
        let err = DevError::LoopbackBindingRejected {
            container: "web".to_owned(),
            ports: vec![3000, 3001],
        };
        assert!(err.to_string().contains("3000, 3001"));
        let hint = err.hint().unwrap();
        assert!(hint.contains("--ignore-localhost"));
        assert!(hint.contains("--forward-localhost"));
    }

    #[test]
    fn failed_command_shows_output_tail() {
        let err = CommandError::Failed {
            id: "build".to_owned(),
            exit_code: 2,
            output: "a\nb\nc\nd\ne\nf\ng\n".to_owned(),
        };
        assert_eq!(err.to_string(), "command \"build\" exited with code 2:\nc\nd\ne\nf\ng");
    }
}
