use std::{io, time::Duration};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("platform unavailable: {message}")]
    Unavailable { message: String },
    #[error("image {image:?} could not be pulled: {reason}")]
    ImageUnresolved { image: String, reason: String },
    #[error("{kind} {name:?} is managed by {holder}, refusing to overwrite it")]
    Conflict { kind: String, name: String, holder: String },
    #[error("{kind} {name:?} not found")]
    NotFound { kind: String, name: String },
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
    #[error("operation did not complete within {0:?}")]
    Timeout(Duration),
    #[error("pod {pod:?} failed: {reason}")]
    PodFailed { pod: String, reason: String },
    #[error("exec in container {container:?} failed: {message}")]
    Exec { container: String, message: String },
    #[error("{program} exited with {status}: {stderr}")]
    Engine {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("invalid resource: {0}")]
    InvalidResource(String),
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube_client::Error),
    #[error("malformed platform response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PlatformError {
    /// Whether retrying the same operation later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Unavailable { .. } | PlatformError::Timeout(_) => true,
            PlatformError::Kube(kube_client::Error::Api(response)) => {
                response.code >= 500 || response.code == 429 || response.code == 409
            }
            PlatformError::Kube(_) => true,
            PlatformError::Exec { .. } => true,
            PlatformError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    pub(crate) fn is_not_found(&self) -> bool {
        match self {
            PlatformError::NotFound { .. } => true,
            PlatformError::Kube(kube_client::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }
}
