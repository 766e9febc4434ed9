//! Pushes local workspace changes into the project source volume of a running container
//!
//! Each push computes an index of the local tree, compares it with the index recorded in the container by the
//! previous push and transfers only the difference as a tar stream.

mod archive;
mod ignore_rules;
mod index;

pub use crate::{
    archive::{build_archive, SIDECAR_PATH},
    ignore_rules::{IgnoreRules, GIT_IGNORE_FILE, ODO_IGNORE_FILE},
    index::{posix_path, Changes, FileIndex, FileStamp},
};

use std::{collections::HashMap, io, path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use odo_platform::{ExecOutput, ExecRequest, PlatformClient, PlatformError};

/// Paths per `rm` invocation
const DELETE_BATCH: usize = 256;

const FATAL_MARKERS: &[&str] = &[
    "Permission denied",
    "Read-only file system",
    "No space left on device",
    "not found",
    "No such file or directory",
    "Not a directory",
    "Is a directory",
];

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("file sync interrupted: {0}")]
    Transient(#[source] PlatformError),
    #[error("file sync failed: {0}")]
    Fatal(String),
    #[error("failed to read local files: {0}")]
    Local(#[from] io::Error),
}

impl SyncError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

impl From<PlatformError> for SyncError {
    fn from(err: PlatformError) -> Self {
        if err.is_transient() {
            SyncError::Transient(err)
        } else {
            SyncError::Fatal(err.to_string())
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncRequest {
    pub local_root: PathBuf,
    pub ignore: IgnoreRules,
    pub force_push: bool,
    /// When non-empty, only these paths (relative POSIX, files or directories) are considered
    pub files: Vec<String>,
    pub pod: String,
    pub container: String,
    pub target_path: String,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct SyncOutcome {
    pub exec_required: bool,
    pub transferred: usize,
    pub deleted: usize,
    pub bytes: u64,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct SyncTarget {
    pod: String,
    container: String,
    path: String,
}

pub struct SyncEngine {
    platform: Arc<dyn PlatformClient>,
    // Index last written to each target by this process. Saves reading the sidecar back on every push.
    pushed: Mutex<HashMap<SyncTarget, FileIndex>>,
}

impl SyncEngine {
    pub fn new(platform: Arc<dyn PlatformClient>) -> SyncEngine {
        SyncEngine {
            platform,
            pushed: Mutex::new(HashMap::new()),
        }
    }

    /// Forgets what was pushed to `pod`, which must be done whenever the pod is replaced
    pub fn invalidate(&self, pod: &str) {
        self.pushed.lock().retain(|target, _| target.pod != pod);
    }

    #[tracing::instrument(level = "debug", err, skip(self, request), fields(pod = %request.pod, container = %request.container))]
    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncOutcome, SyncError> {
        let target = SyncTarget {
            pod: request.pod.clone(),
            container: request.container.clone(),
            path: request.target_path.clone(),
        };

        let current = {
            let root = request.local_root.clone();
            let ignore = request.ignore.clone();
            tokio::task::spawn_blocking(move || FileIndex::compute(&root, &ignore))
                .await
                .map_err(|err| SyncError::Local(io::Error::new(io::ErrorKind::Other, err)))??
        };

        let previous = if request.force_push {
            None
        } else {
            let cached = self.pushed.lock().get(&target).cloned();
            match cached {
                Some(cached) => Some(cached),
                None => self.read_sidecar(request).await?,
            }
        };

        let mut changes = current.diff(previous.as_ref());
        if !request.files.is_empty() {
            changes.restrict_to(&request.files);
        }
        if changes.is_empty() {
            debug!(code = "sync_up_to_date", files = current.files.len());
            self.pushed.lock().insert(target, previous.unwrap_or(current));
            return Ok(SyncOutcome::default());
        }

        let next = current.applied_to(previous.as_ref(), &changes);
        let mut outcome = SyncOutcome {
            exec_required: true,
            transferred: changes.changed.len(),
            deleted: changes.deleted.len(),
            bytes: 0,
        };

        // With nothing to delete the sidecar travels with the data.
        let sidecar_with_data = changes.deleted.is_empty();
        if !changes.changed.is_empty() || sidecar_with_data {
            let archive = {
                let root = request.local_root.clone();
                let paths: Vec<String> = changes.changed.iter().cloned().collect();
                let sidecar = if sidecar_with_data { Some(next.clone()) } else { None };
                tokio::task::spawn_blocking(move || build_archive(&root, &paths, sidecar.as_ref()))
                    .await
                    .map_err(|err| SyncError::Local(io::Error::new(io::ErrorKind::Other, err)))??
            };
            outcome.bytes += archive.len() as u64;
            self.extract(request, archive).await?;
        }

        if !changes.deleted.is_empty() {
            let deleted: Vec<&String> = changes.deleted.iter().collect();
            for batch in deleted.chunks(DELETE_BATCH) {
                let mut command = vec!["rm".to_owned(), "-rf".to_owned(), "--".to_owned()];
                command.extend(batch.iter().map(|path| remote_path(&request.target_path, path)));
                let output = self
                    .platform
                    .exec_in_container(ExecRequest::new(&request.pod, &request.container, command))
                    .await?;
                check_output("remove deleted files", &output)?;
            }
            let archive = build_archive(&request.local_root, std::iter::empty(), Some(&next))?;
            outcome.bytes += archive.len() as u64;
            self.extract(request, archive).await?;
        }

        info!(
            code = "sync_pushed",
            changed = outcome.transferred,
            deleted = outcome.deleted,
            bytes = outcome.bytes,
            "pushed {} changed and {} deleted files",
            outcome.transferred,
            outcome.deleted
        );
        self.pushed.lock().insert(target, next);
        Ok(outcome)
    }

    async fn read_sidecar(&self, request: &SyncRequest) -> Result<Option<FileIndex>, SyncError> {
        let output = self
            .platform
            .exec_in_container(ExecRequest::new(
                &request.pod,
                &request.container,
                ["cat".to_owned(), remote_path(&request.target_path, SIDECAR_PATH)],
            ))
            .await?;
        if !output.success() {
            debug!(code = "sidecar_missing", pod = %request.pod);
            return Ok(None);
        }
        match serde_json::from_slice(&output.stdout) {
            Ok(index) => Ok(Some(index)),
            Err(err) => {
                warn!(code = "sidecar_invalid", "ignoring unreadable sync index in container: {}", err);
                Ok(None)
            }
        }
    }

    async fn extract(&self, request: &SyncRequest, archive: Vec<u8>) -> Result<(), SyncError> {
        let output = self
            .platform
            .exec_in_container(
                ExecRequest::new(&request.pod, &request.container, extract_command(&request.target_path))
                    .with_stdin(archive),
            )
            .await?;
        check_output("extract archive", &output)
    }
}

/// Shell command that unpacks a tar stream from stdin into `target`, creating it if needed
pub fn extract_command(target: &str) -> Vec<String> {
    vec![
        "sh".to_owned(),
        "-c".to_owned(),
        "mkdir -p \"$1\" && tar -xf - -C \"$1\"".to_owned(),
        "odo-sync".to_owned(),
        target.to_owned(),
    ]
}

fn remote_path(target: &str, relative: &str) -> String {
    format!("{}/{}", target.trim_end_matches('/'), relative)
}

fn check_output(operation: &str, output: &ExecOutput) -> Result<(), SyncError> {
    if output.success() {
        return Ok(());
    }
    let stderr = output.stderr_lossy();
    let message = format!("{} exited with {}: {}", operation, output.exit_code, stderr.trim());
    if FATAL_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        Err(SyncError::Fatal(message))
    } else {
        Err(SyncError::Transient(PlatformError::Exec {
            container: String::new(),
            message,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_paths_joined_once() {
        assert_eq!(remote_path("/projects/", "src/app.js"), "/projects/src/app.js");
        assert_eq!(remote_path("/projects", SIDECAR_PATH), "/projects/.odo/file-index.json");
    }

    #[test]
    fn permission_errors_are_fatal() {
        let output = ExecOutput {
            exit_code: 2,
            stdout: Vec::new(),
            stderr: b"tar: app.js: Cannot open: Permission denied".to_vec(),
        };
        assert!(matches!(check_output("extract", &output), Err(SyncError::Fatal(_))));
        let output = ExecOutput {
            exit_code: 1,
            stdout: Vec::new(),
            stderr: b"unexpected EOF".to_vec(),
        };
        assert!(check_output("extract", &output).unwrap_err().is_transient());
    }

    #[test]
    fn file_kind_swaps_are_fatal() {
        for stderr in [
            "tar: src/app.js: Cannot mkdir: Not a directory",
            "tar: src: Cannot open: Is a directory",
        ] {
            let output = ExecOutput {
                exit_code: 2,
                stdout: Vec::new(),
                stderr: stderr.as_bytes().to_vec(),
            };
            assert!(matches!(check_output("extract", &output), Err(SyncError::Fatal(_))));
        }
    }
}
