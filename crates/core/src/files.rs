use std::{
    fs, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

use crate::trace_call_result;

/// Names accepted for the workspace manifest, in order of preference
pub const DEVFILE_NAMES: &[&str] = &["devfile.yaml", ".devfile.yaml"];

/// Directory (relative to the workspace root) holding state owned by the tool
pub const STATE_DIRECTORY: &str = ".odo";

#[derive(Error, Debug)]
pub enum WellKnownFileError {
    #[error("file does not exist")]
    DoesNotExist,
    #[error("file exists, but with a different casing")]
    ExistsWithDifferentCase,
}

pub type WellKnownFileResult<T> = ::std::result::Result<T, WellKnownFileError>;

#[derive(Error, Debug)]
pub enum WorkspaceRootError {
    #[error("no devfile.yaml found in {0:?} or any parent directory")]
    NotFound(PathBuf),
    #[error("found a devfile with incorrect case in {0:?}; the file must be named 'devfile.yaml' in all lowercase")]
    WrongCase(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Determines whether a devfile exists in the given directory, returning its path
///
/// We require the devfile to be lower cased even on case insensitive filesystems, so the directory listing is
/// consulted instead of trusting `Path::exists`.
pub fn devfile_in(directory: impl AsRef<Path>) -> io::Result<WellKnownFileResult<PathBuf>> {
    let directory = directory.as_ref();
    let mut wrong_case = false;
    for name in DEVFILE_NAMES {
        if !directory.join(name).exists() {
            continue;
        }
        for entry in trace_call_result!(fs::read_dir(directory))? {
            let entry = entry?;
            if entry.file_name().to_str() == Some(*name) {
                return Ok(Ok(directory.join(name)));
            }
        }
        wrong_case = true;
    }
    if wrong_case {
        Ok(Err(WellKnownFileError::ExistsWithDifferentCase))
    } else {
        Ok(Err(WellKnownFileError::DoesNotExist))
    }
}

/// Walks up from `start` to the nearest directory containing a devfile
pub fn find_workspace_root(start: &Path) -> Result<PathBuf, WorkspaceRootError> {
    let mut current_dir = start.to_owned();
    let mut wrong_case_dir: Option<PathBuf> = None;
    loop {
        match devfile_in(&current_dir)? {
            Ok(_) => return Ok(current_dir),
            Err(WellKnownFileError::ExistsWithDifferentCase) => {
                wrong_case_dir.get_or_insert_with(|| current_dir.clone());
            }
            Err(WellKnownFileError::DoesNotExist) => {}
        }
        if !current_dir.pop() {
            break;
        }
    }
    match wrong_case_dir {
        Some(dir) => Err(WorkspaceRootError::WrongCase(dir)),
        None => Err(WorkspaceRootError::NotFound(start.to_owned())),
    }
}
