use std::{io, path::PathBuf};

use thiserror::Error;

use crate::GroupKind;

#[derive(Error, Debug)]
pub enum DevfileError {
    #[error("failed to read devfile {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse devfile: {0}")]
    Parse(#[source] serde_yaml::Error),
    #[error("invalid devfile: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("no {kind} command{} found in devfile", named(.name))]
    CommandNotFound { kind: GroupKind, name: Option<String> },
    #[error("command {id:?} is of kind {actual}, expected {expected}")]
    CommandKindMismatch {
        id: String,
        expected: GroupKind,
        actual: GroupKind,
    },
    #[error("more than one {0} command exists and none is marked as the default")]
    AmbiguousDefault(GroupKind),
}

fn named(name: &Option<String>) -> String {
    match name {
        Some(name) => format!(" named {:?}", name),
        None => String::new(),
    }
}
