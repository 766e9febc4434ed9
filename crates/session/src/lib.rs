//! On-disk record of running dev sessions
//!
//! Every session owns `.odo/devstate.<pid>.json`. The common `.odo/devstate.json` mirrors whichever live session
//! claimed it first; other sessions never write to it.

mod generated;
mod store;

pub use crate::{
    generated::GeneratedFiles,
    store::{get_orphan_files, ProcessProbe, StateStore, SystemProbe},
};

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use odo_core::{process::Pid, PlatformKind};

pub const COMMON_STATE_FILE: &str = "devstate.json";
pub const STATE_FILE_PREFIX: &str = "devstate.";
pub const STATE_FILE_SUFFIX: &str = ".json";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("a dev session (pid {pid}) is already running on platform {platform}")]
    AlreadyRunningOnPlatform { pid: Pid, platform: PlatformKind },
    #[error("state file I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("state file is malformed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to replace state file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedPort {
    pub container_name: String,
    pub local_address: String,
    pub local_port: u16,
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
    #[serde(default)]
    pub is_debug: bool,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub pid: Pid,
    pub platform: PlatformKind,
    #[serde(default)]
    pub forwarded_ports: Vec<ForwardedPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_port: Option<u16>,
}

impl SessionRecord {
    pub fn new(pid: Pid, platform: PlatformKind) -> SessionRecord {
        SessionRecord {
            pid,
            platform,
            forwarded_ports: Vec::new(),
            api_server_port: None,
        }
    }
}

/// File name of the record owned by `pid`
pub fn state_file_name(pid: Pid) -> String {
    format!("{}{}{}", STATE_FILE_PREFIX, pid, STATE_FILE_SUFFIX)
}

/// Extracts the pid from a per-process state file name
pub fn parse_state_file_name(name: &str) -> Option<Pid> {
    name.strip_prefix(STATE_FILE_PREFIX)?
        .strip_suffix(STATE_FILE_SUFFIX)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_file_names() {
        assert_eq!(state_file_name(42), "devstate.42.json");
        assert_eq!(parse_state_file_name("devstate.42.json"), Some(42));
        assert_eq!(parse_state_file_name(COMMON_STATE_FILE), None);
        assert_eq!(parse_state_file_name("devstate.x.json"), None);
    }

    #[test]
    fn record_serialization_uses_camel_case() {
        let mut record = SessionRecord::new(7, PlatformKind::Podman);
        record.forwarded_ports.push(ForwardedPort {
            container_name: "web".to_owned(),
            local_address: "127.0.0.1".to_owned(),
            local_port: 20001,
            container_port: 3000,
            port_name: Some("http".to_owned()),
            is_debug: false,
        });
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(encoded["platform"], "podman");
        assert_eq!(encoded["forwardedPorts"][0]["localPort"], 20001);
        assert!(encoded.get("apiServerPort").is_none());
    }
}
