use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{files::STATE_DIRECTORY, process::Pid};

/// The execution platform a session reconciles against
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Cluster,
    Podman,
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformKind::Cluster => f.write_str("cluster"),
            PlatformKind::Podman => f.write_str("podman"),
        }
    }
}

impl FromStr for PlatformKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(PlatformKind::Cluster),
            "podman" => Ok(PlatformKind::Podman),
            other => Err(format!("unknown platform {:?}, expected one of: cluster, podman", other)),
        }
    }
}

/// Ambient values shared by every stage of a session
///
/// Constructed once at the command entry point and passed by reference; nothing in the core reads the process
/// working directory or pid on its own.
#[derive(Clone, Debug)]
pub struct SessionEnv {
    pub workspace_root: PathBuf,
    pub devfile_path: PathBuf,
    pub pid: Pid,
    pub component: String,
    pub app: String,
    pub platform: PlatformKind,
}

impl SessionEnv {
    pub fn state_dir(&self) -> PathBuf {
        self.workspace_root.join(STATE_DIRECTORY)
    }

    /// Directory the manifest lives in, used as the default image build context
    pub fn devfile_dir(&self) -> &Path {
        self.devfile_path.parent().unwrap_or(&self.workspace_root)
    }

    /// Deterministic workload name, `<component>-<app>`
    pub fn pod_name(&self) -> String {
        format!("{}-{}", self.component, self.app)
    }
}
