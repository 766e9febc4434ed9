pub mod console;
pub mod logging;
pub mod preferences;

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use serde::Deserialize;

use odo_core::{
    files::{devfile_in, find_workspace_root, WellKnownFileError, WorkspaceRootError},
    process, trace_call_result, PlatformKind, SessionEnv,
};

/// Application name shared by every component created from this tool
pub const DEFAULT_APP: &str = "app";

const MAX_COMPONENT_NAME: usize = 63;

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum, Debug)]
pub enum OutputFormat {
    Json,
}

#[derive(Parser, Debug)]
pub struct OutputOpts {
    /// Print a machine readable result on stdout instead of the human readable progress
    #[clap(long, short = 'o')]
    output: Option<OutputFormat>,

    /// Indicate whether output should be displayed in active terminal mode or not
    ///
    /// By default this is determined automatically by detecting whether stderr is attached to a tty.
    #[clap(long)]
    terminal: Option<bool>,
}

impl OutputOpts {
    pub fn json(&self) -> bool {
        self.output == Some(OutputFormat::Json)
    }

    pub fn should_use_terminal(&self) -> bool {
        if let Some(terminal) = self.terminal {
            return terminal;
        }
        !self.json() && atty::is(atty::Stream::Stderr)
    }
}

/// The nearest directory above the working directory that holds a devfile
#[tracing::instrument(level = "debug", err)]
pub fn find_workspace() -> Result<PathBuf> {
    let current_dir = trace_call_result!(env::current_dir())?;
    match find_workspace_root(&current_dir) {
        Ok(root) => Ok(root),
        Err(WorkspaceRootError::WrongCase(dir)) => bail!(
            "unable to find a devfile, but found one with incorrect case in {:?}. note that 'devfile.yaml' must be \
             named in all lowercase.",
            dir
        ),
        Err(err) => Err(err.into()),
    }
}

/// Builds the values a command shares with every stage of the session
pub fn session_env(workspace_root: &Path, platform: PlatformKind) -> Result<SessionEnv> {
    let devfile_path = match devfile_in(workspace_root)? {
        Ok(path) => path,
        Err(WellKnownFileError::ExistsWithDifferentCase) => {
            bail!("the devfile in {:?} must be named 'devfile.yaml' in all lowercase", workspace_root)
        }
        Err(WellKnownFileError::DoesNotExist) => bail!("no devfile.yaml found in {:?}", workspace_root),
    };
    let component = component_name(&devfile_path, workspace_root)?;
    Ok(SessionEnv {
        workspace_root: workspace_root.to_owned(),
        devfile_path,
        pid: process::current_pid(),
        component,
        app: DEFAULT_APP.to_owned(),
        platform,
    })
}

#[derive(Deserialize, Default)]
struct NameOnly {
    #[serde(default)]
    metadata: MetadataName,
}

#[derive(Deserialize, Default)]
struct MetadataName {
    #[serde(default)]
    name: Option<String>,
}

/// The devfile's `metadata.name`, or the workspace directory's name when it has none
pub fn component_name(devfile_path: &Path, workspace_root: &Path) -> Result<String> {
    let source = trace_call_result!(fs::read_to_string(devfile_path))?;
    let declared = serde_yaml::from_str::<NameOnly>(&source)
        .ok()
        .and_then(|devfile| devfile.metadata.name)
        .filter(|name| !name.trim().is_empty());
    let raw = match declared {
        Some(name) => name,
        None => workspace_root
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
            .to_owned(),
    };
    let name = sanitize_name(&raw);
    if name.is_empty() {
        bail!("cannot derive a component name from {:?}; set metadata.name in the devfile", raw);
    }
    Ok(name)
}

/// Lowercases and replaces characters a DNS label cannot hold
fn sanitize_name(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() {
            name.push(c);
        } else if !name.ends_with('-') {
            name.push('-');
        }
    }
    let name = name.trim_matches('-');
    let name = if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("x-{}", name)
    } else {
        name.to_owned()
    };
    name.chars()
        .take(MAX_COMPONENT_NAME)
        .collect::<String>()
        .trim_end_matches('-')
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_dns_labels() {
        assert_eq!(sanitize_name("My App_v2"), "my-app-v2");
        assert_eq!(sanitize_name("--node--"), "node");
        assert_eq!(sanitize_name("3tier"), "x-3tier");
        assert_eq!(sanitize_name(&"a".repeat(80)).len(), MAX_COMPONENT_NAME);
    }

    #[test]
    fn component_name_prefers_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let devfile = dir.path().join("devfile.yaml");
        fs::write(&devfile, "schemaVersion: 2.2.0\nmetadata:\n  name: Shop API\n").unwrap();
        assert_eq!(component_name(&devfile, dir.path()).unwrap(), "shop-api");

        let root = dir.path().join("backend");
        fs::create_dir(&root).unwrap();
        let devfile = root.join("devfile.yaml");
        fs::write(&devfile, "schemaVersion: 2.2.0\n").unwrap();
        assert_eq!(component_name(&devfile, &root).unwrap(), "backend");
    }

    #[test]
    fn session_env_names_the_pod() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("devfile.yaml"), "schemaVersion: 2.2.0\nmetadata:\n  name: web\n").unwrap();
        let env = session_env(dir.path(), PlatformKind::Podman).unwrap();
        assert_eq!(env.pod_name(), "web-app");
        assert_eq!(env.devfile_path, dir.path().join("devfile.yaml"));
        assert_eq!(env.pid, std::process::id());
    }
}
