use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
};

use tracing::debug;

use odo_core::trace_call_result;

use crate::StateError;

pub const GENERATED_REGISTRY: &str = "generated";

/// Files odo created in the user's workspace, removed by `delete --files`
///
/// Paths are stored relative to the workspace root.
pub struct GeneratedFiles {
    workspace_root: PathBuf,
    registry: PathBuf,
}

impl GeneratedFiles {
    pub fn new(workspace_root: &Path, state_dir: &Path) -> GeneratedFiles {
        GeneratedFiles {
            workspace_root: workspace_root.to_owned(),
            registry: state_dir.join(GENERATED_REGISTRY),
        }
    }

    pub fn list(&self) -> Result<Vec<PathBuf>, StateError> {
        let contents = match fs::read(&self.registry) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let entries: BTreeSet<PathBuf> = serde_json::from_slice(&contents)?;
        Ok(entries.into_iter().collect())
    }

    pub fn record(&self, path: &Path) -> Result<(), StateError> {
        let relative = path.strip_prefix(&self.workspace_root).unwrap_or(path).to_owned();
        let mut entries: BTreeSet<PathBuf> = self.list()?.into_iter().collect();
        if !entries.insert(relative) {
            return Ok(());
        }
        if let Some(parent) = self.registry.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.registry, serde_json::to_vec_pretty(&entries)?)?;
        Ok(())
    }

    /// Deletes every recorded file and the registry itself, returning what was removed
    pub fn remove_all(&self) -> Result<Vec<PathBuf>, StateError> {
        let mut removed = Vec::new();
        for relative in self.list()? {
            let path = self.workspace_root.join(&relative);
            match fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(code = "generated_file_missing", path = ?path);
                }
                Err(err) => return Err(err.into()),
            }
        }
        match fs::remove_file(&self.registry) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(removed)
    }

    /// Makes sure `.gitignore` excludes the state directory, recording the file if it had to be created
    pub fn ignore_state_dir(&self, state_dir_name: &str) -> Result<(), StateError> {
        let path = self.workspace_root.join(GITIGNORE);
        let entry = format!("/{}", state_dir_name);
        let existing = match trace_call_result!(fs::read_to_string(&path), expect: [NotFound]) {
            Ok(existing) => Some(existing),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        match existing {
            Some(existing) => {
                let listed = existing.lines().map(str::trim).any(|line| {
                    line.trim_end_matches('/') == entry || line.trim_end_matches('/') == state_dir_name
                });
                if listed {
                    return Ok(());
                }
                let mut contents = existing;
                if !contents.is_empty() && !contents.ends_with('\n') {
                    contents.push('\n');
                }
                contents.push_str(&entry);
                contents.push('\n');
                fs::write(&path, contents)?;
            }
            None => {
                fs::write(&path, format!("{}\n", entry))?;
                self.record(&path)?;
            }
        }
        debug!(code = "state_dir_ignored", path = ?path);
        Ok(())
    }
}

const GITIGNORE: &str = ".gitignore";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_files_removed() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join(".odo");
        let generated = GeneratedFiles::new(dir.path(), &state_dir);

        fs::write(dir.path().join("devfile.yaml"), "schemaVersion: 2.2.0\n").unwrap();
        generated.record(&dir.path().join("devfile.yaml")).unwrap();
        generated.record(&dir.path().join("devfile.yaml")).unwrap();
        generated.record(Path::new("gone.txt")).unwrap();
        assert_eq!(generated.list().unwrap(), vec![PathBuf::from("devfile.yaml"), PathBuf::from("gone.txt")]);

        let removed = generated.remove_all().unwrap();
        assert_eq!(removed, vec![dir.path().join("devfile.yaml")]);
        assert!(!dir.path().join("devfile.yaml").exists());
        assert!(generated.list().unwrap().is_empty());
    }

    #[test]
    fn gitignore_created_once_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let generated = GeneratedFiles::new(dir.path(), &dir.path().join(".odo"));

        generated.ignore_state_dir(".odo").unwrap();
        generated.ignore_state_dir(".odo").unwrap();
        assert_eq!(fs::read_to_string(dir.path().join(".gitignore")).unwrap(), "/.odo\n");
        assert_eq!(generated.list().unwrap(), vec![PathBuf::from(".gitignore")]);
    }

    #[test]
    fn existing_gitignore_is_appended_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "node_modules").unwrap();
        let generated = GeneratedFiles::new(dir.path(), &dir.path().join(".odo"));

        generated.ignore_state_dir(".odo").unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(".gitignore")).unwrap(),
            "node_modules\n/.odo\n"
        );
        assert!(generated.list().unwrap().is_empty());
    }
}
