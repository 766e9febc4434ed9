use std::path::{Path, PathBuf};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{debug, warn};

use odo_core::files::STATE_DIRECTORY;

pub const ODO_IGNORE_FILE: &str = ".odoignore";
pub const GIT_IGNORE_FILE: &str = ".gitignore";

/// Paths excluded from sync and file watching
#[derive(Clone, Debug)]
pub struct IgnoreRules {
    root: PathBuf,
    matcher: Gitignore,
}

impl IgnoreRules {
    /// Loads `.odoignore`, falling back to `.gitignore`, plus any extra patterns
    ///
    /// The tool's own state directory and `.git` are always excluded.
    pub fn load(root: &Path, extra: &[String]) -> IgnoreRules {
        let mut builder = GitignoreBuilder::new(root);
        let odo_ignore = root.join(ODO_IGNORE_FILE);
        let source = if odo_ignore.is_file() {
            Some(odo_ignore)
        } else {
            Some(root.join(GIT_IGNORE_FILE)).filter(|path| path.is_file())
        };
        if let Some(source) = &source {
            if let Some(error) = builder.add(source) {
                warn!(code = "ignore_file_invalid", path = ?source, "error parsing ignore file: {}", error);
            }
        }
        for pattern in [format!("/{}/", STATE_DIRECTORY), "/.git/".to_owned()]
            .iter()
            .chain(extra.iter())
        {
            if let Err(error) = builder.add_line(None, pattern) {
                warn!(code = "ignore_pattern_invalid", %pattern, "invalid ignore pattern: {}", error);
            }
        }
        let matcher = match builder.build() {
            Ok(matcher) => matcher,
            Err(error) => {
                warn!(code = "ignore_rules_invalid", "ignore rules could not be built: {}", error);
                Gitignore::empty()
            }
        };
        debug!(code = "ignore_rules_loaded", source = ?source, patterns = matcher.num_ignores());
        IgnoreRules {
            root: root.to_owned(),
            matcher,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `path` (absolute, or relative to the root) or any of its parents is ignored
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        if relative.as_os_str().is_empty() {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn odoignore_preferred_over_gitignore() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        fs::write(dir.path().join(".odoignore"), "node_modules/\n").unwrap();
        let rules = IgnoreRules::load(dir.path(), &[]);
        assert!(rules.is_ignored(Path::new("node_modules/express/index.js"), false));
        assert!(!rules.is_ignored(Path::new("debug.log"), false));
    }

    #[test]
    fn gitignore_used_as_fallback() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
        let rules = IgnoreRules::load(dir.path(), &[]);
        assert!(rules.is_ignored(&dir.path().join("debug.log"), false));
        assert!(!rules.is_ignored(&dir.path().join("app.js"), false));
    }

    #[test]
    fn state_and_git_always_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let rules = IgnoreRules::load(dir.path(), &["*.tmp".to_owned()]);
        assert!(rules.is_ignored(Path::new(".odo/devstate.json"), false));
        assert!(rules.is_ignored(Path::new(".git/HEAD"), false));
        assert!(rules.is_ignored(Path::new("scratch.tmp"), false));
        assert!(!rules.is_ignored(Path::new("src/.odo-notes"), false));
    }
}
