use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fs, io,
    path::{Component, Path, PathBuf},
    time::UNIX_EPOCH,
};

use serde::{Deserialize, Serialize};
use tracing::warn;

use odo_core::trace_call_result;

use crate::IgnoreRules;

/// Snapshot of the synchronised tree, keyed by POSIX path relative to the root
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
pub struct FileIndex {
    pub files: BTreeMap<String, FileStamp>,
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct FileStamp {
    /// Nanoseconds since the Unix epoch
    pub mtime: u64,
    pub size: u64,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Changes {
    pub changed: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Keeps only paths equal to or below one of `filter`
    pub fn restrict_to(&mut self, filter: &[String]) {
        let keep = |path: &String| {
            filter.iter().any(|entry| {
                path == entry || (path.starts_with(entry.as_str()) && path.as_bytes().get(entry.len()) == Some(&b'/'))
            })
        };
        self.changed.retain(keep);
        self.deleted.retain(keep);
    }
}

impl FileIndex {
    /// Walks `root`, following symlinks once and skipping ignored paths
    pub fn compute(root: &Path, ignore: &IgnoreRules) -> io::Result<FileIndex> {
        let mut index = FileIndex::default();
        let mut visited = HashSet::new();
        let root_metadata = trace_call_result!(fs::metadata(root))?;
        visited.insert(DirIdentity::of(root, &root_metadata));
        walk(root, root, ignore, &mut visited, &mut index)?;
        Ok(index)
    }

    /// Files that differ from `previous`, and files `previous` had that are gone
    ///
    /// Without a previous index everything is considered changed and nothing deleted.
    pub fn diff(&self, previous: Option<&FileIndex>) -> Changes {
        let previous = match previous {
            Some(previous) => previous,
            None => {
                return Changes {
                    changed: self.files.keys().cloned().collect(),
                    deleted: BTreeSet::new(),
                }
            }
        };
        Changes {
            changed: self
                .files
                .iter()
                .filter(|(path, stamp)| previous.files.get(*path) != Some(stamp))
                .map(|(path, _)| path.clone())
                .collect(),
            deleted: previous
                .files
                .keys()
                .filter(|path| !self.files.contains_key(*path))
                .cloned()
                .collect(),
        }
    }

    /// The index the remote side holds after `changes` from `self` have been applied on top of `previous`
    pub fn applied_to(&self, previous: Option<&FileIndex>, changes: &Changes) -> FileIndex {
        let mut next = previous.cloned().unwrap_or_default();
        for path in &changes.changed {
            if let Some(stamp) = self.files.get(path) {
                next.files.insert(path.clone(), *stamp);
            }
        }
        for path in &changes.deleted {
            next.files.remove(path);
        }
        next
    }
}

#[derive(PartialEq, Eq, Hash)]
enum DirIdentity {
    #[cfg_attr(not(unix), allow(dead_code))]
    Inode(u64, u64),
    #[cfg_attr(unix, allow(dead_code))]
    Path(PathBuf),
}

impl DirIdentity {
    #[cfg(unix)]
    fn of(_path: &Path, metadata: &fs::Metadata) -> DirIdentity {
        use std::os::unix::fs::MetadataExt;
        DirIdentity::Inode(metadata.dev(), metadata.ino())
    }

    #[cfg(not(unix))]
    fn of(path: &Path, _metadata: &fs::Metadata) -> DirIdentity {
        DirIdentity::Path(fs::canonicalize(path).unwrap_or_else(|_| path.to_owned()))
    }
}

fn walk(
    root: &Path,
    dir: &Path,
    ignore: &IgnoreRules,
    visited: &mut HashSet<DirIdentity>,
    index: &mut FileIndex,
) -> io::Result<()> {
    let mut entries = trace_call_result!(fs::read_dir(dir))?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        // Follows symlinks, so a link is indexed as whatever it points at.
        let metadata = match trace_call_result!(fs::metadata(&path), expect: [NotFound]) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(code = "dangling_symlink", path = ?path, "skipping dangling symlink");
                continue;
            }
            Err(err) => return Err(err),
        };
        let relative = path.strip_prefix(root).unwrap_or(&path);
        if ignore.is_ignored(relative, metadata.is_dir()) {
            continue;
        }
        if metadata.is_dir() {
            if !visited.insert(DirIdentity::of(&path, &metadata)) {
                warn!(code = "symlink_loop", path = ?path, "directory already visited, skipping symlink loop");
                continue;
            }
            walk(root, &path, ignore, visited, index)?;
        } else if metadata.is_file() {
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
                .map(|elapsed| elapsed.as_nanos() as u64)
                .unwrap_or(0);
            index.files.insert(
                posix_path(relative),
                FileStamp {
                    mtime,
                    size: metadata.len(),
                },
            );
        }
    }
    Ok(())
}

/// Relative path with `/` separators regardless of the host
pub fn posix_path(relative: &Path) -> String {
    let mut out = String::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn rules(root: &Path) -> IgnoreRules {
        IgnoreRules::load(root, &[])
    }

    #[test]
    fn index_skips_ignored_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join(".odo")).unwrap();
        fs::write(dir.path().join("src/app.js"), "hello").unwrap();
        fs::write(dir.path().join(".odo/devstate.json"), "{}").unwrap();
        let index = FileIndex::compute(dir.path(), &rules(dir.path())).unwrap();
        let paths: Vec<_> = index.files.keys().cloned().collect();
        assert_eq!(paths, vec!["src/app.js"]);
        assert_eq!(index.files["src/app.js"].size, 5);
    }

    #[test]
    fn missing_previous_means_everything_changed() {
        let mut index = FileIndex::default();
        index.files.insert("a".to_owned(), FileStamp { mtime: 1, size: 0 });
        let changes = index.diff(None);
        assert_eq!(changes.changed.len(), 1);
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn diff_detects_changes_and_deletions() {
        let mut previous = FileIndex::default();
        previous.files.insert("same".to_owned(), FileStamp { mtime: 1, size: 1 });
        previous.files.insert("edited".to_owned(), FileStamp { mtime: 1, size: 1 });
        previous.files.insert("gone".to_owned(), FileStamp { mtime: 1, size: 1 });
        let mut current = FileIndex::default();
        current.files.insert("same".to_owned(), FileStamp { mtime: 1, size: 1 });
        current.files.insert("edited".to_owned(), FileStamp { mtime: 2, size: 1 });
        current.files.insert("new".to_owned(), FileStamp { mtime: 1, size: 1 });

        let changes = current.diff(Some(&previous));
        assert_eq!(changes.changed.iter().collect::<Vec<_>>(), vec!["edited", "new"]);
        assert_eq!(changes.deleted.iter().collect::<Vec<_>>(), vec!["gone"]);
        assert_eq!(current.applied_to(Some(&previous), &changes), current);
        assert!(current.diff(Some(&current)).is_empty());
    }

    #[test]
    fn restrict_to_matches_directories() {
        let mut changes = Changes::default();
        changes.changed.insert("src/app.js".to_owned());
        changes.changed.insert("srcfile".to_owned());
        changes.deleted.insert("docs/readme.md".to_owned());
        changes.restrict_to(&["src".to_owned()]);
        assert_eq!(changes.changed.iter().collect::<Vec<_>>(), vec!["src/app.js"]);
        assert!(changes.deleted.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_loops_are_visited_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a/file.txt"), "x").unwrap();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("a/loop")).unwrap();
        let index = FileIndex::compute(dir.path(), &rules(dir.path())).unwrap();
        assert_eq!(index.files.keys().collect::<Vec<_>>(), vec!["a/file.txt"]);
    }

    #[test]
    fn posix_separators() {
        let path: PathBuf = ["src", "lib", "mod.rs"].iter().collect();
        assert_eq!(posix_path(&path), "src/lib/mod.rs");
    }
}
