use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use futures::channel::mpsc;
use tracing::warn;

use odo_sync::{FileIndex, IgnoreRules};

use super::PathChange;

/// Detects changes by comparing successive indexes of the tree
pub(super) struct Scanner {
    root: PathBuf,
    ignore: IgnoreRules,
    last: FileIndex,
}

impl Scanner {
    pub(super) fn new(root: &Path, ignore: IgnoreRules) -> io::Result<Scanner> {
        let last = FileIndex::compute(root, &ignore)?;
        Ok(Scanner {
            root: root.to_owned(),
            ignore,
            last,
        })
    }

    pub(super) fn scan(&mut self) -> io::Result<Vec<PathChange>> {
        let next = FileIndex::compute(&self.root, &self.ignore)?;
        let changes = next.diff(Some(&self.last));
        self.last = next;
        let changed = changes.changed.iter().map(|path| (path, false));
        let deleted = changes.deleted.iter().map(|path| (path, true));
        Ok(changed
            .chain(deleted)
            .map(|(path, removed)| PathChange {
                path: self.root.join(path),
                removed,
            })
            .collect())
    }

    pub(super) fn run(mut self, interval: Duration, stop: &AtomicBool, tx: mpsc::UnboundedSender<PathChange>) {
        while !stop.load(Ordering::SeqCst) {
            thread::sleep(interval);
            let changes = match self.scan() {
                Ok(changes) => changes,
                Err(err) => {
                    warn!(code = "fs_scan_failed", error = %err);
                    continue;
                }
            };
            for change in changes {
                if tx.unbounded_send(change).is_err() {
                    return;
                }
            }
        }
    }
}
