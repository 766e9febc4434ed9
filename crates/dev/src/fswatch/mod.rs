//! Recursive change notification for the workspace tree
//!
//! A watcher runs on its own thread and reports individual path changes. Coalescing them into reconcile triggers is
//! left to the session's event loop.

mod poll;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
    }
}

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use futures::channel::mpsc;
use tracing::debug;

use odo_sync::IgnoreRules;

/// Interval between tree scans when no native notification is available
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PathChange {
    pub path: PathBuf,
    pub removed: bool,
}

/// Stops the watcher thread when dropped
pub struct FsWatcher {
    backend: Backend,
}

enum Backend {
    #[cfg(target_os = "linux")]
    Inotify(linux::Interrupt),
    Poll(Arc<AtomicBool>),
}

impl FsWatcher {
    /// Watches `root` and every non-ignored directory below it
    pub fn spawn(root: &Path, ignore: IgnoreRules) -> io::Result<(FsWatcher, mpsc::UnboundedReceiver<PathChange>)> {
        let (tx, rx) = mpsc::unbounded();

        #[cfg(target_os = "linux")]
        match linux::Inotify::new(root, ignore.clone()) {
            Ok(inotify) => {
                let interrupt = inotify.interrupt();
                spawn_thread(move || inotify.run(tx))?;
                debug!(code = "fs_watch_started", backend = "inotify", root = ?root);
                return Ok((
                    FsWatcher {
                        backend: Backend::Inotify(interrupt),
                    },
                    rx,
                ));
            }
            Err(err) => {
                // Usually the per-user watch limit; scanning still works, only slower.
                tracing::warn!(code = "inotify_unavailable", error = %err, "falling back to polling");
            }
        }

        FsWatcher::spawn_polling(root, ignore, POLL_INTERVAL, tx).map(|watcher| (watcher, rx))
    }

    fn spawn_polling(
        root: &Path,
        ignore: IgnoreRules,
        interval: Duration,
        tx: mpsc::UnboundedSender<PathChange>,
    ) -> io::Result<FsWatcher> {
        let stop = Arc::new(AtomicBool::new(false));
        let scanner = poll::Scanner::new(root, ignore)?;
        let thread_stop = stop.clone();
        spawn_thread(move || scanner.run(interval, &thread_stop, tx))?;
        debug!(code = "fs_watch_started", backend = "poll", root = ?root);
        Ok(FsWatcher {
            backend: Backend::Poll(stop),
        })
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        match &self.backend {
            #[cfg(target_os = "linux")]
            Backend::Inotify(interrupt) => interrupt.fire(),
            Backend::Poll(stop) => stop.store(true, Ordering::SeqCst),
        }
    }
}

fn spawn_thread(f: impl FnOnce() + Send + 'static) -> io::Result<()> {
    thread::Builder::new().name("odo-fswatch".to_owned()).spawn(f)?;
    Ok(())
}
