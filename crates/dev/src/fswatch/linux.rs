use std::{
    collections::HashMap,
    ffi::{CStr, CString, OsStr},
    fs, io, mem,
    os::unix::prelude::*,
    path::{Path, PathBuf},
    sync::Arc,
};

use futures::channel::mpsc;
use libc::c_int;
use tracing::{trace, warn};

use odo_core::libc_call;
use odo_sync::IgnoreRules;

use super::PathChange;

const EVENT_BUFFER_SIZE: usize = 16384;

const WATCH_MASK: u32 = libc::IN_ATTRIB
    | libc::IN_CLOSE_WRITE
    | libc::IN_CREATE
    | libc::IN_DELETE
    | libc::IN_MODIFY
    | libc::IN_MOVED_FROM
    | libc::IN_MOVED_TO;

pub(super) struct Inotify {
    fd: OwnedFd,
    interrupt: Arc<OwnedFd>,
    root: PathBuf,
    ignore: IgnoreRules,
    // Directory watched by each descriptor
    dirs: HashMap<c_int, PathBuf>,
}

/// Wakes the watcher thread so it exits
pub(super) struct Interrupt(Arc<OwnedFd>);

impl Interrupt {
    pub(super) fn fire(&self) {
        let one = 1u64.to_ne_bytes();
        if let Err(err) = unsafe { libc_call!(libc::write(self.0.as_raw_fd(), one.as_ptr() as _, one.len())) } {
            warn!(code = "fs_watch_interrupt_failed", error = %err);
        }
    }
}

impl Inotify {
    pub(super) fn new(root: &Path, ignore: IgnoreRules) -> io::Result<Inotify> {
        let fd = unsafe { OwnedFd::from_raw_fd(libc_call!(libc::inotify_init1(libc::IN_CLOEXEC | libc::IN_NONBLOCK))?) };
        let interrupt =
            unsafe { OwnedFd::from_raw_fd(libc_call!(libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?) };
        let mut inotify = Inotify {
            fd,
            interrupt: Arc::new(interrupt),
            root: root.to_owned(),
            ignore,
            dirs: HashMap::new(),
        };
        inotify.add_tree(root)?;
        Ok(inotify)
    }

    pub(super) fn interrupt(&self) -> Interrupt {
        Interrupt(self.interrupt.clone())
    }

    /// Watches `dir` and its non-ignored subdirectories, returning the files already inside them
    fn add_tree(&mut self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let path = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
        let desc = unsafe { libc_call!(libc::inotify_add_watch(self.fd.as_raw_fd(), path.as_ptr(), WATCH_MASK)) }?;
        self.dirs.insert(desc, dir.to_owned());

        let mut files = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            // Removed again before we got to it; the parent reports the deletion.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_dir = entry.file_type()?.is_dir();
            if self.ignore.is_ignored(&path, is_dir) {
                continue;
            }
            if is_dir {
                files.extend(self.add_tree(&path)?);
            } else {
                files.push(path);
            }
        }
        Ok(files)
    }

    pub(super) fn run(mut self, tx: mpsc::UnboundedSender<PathChange>) {
        let mut buffer = vec![0u8; EVENT_BUFFER_SIZE];
        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.fd.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.interrupt.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            match unsafe { libc_call!(libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1), expect: [libc::EINTR]) } {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(code = "fs_watch_failed", error = %err);
                    return;
                }
            }
            if fds[1].revents & libc::POLLIN != 0 {
                return;
            }

            let read = match unsafe {
                libc_call!(
                    libc::read(self.fd.as_raw_fd(), buffer.as_mut_ptr() as _, buffer.len()),
                    expect: [libc::EAGAIN, libc::EINTR]
                )
            } {
                Ok(read) => read as usize,
                Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => continue,
                Err(err) => {
                    warn!(code = "fs_watch_failed", error = %err);
                    return;
                }
            };

            for change in self.decode(&buffer[..read]) {
                if tx.unbounded_send(change).is_err() {
                    return;
                }
            }
        }
    }

    fn decode(&mut self, mut bytes: &[u8]) -> Vec<PathChange> {
        let header = mem::size_of::<libc::inotify_event>();
        let mut changes = Vec::new();
        while bytes.len() >= header {
            let event = unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const libc::inotify_event) };
            let end = (header + event.len as usize).min(bytes.len());
            let name = CStr::from_bytes_until_nul(&bytes[header..end])
                .map(|name| name.to_bytes())
                .unwrap_or(&bytes[header..end]);
            let name = OsStr::from_bytes(name).to_owned();
            bytes = &bytes[end..];
            trace!(wd = event.wd, mask = event.mask, ?name, "inotify_event");

            if event.mask & libc::IN_Q_OVERFLOW != 0 {
                // Events were lost; report the root so the next sync rescans everything.
                changes.push(PathChange {
                    path: self.root.clone(),
                    removed: false,
                });
                continue;
            }
            if event.mask & libc::IN_IGNORED != 0 {
                self.dirs.remove(&event.wd);
                continue;
            }
            let dir = match self.dirs.get(&event.wd) {
                Some(dir) if !name.is_empty() => dir,
                _ => continue,
            };
            let path = dir.join(&name);
            let is_dir = event.mask & libc::IN_ISDIR != 0;
            if self.ignore.is_ignored(&path, is_dir) {
                continue;
            }

            let removed = event.mask & (libc::IN_DELETE | libc::IN_MOVED_FROM) != 0;
            if is_dir && !removed {
                match self.add_tree(&path) {
                    Ok(files) => changes.extend(files.into_iter().map(|path| PathChange { path, removed: false })),
                    Err(err) => warn!(code = "fs_watch_add_failed", path = ?path, error = %err),
                }
            }
            changes.push(PathChange { path, removed });
        }
        changes
    }
}
