//! Fan-in of everything that can wake the session: file changes, workload changes, keys, signals and API requests

use std::{
    collections::{BTreeSet, VecDeque},
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use futures::{channel::mpsc, prelude::*};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use odo_core::{
    labels::{Mode, Selector},
    Cancellation,
};
use odo_platform::{PlatformClient, WorkloadEvent};
use odo_sync::IgnoreRules;

use crate::{
    api::ApiRequest,
    backoff::ExpBackoff,
    fswatch::{FsWatcher, PathChange},
};

/// File events arriving within this window are reported together
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KeyAction {
    PushNow,
    Shutdown,
}

#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct FsBatch {
    pub changed: BTreeSet<PathBuf>,
    pub deleted: BTreeSet<PathBuf>,
}

impl FsBatch {
    fn add(&mut self, change: PathChange) {
        if change.removed {
            self.changed.remove(&change.path);
            self.deleted.insert(change.path);
        } else {
            self.deleted.remove(&change.path);
            self.changed.insert(change.path);
        }
    }

    fn merge(&mut self, other: FsBatch) {
        for path in other.deleted {
            self.add(PathChange { path, removed: true });
        }
        for path in other.changed {
            self.add(PathChange { path, removed: false });
        }
    }

    pub fn touches(&self, path: &Path) -> bool {
        self.changed.contains(path) || self.deleted.contains(path)
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Event {
    Fs(FsBatch),
    Workload(WorkloadEvent),
    Key(KeyAction),
    Api(ApiRequest),
    /// A scheduled retry is due
    Tick,
}

impl Event {
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Event::Key(KeyAction::Shutdown) | Event::Api(ApiRequest::Shutdown))
    }
}

/// Which sources a [`Watcher`] listens to
#[derive(Clone, Copy, Debug)]
pub struct WatchSources {
    pub files: bool,
    pub workload: bool,
    /// Raw-mode keyboard input, when stdin is a terminal
    pub keys: bool,
    pub signals: bool,
}

impl Default for WatchSources {
    fn default() -> Self {
        WatchSources {
            files: true,
            workload: true,
            keys: true,
            signals: true,
        }
    }
}

pub struct Watcher {
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    pending: VecDeque<Event>,
    tasks: Vec<JoinHandle<()>>,
    _fs: Option<FsWatcher>,
    keys: Option<KeyReader>,
}

impl Watcher {
    #[tracing::instrument(level = "debug", err, skip(ignore, platform))]
    pub fn spawn(
        root: &Path,
        ignore: IgnoreRules,
        platform: Arc<dyn PlatformClient>,
        component: &str,
        sources: WatchSources,
    ) -> io::Result<Watcher> {
        let (tx, rx) = mpsc::unbounded();
        let mut tasks = Vec::new();

        let fs = if sources.files {
            let (watcher, changes) = FsWatcher::spawn(root, ignore)?;
            tasks.push(tokio::spawn(debounce(changes, DEBOUNCE_WINDOW, tx.clone())));
            Some(watcher)
        } else {
            None
        };
        if sources.workload {
            let selector = Selector::component(component, Some(Mode::Dev));
            tasks.push(tokio::spawn(watch_workload(platform, selector, tx.clone())));
        }
        if sources.signals {
            tasks.push(tokio::spawn(watch_signals(tx.clone())));
        }
        let keys = if sources.keys && atty::is(atty::Stream::Stdin) {
            match KeyReader::spawn(tx.clone()) {
                Ok(keys) => Some(keys),
                Err(err) => {
                    warn!(code = "raw_mode_unavailable", error = %err);
                    None
                }
            }
        } else {
            None
        };

        Ok(Watcher {
            tx,
            rx,
            pending: VecDeque::new(),
            tasks,
            _fs: fs,
            keys,
        })
    }

    /// Handle for other producers, such as the control API
    pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
        self.tx.clone()
    }

    /// Delivers [`Event::Tick`] after `delay`
    pub fn schedule_tick(&mut self, delay: Duration) {
        let tx = self.tx.clone();
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.unbounded_send(Event::Tick);
        }));
    }

    /// Next event to act on
    ///
    /// A shutdown request jumps the queue. Other events keep their order, except that every file batch already
    /// queued is folded into the first one, so changes made during a tick cause exactly one follow-up tick. Returns
    /// `None` once `cancel` fires.
    pub async fn next(&mut self, cancel: &Cancellation) -> Option<Event> {
        if self.pending.is_empty() {
            let event = cancel.run(self.rx.next()).await.ok().flatten()?;
            self.pending.push_back(event);
        }
        while let Ok(event) = self.rx.try_recv() {
            self.pending.push_back(event);
        }

        if let Some(index) = self.pending.iter().position(Event::is_shutdown) {
            return self.pending.remove(index);
        }
        match self.pending.pop_front()? {
            Event::Fs(mut batch) => {
                let mut rest = VecDeque::with_capacity(self.pending.len());
                for event in self.pending.drain(..) {
                    match event {
                        Event::Fs(more) => batch.merge(more),
                        other => rest.push_back(other),
                    }
                }
                self.pending = rest;
                Some(Event::Fs(batch))
            }
            event => Some(event),
        }
    }

    /// Resolves when a shutdown request arrives; other events stay queued for [`Watcher::next`]
    pub async fn shutdown_requested(&mut self) {
        if let Some(index) = self.pending.iter().position(Event::is_shutdown) {
            self.pending.remove(index);
            return;
        }
        while let Some(event) = self.rx.next().await {
            if event.is_shutdown() {
                return;
            }
            self.pending.push_back(event);
        }
        // The sender half lives in `self`, so the channel never closes while we wait.
        future::pending::<()>().await
    }

    /// Leaves raw mode so teardown output renders normally
    pub fn release_terminal(&mut self) {
        self.keys.take();
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn debounce(
    mut changes: mpsc::UnboundedReceiver<PathChange>,
    window: Duration,
    tx: mpsc::UnboundedSender<Event>,
) {
    while let Some(first) = changes.next().await {
        let mut batch = FsBatch::default();
        batch.add(first);
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        let mut closed = false;
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                change = changes.next() => match change {
                    Some(change) => batch.add(change),
                    None => {
                        closed = true;
                        break;
                    }
                },
            }
        }
        debug!(
            code = "fs_changes",
            changed = batch.changed.len(),
            deleted = batch.deleted.len()
        );
        if tx.unbounded_send(Event::Fs(batch)).is_err() || closed {
            return;
        }
    }
}

async fn watch_workload(platform: Arc<dyn PlatformClient>, selector: Selector, tx: mpsc::UnboundedSender<Event>) {
    let mut backoff = ExpBackoff::default();
    loop {
        match platform.watch_workload(&selector).await {
            Ok(mut stream) => {
                backoff.reset();
                while let Some(event) = stream.next().await {
                    match event {
                        Ok(event) => {
                            if tx.unbounded_send(Event::Workload(event)).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(code = "workload_watch_failed", error = %err);
                            break;
                        }
                    }
                }
            }
            Err(err) => warn!(code = "workload_watch_failed", error = %err),
        }
        let delay = backoff.next_delay();
        debug!(code = "workload_watch_reconnect", delay_ms = delay.as_millis() as u64);
        tokio::time::sleep(delay).await;
    }
}

async fn watch_signals(tx: mpsc::UnboundedSender<Event>) {
    loop {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(code = "signal_handler_failed", error = %err);
            return;
        }
        info!(code = "interrupt_received");
        if tx.unbounded_send(Event::Key(KeyAction::Shutdown)).is_err() {
            return;
        }
    }
}

/// Reads keys in raw mode on a dedicated thread; dropping it restores the terminal
struct KeyReader {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

const KEY_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl KeyReader {
    fn spawn(tx: mpsc::UnboundedSender<Event>) -> io::Result<KeyReader> {
        crossterm::terminal::enable_raw_mode()?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name("odo-keys".to_owned())
            .spawn(move || read_keys(&thread_stop, tx));
        match thread {
            Ok(thread) => Ok(KeyReader {
                stop,
                thread: Some(thread),
            }),
            Err(err) => {
                let _ = crossterm::terminal::disable_raw_mode();
                Err(err)
            }
        }
    }
}

impl Drop for KeyReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Err(err) = crossterm::terminal::disable_raw_mode() {
            warn!(code = "raw_mode_restore_failed", error = %err);
        }
    }
}

fn read_keys(stop: &AtomicBool, tx: mpsc::UnboundedSender<Event>) {
    use crossterm::event::{self, Event as TermEvent, KeyCode, KeyEventKind, KeyModifiers};

    while !stop.load(Ordering::SeqCst) {
        match event::poll(KEY_POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(err) => {
                warn!(code = "key_read_failed", error = %err);
                return;
            }
        }
        let key = match event::read() {
            Ok(TermEvent::Key(key)) if key.kind != KeyEventKind::Release => key,
            Ok(_) => continue,
            Err(err) => {
                warn!(code = "key_read_failed", error = %err);
                return;
            }
        };
        let action = match key.code {
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => KeyAction::Shutdown,
            KeyCode::Char('p') | KeyCode::Char('P') => KeyAction::PushNow,
            _ => continue,
        };
        debug!(code = "key_pressed", ?action);
        if tx.unbounded_send(Event::Key(action)).is_err() {
            return;
        }
    }
}
