use std::{
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};

use odo_core::{process, process::Pid, trace_call_result, PlatformKind, SessionEnv};

use crate::{
    parse_state_file_name, state_file_name, ForwardedPort, SessionRecord, StateError, COMMON_STATE_FILE,
};

/// Liveness check for the pids recorded in state files
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: Pid) -> bool;
}

pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: Pid) -> bool {
        match process::process_alive(pid) {
            Ok(alive) => alive,
            Err(err) => {
                // Keep the file rather than risk reclaiming a live session's record.
                warn!(code = "liveness_check_failed", pid, "failed to check whether pid {} is alive: {}", pid, err);
                true
            }
        }
    }
}

pub struct StateStore {
    dir: PathBuf,
    record: SessionRecord,
    probe: Arc<dyn ProcessProbe>,
    owns_common: bool,
}

impl StateStore {
    /// Registers this session, reclaiming records left by dead processes
    ///
    /// Fails if a live session already targets the same platform from this workspace.
    #[tracing::instrument(level = "debug", err, skip(env, probe), fields(pid = env.pid, platform = %env.platform))]
    pub fn init(env: &SessionEnv, probe: Arc<dyn ProcessProbe>) -> Result<StateStore, StateError> {
        let dir = env.state_dir();
        trace_call_result!(fs::create_dir_all(&dir))?;

        for file in read_records(&dir)? {
            if file.pid == env.pid {
                continue;
            }
            if probe.is_alive(file.pid) {
                // A malformed record names no platform, so it cannot conflict.
                if file.platform == Some(env.platform) {
                    return Err(StateError::AlreadyRunningOnPlatform {
                        pid: file.pid,
                        platform: env.platform,
                    });
                }
                continue;
            }
            info!(code = "orphan_reclaimed", pid = file.pid, path = ?file.path, "reclaiming state of dead session {}", file.pid);
            remove_if_exists(&file.path)?;
        }

        let mut store = StateStore {
            dir,
            record: SessionRecord::new(env.pid, env.platform),
            probe,
            owns_common: false,
        };
        store.owns_common = store.common_available()?;
        store.flush()?;
        debug!(code = "state_initialized", owns_common = store.owns_common);
        Ok(store)
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    pub fn owns_common(&self) -> bool {
        self.owns_common
    }

    pub fn set_forwarded_ports(&mut self, ports: Vec<ForwardedPort>) -> Result<(), StateError> {
        if self.record.forwarded_ports == ports {
            return Ok(());
        }
        self.record.forwarded_ports = ports;
        self.flush()
    }

    pub fn set_api_port(&mut self, port: Option<u16>) -> Result<(), StateError> {
        self.record.api_server_port = port;
        self.flush()
    }

    /// Writes the pid file, and the common file while this session still holds it
    pub fn flush(&mut self) -> Result<(), StateError> {
        write_atomic(&self.dir.join(state_file_name(self.record.pid)), &self.record)?;
        if self.owns_common {
            if self.common_available()? {
                write_atomic(&self.dir.join(COMMON_STATE_FILE), &self.record)?;
            } else {
                warn!(code = "common_state_lost", "another live session now owns {}", COMMON_STATE_FILE);
                self.owns_common = false;
            }
        }
        Ok(())
    }

    /// Removes this session's records
    #[tracing::instrument(level = "debug", err, skip(self), fields(pid = self.record.pid))]
    pub fn release(self) -> Result<(), StateError> {
        remove_if_exists(&self.dir.join(state_file_name(self.record.pid)))?;
        let common = self.dir.join(COMMON_STATE_FILE);
        if let Some(current) = read_record(&common)? {
            if current.pid == self.record.pid {
                remove_if_exists(&common)?;
            }
        }
        Ok(())
    }

    // The common file may be written when it is absent, ours, or left by a dead process.
    fn common_available(&self) -> Result<bool, StateError> {
        match read_record(&self.dir.join(COMMON_STATE_FILE))? {
            None => Ok(true),
            Some(current) if current.pid == self.record.pid => Ok(true),
            Some(current) => Ok(!self.probe.is_alive(current.pid)),
        }
    }
}

/// State files whose owning process is gone, for cleanup by `delete --files`
pub fn get_orphan_files(state_dir: &Path, probe: &dyn ProcessProbe) -> Result<Vec<PathBuf>, StateError> {
    let mut orphans = Vec::new();
    for file in read_records(state_dir)? {
        if !probe.is_alive(file.pid) {
            orphans.push(file.path);
        }
    }
    let common = state_dir.join(COMMON_STATE_FILE);
    if let Some(record) = read_record(&common)? {
        if !probe.is_alive(record.pid) {
            orphans.push(common);
        }
    }
    orphans.sort();
    Ok(orphans)
}

/// A per-pid state file. `platform` is `None` when the file could not be parsed.
struct StateFile {
    path: PathBuf,
    pid: Pid,
    platform: Option<PlatformKind>,
}

fn read_records(dir: &Path) -> Result<Vec<StateFile>, StateError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut records = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let pid = match file_name.to_str().and_then(parse_state_file_name) {
            Some(pid) => pid,
            None => continue,
        };
        let path = entry.path();
        match read_record(&path) {
            Ok(Some(record)) => records.push(StateFile {
                path,
                pid: record.pid,
                platform: Some(record.platform),
            }),
            Ok(None) => {}
            Err(StateError::Json(err)) => {
                // The file name still identifies the owning pid.
                warn!(code = "state_file_invalid", path = ?path, "malformed state file: {}", err);
                records.push(StateFile {
                    path,
                    pid,
                    platform: None,
                });
            }
            Err(err) => return Err(err),
        }
    }
    records.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(records)
}

fn read_record(path: &Path) -> Result<Option<SessionRecord>, StateError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(serde_json::from_slice(&contents)?))
}

fn write_atomic(path: &Path, record: &SessionRecord) -> Result<(), StateError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::Builder::new().prefix(".devstate-").tempfile_in(dir)?;
    serde_json::to_writer_pretty(&mut temp, record)?;
    temp.write_all(b"\n")?;
    temp.as_file().sync_all()?;
    temp.persist(path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use super::*;

    struct FakeProbe(Mutex<HashSet<Pid>>);

    impl FakeProbe {
        fn alive(pids: &[Pid]) -> Arc<FakeProbe> {
            Arc::new(FakeProbe(Mutex::new(pids.iter().copied().collect())))
        }

        fn kill(&self, pid: Pid) {
            self.0.lock().unwrap().remove(&pid);
        }
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: Pid) -> bool {
            self.0.lock().unwrap().contains(&pid)
        }
    }

    fn env(root: &Path, pid: Pid, platform: PlatformKind) -> SessionEnv {
        SessionEnv {
            workspace_root: root.to_owned(),
            devfile_path: root.join("devfile.yaml"),
            pid,
            component: "web".to_owned(),
            app: "app".to_owned(),
            platform,
        }
    }

    #[test]
    fn second_session_on_same_platform_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FakeProbe::alive(&[100, 200]);
        let _first = StateStore::init(&env(dir.path(), 100, PlatformKind::Cluster), probe.clone()).unwrap();
        match StateStore::init(&env(dir.path(), 200, PlatformKind::Cluster), probe.clone()) {
            Err(StateError::AlreadyRunningOnPlatform { pid: 100, .. }) => {}
            other => panic!("unexpected result {:?}", other.map(|store| store.record().clone())),
        }
        let other_platform = StateStore::init(&env(dir.path(), 200, PlatformKind::Podman), probe).unwrap();
        assert!(!other_platform.owns_common());
    }

    #[test]
    fn dead_session_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FakeProbe::alive(&[100, 200]);
        let first = StateStore::init(&env(dir.path(), 100, PlatformKind::Cluster), probe.clone()).unwrap();
        assert!(first.owns_common());
        std::mem::forget(first);
        probe.kill(100);

        let state_dir = dir.path().join(".odo");
        assert_eq!(
            get_orphan_files(&state_dir, &*probe).unwrap(),
            vec![state_dir.join("devstate.100.json"), state_dir.join(COMMON_STATE_FILE)]
        );

        let second = StateStore::init(&env(dir.path(), 200, PlatformKind::Cluster), probe.clone()).unwrap();
        assert!(second.owns_common());
        assert!(!state_dir.join("devstate.100.json").exists());
        let common: SessionRecord = serde_json::from_slice(&fs::read(state_dir.join(COMMON_STATE_FILE)).unwrap()).unwrap();
        assert_eq!(common.pid, 200);
    }

    #[test]
    fn release_clears_owned_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FakeProbe::alive(&[100, 200]);
        let state_dir = dir.path().join(".odo");
        let mut owner = StateStore::init(&env(dir.path(), 100, PlatformKind::Cluster), probe.clone()).unwrap();
        let other = StateStore::init(&env(dir.path(), 200, PlatformKind::Podman), probe.clone()).unwrap();

        owner
            .set_forwarded_ports(vec![ForwardedPort {
                container_name: "web".to_owned(),
                local_address: "127.0.0.1".to_owned(),
                local_port: 20000,
                container_port: 3000,
                port_name: None,
                is_debug: false,
            }])
            .unwrap();

        other.release().unwrap();
        assert!(!state_dir.join("devstate.200.json").exists());
        let common: SessionRecord = serde_json::from_slice(&fs::read(state_dir.join(COMMON_STATE_FILE)).unwrap()).unwrap();
        assert_eq!(common.pid, 100);
        assert_eq!(common.forwarded_ports.len(), 1);

        owner.release().unwrap();
        assert!(!state_dir.join(COMMON_STATE_FILE).exists());
        assert!(!state_dir.join("devstate.100.json").exists());
    }

    #[test]
    fn malformed_record_of_live_session_does_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join(".odo");
        fs::create_dir_all(&state_dir).unwrap();
        let truncated = state_dir.join("devstate.100.json");
        fs::write(&truncated, r#"{"pid": 100, "platform": "podman""#).unwrap();
        let probe = FakeProbe::alive(&[100, 200, 300]);

        let store = StateStore::init(&env(dir.path(), 200, PlatformKind::Cluster), probe.clone()).unwrap();
        assert!(truncated.exists());
        store.release().unwrap();

        probe.kill(100);
        assert_eq!(get_orphan_files(&state_dir, &*probe).unwrap(), vec![truncated.clone()]);
        let _store = StateStore::init(&env(dir.path(), 300, PlatformKind::Podman), probe).unwrap();
        assert!(!truncated.exists());
    }
}
