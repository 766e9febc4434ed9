//! Long-running commands inside containers, driven through a small shell supervisor
//!
//! The supervisor is copied into the shared data volume once per pod. Each verb is a short exec, so nothing depends on
//! an exec stream staying open while the command runs.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use odo_core::Cancellation;
use odo_platform::{ExecOutput, ExecRequest, PlatformClient};
use odo_sync::extract_command;

use crate::CommandError;

pub const SUPERVISOR_ROOT: &str = "/opt/odo";
pub const SUPERVISOR_PATH: &str = "/opt/odo/bin/odo-supervisor.sh";

const SUPERVISOR_SCRIPT: &str = r#"#!/bin/sh
# Supervises long-running dev commands. State lives under $RUN_DIR/<command id>/.
RUN_DIR=${ODO_RUN_DIR:-/opt/odo/run}

alive() {
  [ -f "$1/pid" ] && kill -0 "$(cat "$1/pid")" 2>/dev/null
}

stop_one() {
  dir=$1
  grace=$2
  [ -f "$dir/pid" ] || return 0
  pid=$(cat "$dir/pid")
  touch "$dir/stopped"
  kill -TERM -"$pid" 2>/dev/null || kill -TERM "$pid" 2>/dev/null
  waited=0
  while kill -0 "$pid" 2>/dev/null && [ "$waited" -lt "$grace" ]; do
    sleep 1
    waited=$((waited + 1))
  done
  if kill -0 "$pid" 2>/dev/null; then
    kill -KILL -"$pid" 2>/dev/null || kill -KILL "$pid" 2>/dev/null
  fi
  return 0
}

verb=$1
shift
case "$verb" in
start)
  id=$1
  workdir=$2
  cmdline=$3
  shift 3
  dir="$RUN_DIR/$id"
  mkdir -p "$dir"
  if alive "$dir"; then
    echo running
    exit 0
  fi
  rm -f "$dir/pid" "$dir/exit" "$dir/stopped"
  : >"$dir/log"
  (
    trap '' HUP
    for assignment in "$@"; do export "$assignment"; done
    eval cd "\"$workdir\"" 2>>"$dir/log" || { echo 126 >"$dir/exit"; exit 0; }
    set -m
    sh -c "$cmdline" >>"$dir/log" 2>&1 </dev/null &
    child=$!
    echo "$child" >"$dir/pid"
    wait "$child"
    echo "$?" >"$dir/exit"
  ) >/dev/null 2>&1 </dev/null &
  echo starting
  ;;
status)
  dir="$RUN_DIR/$1"
  if [ -f "$dir/stopped" ]; then
    echo stopped
  elif [ -f "$dir/exit" ]; then
    echo "exited $(cat "$dir/exit")"
  elif alive "$dir"; then
    echo running
  elif [ -d "$dir" ]; then
    echo starting
  else
    echo absent
  fi
  ;;
stop)
  stop_one "$RUN_DIR/$1" "${2:-5}"
  echo stopped
  ;;
stop-all)
  for dir in "$RUN_DIR"/*/; do
    [ -d "$dir" ] && stop_one "${dir%/}" "${1:-5}"
  done
  echo stopped
  ;;
log)
  dir="$RUN_DIR/$1"
  [ -f "$dir/log" ] && tail -c +"$((${2:-0} + 1))" "$dir/log"
  exit 0
  ;;
*)
  echo "unknown verb $verb" >&2
  exit 2
  ;;
esac
"#;

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Debug)]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Failed,
    Unknown,
}

/// What the supervisor reports for one command
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reported {
    Absent,
    Starting,
    Running,
    Stopped,
    Exited(i32),
}

impl Reported {
    pub fn parse(output: &str) -> Option<Reported> {
        let line = output.lines().last()?.trim();
        match line {
            "absent" => Some(Reported::Absent),
            "starting" => Some(Reported::Starting),
            "running" => Some(Reported::Running),
            "stopped" => Some(Reported::Stopped),
            _ => line
                .strip_prefix("exited ")
                .and_then(|code| code.trim().parse().ok())
                .map(Reported::Exited),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ProcessSpec {
    pub command_id: String,
    pub command_line: String,
    pub working_dir: String,
    pub env: Vec<(String, String)>,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
struct ProcessKey {
    pod: String,
    container: String,
    command_id: String,
}

pub struct RemoteProcessController {
    platform: Arc<dyn PlatformClient>,
    installed: Mutex<HashSet<(String, String)>>,
    started: Mutex<HashMap<ProcessKey, Instant>>,
    grace: Duration,
    poll_interval: Duration,
    timeout: Duration,
}

impl RemoteProcessController {
    pub fn new(platform: Arc<dyn PlatformClient>, grace: Duration, timeout: Duration) -> RemoteProcessController {
        RemoteProcessController {
            platform,
            installed: Mutex::new(HashSet::new()),
            started: Mutex::new(HashMap::new()),
            grace,
            poll_interval: Duration::from_millis(250),
            timeout,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> RemoteProcessController {
        self.poll_interval = poll_interval;
        self
    }

    /// Forgets the supervisor installation and processes of a replaced pod
    pub fn invalidate(&self, pod: &str) {
        self.installed.lock().retain(|(installed_pod, _)| installed_pod != pod);
        self.started.lock().retain(|key, _| key.pod != pod);
    }

    /// Starts `spec` unless it is already running, waiting until the supervisor reports a pid
    #[tracing::instrument(level = "debug", err, skip(self, spec, cancel), fields(command = %spec.command_id))]
    pub async fn start(
        &self,
        pod: &str,
        container: &str,
        spec: &ProcessSpec,
        cancel: &Cancellation,
    ) -> Result<ProcessStatus, CommandError> {
        self.ensure_installed(pod, container, cancel).await?;

        let mut command = vec![
            "sh".to_owned(),
            SUPERVISOR_PATH.to_owned(),
            "start".to_owned(),
            spec.command_id.clone(),
            spec.working_dir.clone(),
            spec.command_line.clone(),
        ];
        command.extend(spec.env.iter().map(|(name, value)| format!("{}={}", name, value)));
        let output = self.supervisor(pod, container, command, cancel).await?;
        let key = ProcessKey {
            pod: pod.to_owned(),
            container: container.to_owned(),
            command_id: spec.command_id.clone(),
        };
        match Reported::parse(&output.stdout_lossy()) {
            Some(Reported::Running) => {
                debug!(code = "process_already_running", container);
                return Ok(ProcessStatus::Running);
            }
            Some(Reported::Starting) => {}
            _ => {
                return Err(CommandError::ProcessFailed {
                    id: spec.command_id.clone(),
                    reason: format!("unexpected supervisor output: {}", output.stderr_lossy().trim()),
                })
            }
        }
        self.started.lock().insert(key, Instant::now());

        let deadline = Instant::now() + self.grace;
        loop {
            match self.status(pod, container, &spec.command_id, cancel).await? {
                ProcessStatus::Running => {
                    info!(code = "process_started", container, command = %spec.command_id);
                    return Ok(ProcessStatus::Running);
                }
                ProcessStatus::Starting if Instant::now() < deadline => {}
                ProcessStatus::Stopped => return Ok(ProcessStatus::Stopped),
                _ => {
                    let log = self.read_log(pod, container, &spec.command_id, 0, cancel).await?;
                    return Err(CommandError::ProcessFailed {
                        id: spec.command_id.clone(),
                        reason: match String::from_utf8_lossy(&log).trim() {
                            "" => "the process exited before it could be observed".to_owned(),
                            log => log.lines().rev().take(5).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n"),
                        },
                    });
                }
            }
            cancel.run(tokio::time::sleep(self.poll_interval)).await?;
        }
    }

    /// Terminates a command, escalating to a kill after the grace period
    #[tracing::instrument(level = "debug", err, skip(self, cancel))]
    pub async fn stop(
        &self,
        pod: &str,
        container: &str,
        command_id: &str,
        cancel: &Cancellation,
    ) -> Result<(), CommandError> {
        if !self.is_installed(pod, container) {
            return Ok(());
        }
        let command = vec![
            "sh".to_owned(),
            SUPERVISOR_PATH.to_owned(),
            "stop".to_owned(),
            command_id.to_owned(),
            self.grace.as_secs().max(1).to_string(),
        ];
        self.supervisor(pod, container, command, cancel).await?;
        self.started.lock().remove(&ProcessKey {
            pod: pod.to_owned(),
            container: container.to_owned(),
            command_id: command_id.to_owned(),
        });
        info!(code = "process_stopped", container, command = command_id);
        Ok(())
    }

    pub async fn status(
        &self,
        pod: &str,
        container: &str,
        command_id: &str,
        cancel: &Cancellation,
    ) -> Result<ProcessStatus, CommandError> {
        if !self.is_installed(pod, container) {
            return Ok(ProcessStatus::Unknown);
        }
        let command = vec![
            "sh".to_owned(),
            SUPERVISOR_PATH.to_owned(),
            "status".to_owned(),
            command_id.to_owned(),
        ];
        let output = self.supervisor(pod, container, command, cancel).await?;
        let started = self
            .started
            .lock()
            .get(&ProcessKey {
                pod: pod.to_owned(),
                container: container.to_owned(),
                command_id: command_id.to_owned(),
            })
            .copied();
        let status = match Reported::parse(&output.stdout_lossy()) {
            Some(Reported::Running) => ProcessStatus::Running,
            Some(Reported::Stopped) | Some(Reported::Exited(0)) => ProcessStatus::Stopped,
            Some(Reported::Exited(_)) => ProcessStatus::Failed,
            Some(Reported::Starting) | Some(Reported::Absent) => match started {
                Some(at) if at.elapsed() < self.grace => ProcessStatus::Starting,
                Some(_) => ProcessStatus::Failed,
                None => ProcessStatus::Unknown,
            },
            None => ProcessStatus::Unknown,
        };
        Ok(status)
    }

    /// Output the command wrote after `offset` bytes
    pub async fn read_log(
        &self,
        pod: &str,
        container: &str,
        command_id: &str,
        offset: u64,
        cancel: &Cancellation,
    ) -> Result<Vec<u8>, CommandError> {
        if !self.is_installed(pod, container) {
            return Ok(Vec::new());
        }
        let command = vec![
            "sh".to_owned(),
            SUPERVISOR_PATH.to_owned(),
            "log".to_owned(),
            command_id.to_owned(),
            offset.to_string(),
        ];
        Ok(self.supervisor(pod, container, command, cancel).await?.stdout)
    }

    fn is_installed(&self, pod: &str, container: &str) -> bool {
        self.installed.lock().contains(&(pod.to_owned(), container.to_owned()))
    }

    async fn ensure_installed(&self, pod: &str, container: &str, cancel: &Cancellation) -> Result<(), CommandError> {
        if self.is_installed(pod, container) {
            return Ok(());
        }
        let archive = supervisor_archive().map_err(|err| CommandError::ProcessFailed {
            id: "supervisor".to_owned(),
            reason: err.to_string(),
        })?;
        let request = ExecRequest::new(pod, container, extract_command(SUPERVISOR_ROOT)).with_stdin(archive);
        let output = cancel
            .run_with_deadline(self.timeout, self.platform.exec_in_container(request))
            .await??;
        if !output.success() {
            return Err(CommandError::ProcessFailed {
                id: "supervisor".to_owned(),
                reason: format!("installing the supervisor failed: {}", output.stderr_lossy().trim()),
            });
        }
        debug!(code = "supervisor_installed", pod, container);
        self.installed.lock().insert((pod.to_owned(), container.to_owned()));
        Ok(())
    }

    async fn supervisor(
        &self,
        pod: &str,
        container: &str,
        command: Vec<String>,
        cancel: &Cancellation,
    ) -> Result<ExecOutput, CommandError> {
        let output = cancel
            .run_with_deadline(
                self.timeout,
                self.platform
                    .exec_in_container(ExecRequest::new(pod, container, command)),
            )
            .await??;
        if output.exit_code == 126 || output.exit_code == 127 {
            // The shared volume was recreated underneath us.
            self.installed.lock().remove(&(pod.to_owned(), container.to_owned()));
        }
        Ok(output)
    }
}

fn supervisor_archive() -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(SUPERVISOR_SCRIPT.len() as u64);
    header.set_mode(0o755);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, "bin/odo-supervisor.sh", SUPERVISOR_SCRIPT.as_bytes())?;
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_output_parsing() {
        assert_eq!(Reported::parse("running\n"), Some(Reported::Running));
        assert_eq!(Reported::parse("exited 0"), Some(Reported::Exited(0)));
        assert_eq!(Reported::parse("exited 137\n"), Some(Reported::Exited(137)));
        assert_eq!(Reported::parse("noise\nabsent\n"), Some(Reported::Absent));
        assert_eq!(Reported::parse(""), None);
        assert_eq!(Reported::parse("exited x"), None);
    }

    #[test]
    fn archive_contains_executable_script() {
        let archive = supervisor_archive().unwrap();
        let mut archive = tar::Archive::new(archive.as_slice());
        let entries: Vec<_> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                (
                    entry.path().unwrap().to_string_lossy().into_owned(),
                    entry.header().mode().unwrap(),
                )
            })
            .collect();
        assert_eq!(entries, vec![("bin/odo-supervisor.sh".to_owned(), 0o755)]);
    }
}
