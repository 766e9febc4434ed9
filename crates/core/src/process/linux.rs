use std::io;

use procfs::{process::ProcState, ProcError};

use super::Pid;
use crate::libc_call;

pub(super) fn process_alive(pid: Pid) -> io::Result<bool> {
    let process = match procfs::process::Process::new(pid as i32) {
        Ok(process) => process,
        Err(ProcError::NotFound(_)) => return Ok(false),
        Err(err) => return Err(io::Error::new(io::ErrorKind::Other, err.to_string())),
    };
    let state = process
        .stat()
        .and_then(|stat| stat.state())
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()));
    match state {
        Ok(ProcState::Zombie) | Ok(ProcState::Stopped) | Ok(ProcState::Dead) => Ok(false),
        Ok(_) => Ok(true),
        // Exited between the lookup and the stat read
        Err(_) if !procfs::process::Process::new(pid as i32).is_ok() => Ok(false),
        Err(err) => Err(err),
    }
}

pub(super) fn interrupt(pid: Pid) -> io::Result<()> {
    unsafe { libc_call!(libc::kill(pid as libc::pid_t, libc::SIGINT))? };
    Ok(())
}

pub(super) fn new_process_group(command: &mut tokio::process::Command) -> &mut tokio::process::Command {
    command
}
