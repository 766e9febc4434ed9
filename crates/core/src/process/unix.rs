use std::io;

use super::Pid;
use crate::libc_call;

pub(super) fn process_alive(pid: Pid) -> io::Result<bool> {
    match unsafe { libc_call!(libc::kill(pid as libc::pid_t, 0), expect: [libc::ESRCH, libc::EPERM]) } {
        Ok(_) => Ok(true),
        Err(ref err) if err.raw_os_error() == Some(libc::ESRCH) => Ok(false),
        // The process exists but belongs to someone else
        Err(ref err) if err.raw_os_error() == Some(libc::EPERM) => Ok(true),
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
