use std::io;

use winapi::{
    shared::minwindef::{DWORD, FALSE},
    um::{
        handleapi::CloseHandle,
        minwinbase::STILL_ACTIVE,
        processthreadsapi::{GetExitCodeProcess, OpenProcess},
        winbase::CREATE_NEW_PROCESS_GROUP,
        wincon::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT},
        winnt::PROCESS_QUERY_LIMITED_INFORMATION,
    },
};

use super::Pid;

pub(super) fn process_alive(pid: Pid) -> io::Result<bool> {
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, FALSE, pid as DWORD);
        if handle.is_null() {
            return Ok(false);
        }
        let mut exit_code: DWORD = 0;
        let ok = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(exit_code == STILL_ACTIVE)
    }
}

pub(super) fn interrupt(pid: Pid) -> io::Result<()> {
    if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid as DWORD) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(super) fn new_process_group(command: &mut tokio::process::Command) -> &mut tokio::process::Command {
    command.creation_flags(CREATE_NEW_PROCESS_GROUP)
}
