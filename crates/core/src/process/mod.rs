cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        #[path = "linux.rs"]
        mod platform;
    } else if #[cfg(unix)] {
        #[path = "unix.rs"]
        mod platform;
    } else if #[cfg(target_os = "windows")] {
        #[path = "windows.rs"]
        mod platform;
    } else {
        compile_error!("unsupported platform");
    }
}

use std::io;

pub type Pid = u32;

/// Pid of the running tool process
pub fn current_pid() -> Pid {
    std::process::id()
}

/// Determines whether a process with the given pid is alive
///
/// Zombie and stopped processes are treated as dead, since they will never write to a session record again.
pub fn process_alive(pid: Pid) -> io::Result<bool> {
    platform::process_alive(pid)
}

/// Asks a child process to shut down gracefully
///
/// On POSIX systems this sends `SIGINT`. On Windows a `CTRL_BREAK_EVENT` is delivered to the child's process group,
/// which requires the child to have been spawned through [`new_process_group`].
pub fn terminate_proc(child: &tokio::process::Child) -> io::Result<()> {
    match child.id() {
        Some(pid) => platform::interrupt(pid),
        // Already reaped
        None => Ok(()),
    }
}

/// Configures a command so [`terminate_proc`] can reach the spawned child
pub fn new_process_group(command: &mut tokio::process::Command) -> &mut tokio::process::Command {
    platform::new_process_group(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(process_alive(current_pid()).unwrap());
    }

    #[test]
    fn reaped_child_is_dead() {
        let mut child = std::process::Command::new(if cfg!(windows) { "cmd" } else { "true" })
            .args(if cfg!(windows) { &["/C", "exit"][..] } else { &[][..] })
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!process_alive(pid).unwrap());
    }
}
