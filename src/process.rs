//! Process-group helpers.
//!
//! Every external command (sandbox builds, agent runs, benchmark children) is
//! started as the leader of its own process group so that cancellation can
//! reach nested build and test subprocesses, not just the direct child.

use std::process::Command;

/// Signal delivered to a whole process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    /// Graceful request (SIGTERM).
    Terminate,
    /// Forceful kill (SIGKILL).
    Kill,
}

/// Make `command` start as the leader of a fresh process group.
pub fn isolate_process_group(command: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = command;
    }
}

/// Send `signal` to the process group led by `pid`.
///
/// Returns false when the group no longer exists.
pub fn signal_process_group(pid: u32, signal: GroupSignal) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        let signal = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        killpg(Pid::from_raw(raw), signal).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, signal);
        false
    }
}

pub fn kill_process_group(pid: u32) {
    if signal_process_group(pid, GroupSignal::Kill) {
        tracing::debug!(pid, "killed process group");
    }
}

/// Kills the process group it guards when dropped.
///
/// Async commands are cancelled by dropping their future; the guard makes
/// that cancellation reach every descendant of the command.
#[derive(Debug)]
pub struct ProcessGroupGuard {
    pid: u32,
}

impl ProcessGroupGuard {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        kill_process_group(self.pid);
    }
}

/// Whether `pid` still names a live (non-zombie) process.
pub fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => {
                // Field 3 follows the parenthesised command name.
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.split_whitespace().next());
                !matches!(state, Some("Z") | Some("X") | None)
            }
            Err(_) => false,
        }
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        match i32::try_from(pid) {
            Ok(raw) => kill(Pid::from_raw(raw), None).is_ok(),
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}
