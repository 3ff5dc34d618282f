//! Process utilities for vinectl
//!
//! Liveness checks and termination of other controller processes.

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

fn to_pid(pid: u32) -> Option<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

/// Check if a process with the given PID is alive
///
/// Sends signal 0, which performs the existence and permission checks
/// without delivering anything. A process owned by another user answers
/// `EPERM`; it exists, so it counts as alive.
///
/// # Arguments
/// * `pid` - The process ID to check
///
/// # Returns
/// * `true` - The process exists
/// * `false` - The process doesn't exist, or `pid` is not a valid process ID
pub fn is_process_alive(pid: u32) -> bool {
    let Some(pid) = to_pid(pid) else {
        return false;
    };

    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Ask a process to terminate with SIGTERM.
///
/// A process that has already exited is not an error.
pub fn terminate(pid: u32) -> Result<()> {
    let Some(target) = to_pid(pid) else {
        bail!("invalid process id {pid}");
    };

    match kill(target, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to send SIGTERM to {pid}")),
    }
}

/// PID of the running process.
pub fn current_pid() -> u32 {
    std::process::id()
}
