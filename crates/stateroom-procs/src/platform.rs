//! Platform-specific process management.
//!
//! This module owns the OS boundary: liveness probes, graceful-then-forced
//! termination, and the spawn-time configuration that decides whether a
//! child dies with its parent (foreground) or outlives it (background).

// This module owns intentional OS/FFI boundaries; every unsafe block below
// carries a SAFETY note.
#![allow(unsafe_code)]

use std::process::Command;

use stateroom_core::Result;
#[cfg(not(unix))]
use stateroom_core::StateroomError;
use tracing::debug;

/// How a child process relates to its parent's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// The child should not outlive the parent.
    Foreground,
    /// The child runs in its own session and survives the parent's exit.
    Detached,
}

/// Configure a command according to its spawn mode, before `spawn()`.
pub fn prepare_spawn(cmd: &mut Command, mode: SpawnMode) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        match mode {
            SpawnMode::Detached => {
                // SAFETY: setsid() is async-signal-safe. The child becomes
                // a session leader with no controlling terminal, so signals
                // aimed at the parent's session never reach it.
                unsafe {
                    cmd.pre_exec(|| {
                        if libc::setsid() == -1 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
            }
            SpawnMode::Foreground => {
                // SAFETY: prctl(PR_SET_PDEATHSIG) is async-signal-safe. The
                // kernel delivers SIGTERM to the child when its parent
                // exits, which is the foreground-worker cleanup contract.
                #[cfg(target_os = "linux")]
                unsafe {
                    cmd.pre_exec(|| {
                        if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM as libc::c_ulong)
                            == -1
                        {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (cmd, mode);
    }
}

/// Check whether a process with the given PID is alive.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: kill with signal 0 performs only the existence check.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        tracing::warn!("process alive check not implemented for this platform");
        let _ = pid;
        true
    }
}

/// Terminate a process gracefully, then forcefully if needed.
///
/// Sends SIGTERM, waits up to `timeout_ms` while reaping, then SIGKILL.
/// Returns `true` if the process ended up dead (or was not running).
pub fn terminate_process(pid: u32, timeout_ms: u64) -> Result<bool> {
    if !is_process_alive(pid) {
        debug!("process {} is not running", pid);
        return Ok(true);
    }

    #[cfg(unix)]
    {
        terminate_process_unix(pid, timeout_ms)
    }

    #[cfg(not(unix))]
    {
        let _ = timeout_ms;
        Err(StateroomError::Other(
            "process termination not implemented for this platform".into(),
        ))
    }
}

#[cfg(unix)]
fn terminate_process_unix(pid: u32, timeout_ms: u64) -> Result<bool> {
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::Pid;
    use std::thread::sleep;
    use std::time::Duration;

    let nix_pid = Pid::from_raw(pid as i32);

    debug!("sending SIGTERM to process {}", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            return Ok(true);
        }
        tracing::warn!("failed to send SIGTERM to {}: {}", pid, e);
    }

    let wait_interval = Duration::from_millis(100);
    let iterations = (timeout_ms / 100).max(1);

    for _ in 0..iterations {
        sleep(wait_interval);
        // Reap if it was our child, so the liveness probe sees it gone.
        let _ = waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
        if !is_process_alive(pid) {
            debug!("process {} terminated gracefully", pid);
            return Ok(true);
        }
    }

    debug!("process {} still running, sending SIGKILL", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGKILL) {
        if e == nix::errno::Errno::ESRCH {
            return Ok(true);
        }
        tracing::warn!("failed to send SIGKILL to {}: {}", pid, e);
    }

    for _ in 0..10 {
        sleep(wait_interval);
        let _ = waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
        if !is_process_alive(pid) {
            return Ok(true);
        }
    }

    Ok(!is_process_alive(pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_nonexistent_pid_is_dead() {
        // Far above any default pid_max.
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    fn test_terminate_missing_process_is_silent() {
        assert!(terminate_process(999_999_999, 100).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_terminate_kills_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        assert!(terminate_process(pid, 1_000).unwrap());
        assert!(!is_process_alive(pid));
    }
}
