//! Platform-specific process management.
//!
//! This module provides the single "process exists" capability that the
//! PID lock and the queue ownership handoff both rely on, plus graceful
//! termination for `force_kill_app`.

// This module owns an intentional OS/FFI boundary; each block is
// documented with `SAFETY:`.
#![allow(unsafe_code)]

use crate::error::{AgentError, Result};
use tracing::{debug, warn};

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: Uses `kill(pid, 0)` signal check
/// - **Windows**: Uses `OpenProcess` with `PROCESS_QUERY_LIMITED_INFORMATION`
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 doesn't actually send a signal, just checks that the
        // process exists and we may signal it.
        // SAFETY: kill with signal 0 only performs a permission/existence
        // probe; it never mutates process state.
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::Foundation::CloseHandle;
        use windows_sys::Win32::System::Threading::{
            OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
        };

        // SAFETY: OpenProcess/CloseHandle are paired; a null handle is
        // never dereferenced.
        unsafe {
            let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
            if !handle.is_null() {
                CloseHandle(handle);
                true
            } else {
                false
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

/// Terminate a process gracefully.
///
/// # Platform Behavior
/// - **Linux/macOS**: Sends SIGTERM
/// - **Windows**: Uses `taskkill /PID {pid}`
///
/// # Returns
/// `true` if the signal was delivered (or the process wasn't running).
pub fn terminate_process(pid: u32) -> Result<bool> {
    if !is_process_alive(pid) {
        debug!("Process {} is not running", pid);
        return Ok(true);
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        debug!("Sending SIGTERM to process {}", pid);
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => Ok(true),
            Err(nix::errno::Errno::ESRCH) => Ok(true),
            Err(e) => {
                warn!("Failed to send SIGTERM to {}: {}", pid, e);
                Err(AgentError::Other(format!(
                    "Failed to signal process {}: {}",
                    pid, e
                )))
            }
        }
    }

    #[cfg(windows)]
    {
        use std::process::Command;

        debug!("Terminating process {} with taskkill", pid);
        let output = Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .output()
            .map_err(|e| AgentError::Other(format!("Failed to run taskkill: {}", e)))?;

        if output.status.success() {
            Ok(true)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // "not found" errors are OK - process already dead
            if stderr.contains("not found") || stderr.contains("not running") {
                Ok(true)
            } else {
                warn!("taskkill failed for {}: {}", pid, stderr);
                Ok(false)
            }
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(AgentError::Other(
            "Process termination not implemented for this platform".into(),
        ))
    }
}
