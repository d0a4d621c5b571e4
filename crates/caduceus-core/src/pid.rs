//! Process-singleton PID file management.
//!
//! Prevents two agent instances from running at the same time. The PID
//! file records the decimal process id of the running agent; startup
//! probes the recorded process for liveness before deciding whether a
//! found file means "already running" or is stale debris from a crash.
//!
//! # Platform Behavior
//! - **Linux/macOS**: `<tmpdir>/caduceus/<app>.pid`
//! - **Windows**: `%ProgramData%/Caduceus/pids/<app>.pid`

use crate::config::{AppConfig, PidConfig};
use crate::error::{AgentError, Result};
use crate::platform;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Resolve the OS-specific PID file path for an application name.
pub fn pid_file_path(app_name: &str) -> Result<PathBuf> {
    #[cfg(unix)]
    {
        Ok(std::env::temp_dir()
            .join(AppConfig::PID_DIR_NAME)
            .join(format!("{}.pid", app_name)))
    }

    #[cfg(windows)]
    {
        let program_data = std::env::var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("C:/ProgramData"));
        Ok(program_data
            .join("Caduceus")
            .join("pids")
            .join(format!("{}.pid", app_name)))
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(AgentError::Config {
            message: format!("No PID file location for this platform ({})", app_name),
        })
    }
}

/// Create the PID file for an application, failing if a live instance
/// already holds it.
///
/// Returns the path of the created file.
pub fn create_pid_file(app_name: &str) -> Result<PathBuf> {
    let path = pid_file_path(app_name)?;
    create_pid_file_at(&path, app_name)?;
    Ok(path)
}

/// Create a PID file at an explicit path. Split out from
/// [`create_pid_file`] so tests and embedders can use their own directory.
///
/// 1. An existing file is probed: a live recorded PID aborts with
///    "already running"; a stale one is logged and overwritten.
/// 2. The containing directory is created if missing.
/// 3. The PID is written to a temp file and atomically renamed over the
///    target, so no reader ever observes a partial write.
pub fn create_pid_file_at(path: &Path, app_name: &str) -> Result<()> {
    if path.exists() {
        match read_pid(path) {
            Some(pid) if platform::is_process_alive(pid) => {
                return Err(AgentError::AlreadyRunning {
                    app: app_name.to_string(),
                    pid,
                });
            }
            Some(pid) => {
                warn!("Removing stale PID file for dead process {}", pid);
                let _ = std::fs::remove_file(path);
            }
            None => {
                warn!("Removing unreadable PID file {}", path.display());
                let _ = std::fs::remove_file(path);
            }
        }
    }

    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent)?;
    }

    let pid = std::process::id();
    let tmp_path = path.with_extension(format!("pid.{}.tmp", pid));
    std::fs::write(&tmp_path, pid.to_string())
        .map_err(|e| AgentError::io_with_path(e, &tmp_path))?;
    std::fs::rename(&tmp_path, path).map_err(|e| AgentError::io_with_path(e, path))?;

    info!("Created PID file {} (pid {})", path.display(), pid);
    Ok(())
}

/// Remove the PID file if present. Logs failures instead of returning
/// them - removal runs on shutdown paths that must not throw.
pub fn remove_pid_file(app_name: &str) {
    match pid_file_path(app_name) {
        Ok(path) => remove_pid_file_at(&path),
        Err(e) => error!("Cannot resolve PID file path: {}", e),
    }
}

/// Remove a PID file at an explicit path, best-effort.
pub fn remove_pid_file_at(path: &Path) {
    if !path.exists() {
        return;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed PID file {}", path.display()),
        Err(e) => error!("Error removing PID file: {}: {}", path.display(), e),
    }
}

/// Read the PID recorded for an application, if any. Non-numeric contents
/// are ignored.
pub fn get_app_pid(app_name: &str) -> Option<u32> {
    pid_file_path(app_name).ok().and_then(|path| read_pid(&path))
}

/// Wait for an application's PID file to appear.
///
/// Polls at a fixed interval; fails with a timeout error if the file has
/// not appeared within `timeout`.
pub async fn wait_for_pid_file(app_name: &str, timeout: Duration) -> Result<PathBuf> {
    let path = pid_file_path(app_name)?;
    wait_for_pid_file_at(&path, timeout).await?;
    Ok(path)
}

/// Wait for a PID file at an explicit path.
pub async fn wait_for_pid_file_at(path: &Path, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !path.exists() {
        if Instant::now() >= deadline {
            return Err(AgentError::Timeout {
                operation: "waiting for PID file".to_string(),
                elapsed: timeout,
            });
        }
        tokio::time::sleep(PidConfig::WAIT_POLL_INTERVAL).await;
    }
    Ok(())
}

/// Signal the recorded process of an application to terminate.
///
/// Returns `true` if a termination signal was delivered (or no instance
/// was running).
pub fn force_kill_app(app_name: &str) -> Result<bool> {
    match get_app_pid(app_name) {
        Some(pid) => platform::terminate_process(pid),
        None => {
            debug!("No PID file for {}; nothing to kill", app_name);
            Ok(true)
        }
    }
}

/// Register PID file removal on every exit path: termination signals
/// (Ctrl-C, SIGTERM, SIGHUP) and panics.
///
/// Call once at startup, after [`create_pid_file`]. The signal handler
/// exits the process after cleanup; the panic hook cleans up and lets the
/// panic continue so the crash is still reported. Callers that run their
/// own signal loop (the agent daemon does) use
/// [`register_panic_cleanup`] alone and remove the file themselves on
/// shutdown.
pub fn register_cleanup(app_name: &str) -> Result<()> {
    register_panic_cleanup(app_name);

    let signal_app = app_name.to_string();
    ctrlc::set_handler(move || {
        info!("Termination signal received; removing PID file");
        remove_pid_file(&signal_app);
        std::process::exit(0);
    })
    .map_err(|e| AgentError::Config {
        message: format!("Failed to register signal handler: {}", e),
    })
}

/// Register PID file removal on panic only.
pub fn register_panic_cleanup(app_name: &str) {
    let panic_app = app_name.to_string();
    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        remove_pid_file(&panic_app);
        previous_hook(panic_info);
    }));
}

fn ensure_directory_exists(dir: &Path) -> Result<()> {
    if dir.exists() {
        return Ok(());
    }
    std::fs::create_dir_all(dir).map_err(|e| AgentError::io_with_path(e, dir))
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|contents| contents.trim().parse::<u32>().ok())
}
