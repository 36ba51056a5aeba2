//! Lifecycle of the service under test
//!
//! The supervisor spawns the configured start command in a controlled
//! environment, polls a readiness command until the service answers, and
//! tears the process down with a bounded grace window. A start failure is
//! fatal to the current environment group only; stop failures are logged,
//! never fatal, and `stop_environment` is safe to call repeatedly and after
//! a crash.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lines of service log quoted in the startup failure help message.
const HELP_LOG_LINES: usize = 20;
/// Poll cadence for child exit during stop drain and crash watching.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Shell command that starts the service.
    pub start_command: String,
    /// Shell command polled until exit 0.
    pub readiness_command: String,
    /// Optional shell command used to stop the service before signals.
    pub stop_command: Option<String>,
    pub readiness_timeout: Duration,
    pub readiness_interval: Duration,
    /// How long a graceful stop may take before the process is killed.
    pub stop_grace: Duration,
    /// Capture service stdout/stderr here; discarded when `None`.
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Starting,
    Ready,
    Stopping,
    Failed,
    Crashed,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to spawn service start command: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("service exited before becoming ready (exit code {code:?})")]
    ExitedEarly { code: Option<i32> },
    #[error("service did not become ready within {timeout:?}")]
    ReadinessTimeout { timeout: Duration },
    #[error("service startup cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct ServiceSupervisor {
    config: SupervisorConfig,
    state: Arc<Mutex<SupervisorState>>,
    child: Arc<tokio::sync::Mutex<Option<Child>>>,
    crashed_tx: watch::Sender<bool>,
    crashed_rx: watch::Receiver<bool>,
}

impl ServiceSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (crashed_tx, crashed_rx) = watch::channel(false);
        Self {
            config,
            state: Arc::new(Mutex::new(SupervisorState::Idle)),
            child: Arc::new(tokio::sync::Mutex::new(None)),
            crashed_tx,
            crashed_rx,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    /// Resolves when the child exits unexpectedly while in `Ready`. The
    /// executor races this against in-flight tests.
    pub fn crashed(&self) -> watch::Receiver<bool> {
        self.crashed_rx.clone()
    }

    /// Spawn the service with `extra_env` merged over the driver's own
    /// environment, then poll readiness until success, timeout, early exit,
    /// or cancellation.
    pub async fn start_environment(
        &self,
        extra_env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<(), StartupError> {
        *self.state.lock() = SupervisorState::Starting;
        let _ = self.crashed_tx.send(false);

        let mut cmd = Command::new("sh");
        cmd.arg("-lc").arg(&self.config.start_command);
        for (key, value) in extra_env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        match &self.config.log_path {
            Some(path) => {
                let file = open_log_file(path).map_err(StartupError::Other)?;
                let clone = file.try_clone().map_err(StartupError::Spawn)?;
                cmd.stdout(Stdio::from(file));
                cmd.stderr(Stdio::from(clone));
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }
        // Children die with the process group on force-kill; a new group
        // keeps terminal signals aimed at the driver from hitting the
        // service directly.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(StartupError::Spawn)?;
        let pid = child.id();
        info!(pid, command = %self.config.start_command, "service starting");
        *self.child.lock().await = Some(child);

        match self.poll_readiness(cancel).await {
            Ok(()) => {
                *self.state.lock() = SupervisorState::Ready;
                info!("service ready");
                self.spawn_crash_watcher();
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = SupervisorState::Failed;
                // Best-effort teardown of the half-started process.
                self.stop_environment().await;
                *self.state.lock() = SupervisorState::Failed;
                Err(err)
            }
        }
    }

    async fn poll_readiness(&self, cancel: &CancellationToken) -> Result<(), StartupError> {
        let deadline = tokio::time::Instant::now() + self.config.readiness_timeout;

        loop {
            if cancel.is_cancelled() {
                return Err(StartupError::Cancelled);
            }

            if let Some(child) = self.child.lock().await.as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(StartupError::ExitedEarly {
                        code: status.code(),
                    });
                }
            }

            let ready = Command::new("sh")
                .arg("-lc")
                .arg(&self.config.readiness_command)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|status| status.success())
                .unwrap_or(false);
            if ready {
                return Ok(());
            }

            debug!(command = %self.config.readiness_command, "service not ready yet");
            tokio::select! {
                _ = cancel.cancelled() => return Err(StartupError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(StartupError::ReadinessTimeout {
                        timeout: self.config.readiness_timeout,
                    });
                }
                _ = tokio::time::sleep(self.config.readiness_interval) => {}
            }
        }
    }

    fn spawn_crash_watcher(&self) {
        let child = self.child.clone();
        let state = self.state.clone();
        let crashed_tx = self.crashed_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CHILD_POLL_INTERVAL).await;
                if *state.lock() != SupervisorState::Ready {
                    return;
                }
                let mut guard = child.lock().await;
                let Some(running) = guard.as_mut() else {
                    return;
                };
                match running.try_wait() {
                    Ok(Some(status)) => {
                        if *state.lock() == SupervisorState::Ready {
                            warn!(code = ?status.code(), "service exited unexpectedly");
                            *state.lock() = SupervisorState::Crashed;
                            guard.take();
                            let _ = crashed_tx.send(true);
                        }
                        return;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "failed to poll service process");
                        return;
                    }
                }
            }
        });
    }

    /// Stop the service. Runs the configured stop command first when there
    /// is one, then falls back to SIGTERM, a bounded drain, and SIGKILL.
    /// Idempotent: calling with no child (or after a crash) is a no-op.
    pub async fn stop_environment(&self) {
        {
            let mut state = self.state.lock();
            if *state == SupervisorState::Stopping {
                return;
            }
            *state = SupervisorState::Stopping;
        }

        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            *self.state.lock() = SupervisorState::Idle;
            return;
        };
        drop(guard);

        if let Some(stop_command) = &self.config.stop_command {
            debug!(command = %stop_command, "running stop command");
            let mut stop = Command::new("sh");
            stop.arg("-lc")
                .arg(stop_command)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            match tokio::time::timeout(self.config.stop_grace, stop.status()).await {
                Ok(Ok(status)) if status.success() => {}
                Ok(Ok(status)) => warn!(code = ?status.code(), "stop command failed"),
                Ok(Err(err)) => warn!(error = %err, "stop command could not run"),
                Err(_) => warn!("stop command timed out"),
            }
        }

        if wait_for_exit(&mut child, CHILD_POLL_INTERVAL).await {
            *self.state.lock() = SupervisorState::Idle;
            info!("service stopped");
            return;
        }

        terminate_gracefully(&child);
        let drained = tokio::time::timeout(self.config.stop_grace, async {
            loop {
                if wait_for_exit(&mut child, CHILD_POLL_INTERVAL).await {
                    return;
                }
                tokio::time::sleep(CHILD_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!("service did not exit within grace window; killing");
            if let Err(err) = child.kill().await {
                warn!(error = %err, "failed to kill service process");
            }
        }
        let _ = child.wait().await;

        *self.state.lock() = SupervisorState::Idle;
        info!("service stopped");
    }

    /// User-facing summary for a startup failure: the readiness command that
    /// never succeeded plus the tail of the captured service log.
    pub fn startup_failure_help(&self) -> String {
        let mut help = format!(
            "service failed to become ready; readiness command was: {}",
            self.config.readiness_command
        );
        if let Some(path) = &self.config.log_path {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    let lines: Vec<&str> = contents.lines().collect();
                    let tail = &lines[lines.len().saturating_sub(HELP_LOG_LINES)..];
                    if !tail.is_empty() {
                        help.push_str("\nlast service log lines:\n");
                        for line in tail {
                            help.push_str("  ");
                            help.push_str(line);
                            help.push('\n');
                        }
                    }
                }
                Err(_) => {
                    help.push_str(&format!("\n(no service log at {})", path.display()));
                }
            }
        } else {
            help.push_str("\n(re-run with --enable-service-logs to capture service output)");
        }
        help
    }
}

fn open_log_file(path: &PathBuf) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open service log {}", path.display()))
}

async fn wait_for_exit(child: &mut Child, _poll: Duration) -> bool {
    matches!(child.try_wait(), Ok(Some(_)))
}

#[cfg(unix)]
fn terminate_gracefully(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    if let Some(pid) = child.id() {
        debug!(pid, "sending SIGTERM to service process group");
        // The child leads its own process group, so the negative pid reaches
        // the whole service tree, not just the launching shell.
        let group = Pid::from_raw(-(pid as i32));
        if kill(group, Signal::SIGTERM).is_err() {
            if let Err(err) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                warn!(pid, error = %err, "failed to signal service");
            }
        }
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(_child: &Child) {}
