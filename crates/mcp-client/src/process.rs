//! Peer process supervision.
//!
//! [`PeerProcess`] owns the child and its pipes for the whole session. The
//! stdin/stdout pair is wrapped in an [`RpcChannel`]; stderr is drained in
//! the background into `tracing` so the peer never blocks on a full pipe.
//!
//! Teardown is [`PeerProcess::shutdown`]: close stdin, request termination,
//! wait for the grace period, then kill. It is idempotent and never fails.
//! The child is also spawned with `kill_on_drop`, so a handle dropped
//! without shutdown (e.g. while unwinding) still takes the process down.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;

use mh_domain::config::PeerConfig;

use crate::protocol::{JsonRpcNotification, JsonRpcRequest, Response};
use crate::transport::{RpcChannel, RpcError};

/// Upper bound on waiting for the stderr drain to see EOF after exit.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a peer gets to exit on its own after stdin closes, before it
/// is signalled. Capped by the configured grace period.
const EOF_EXIT_WINDOW: Duration = Duration::from_millis(500);

/// The channel type used for a spawned peer.
pub type PeerChannel = RpcChannel<ChildStdout, ChildStdin>;

/// How the peer process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// It had already exited, or died on its own, by the time teardown
    /// started.
    AlreadyExited,
    /// It exited within the grace period after stdin close or SIGTERM.
    Graceful,
    /// It had to be killed.
    Killed,
    /// Waiting on it failed; the exit status is unknown.
    Unknown,
}

/// Result of tearing the peer down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Teardown {
    pub termination: Termination,
    pub status: Option<ExitStatus>,
}

impl Teardown {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }
}

/// A running (or torn down) peer process.
pub struct PeerProcess {
    command: String,
    pid: Option<u32>,
    child: Child,
    channel: Option<PeerChannel>,
    stderr_task: Option<JoinHandle<()>>,
    shutdown_grace: Duration,
    teardown: Option<Teardown>,
}

impl PeerProcess {
    /// Spawn the peer described by `config` with piped stdio.
    pub fn start(config: &PeerConfig) -> Result<Self, RpcError> {
        if let Some(artifact) = &config.artifact {
            let path = resolve_artifact(config, artifact);
            if !path.exists() {
                return Err(RpcError::ArtifactMissing { path });
            }
        }

        let command_line = config.command_line();
        let env = config.resolved_env();

        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &env {
            cmd.env(key, value);
        }

        let launch_error = |source: std::io::Error| RpcError::Launch {
            command: command_line.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(launch_error)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            launch_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            launch_error(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        let pid = child.id();
        let stderr_task = child.stderr.take().map(|stderr| drain_stderr(stderr, pid));

        tracing::info!(
            pid = ?pid,
            command = %command_line,
            env_keys = ?env.keys().collect::<Vec<_>>(),
            "peer started"
        );

        Ok(Self {
            command: config.command.clone(),
            pid,
            child,
            channel: Some(RpcChannel::new(stdout, stdin, config.read_timeout())),
            stderr_task,
            shutdown_grace: config.shutdown_grace(),
            teardown: None,
        })
    }

    /// OS process id, if the platform reported one at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The recorded teardown, once [`shutdown`](Self::shutdown) has run.
    pub fn teardown(&self) -> Option<Teardown> {
        self.teardown
    }

    /// Borrow the JSON-RPC channel. Fails once the peer has been shut down.
    pub fn channel(&mut self, method: &str) -> Result<&mut PeerChannel, RpcError> {
        self.channel.as_mut().ok_or_else(|| RpcError::Closed {
            method: method.to_string(),
        })
    }

    pub async fn exchange(&mut self, request: &JsonRpcRequest) -> Result<Response, RpcError> {
        self.channel(&request.method)?.exchange(request).await
    }

    pub async fn notify(&mut self, notification: &JsonRpcNotification) -> Result<(), RpcError> {
        self.channel(&notification.method)?.notify(notification).await
    }

    /// Tear the peer down: close stdin, give it a moment to exit on its own,
    /// request termination, wait up to the grace period, kill if it is
    /// still running.
    ///
    /// Safe to call more than once; later calls return the recorded result
    /// without signalling the (already reaped) process again.
    pub async fn shutdown(&mut self) -> Teardown {
        if let Some(done) = self.teardown {
            tracing::debug!(pid = ?self.pid, "peer already shut down");
            return done;
        }

        tracing::info!(pid = ?self.pid, command = %self.command, "shutting down peer");

        // Look before closing stdin, so a peer that already died is not
        // credited to the teardown.
        let exited_before = self.child.try_wait();

        // Close stdin to signal end of input; dropping the channel also
        // releases our end of stdout.
        if let Some(mut channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                tracing::debug!(error = %e, "error closing peer stdin");
            }
        }

        let teardown = match exited_before {
            Ok(Some(status)) => Teardown {
                termination: Termination::AlreadyExited,
                status: Some(status),
            },
            Ok(None) => self.wait_for_exit().await,
            Err(e) => {
                tracing::warn!(error = %e, "error polling peer process, killing");
                self.kill().await
            }
        };

        self.finish_stderr().await;

        tracing::info!(
            pid = ?self.pid,
            termination = ?teardown.termination,
            status = ?teardown.status,
            "peer process exited"
        );
        self.teardown = Some(teardown);
        teardown
    }

    async fn wait_for_exit(&mut self) -> Teardown {
        let window = EOF_EXIT_WINDOW.min(self.shutdown_grace);
        if let Ok(Ok(status)) = tokio::time::timeout(window, self.child.wait()).await {
            return Teardown {
                termination: unsignalled_exit(status),
                status: Some(status),
            };
        }
        self.request_termination();
        self.wait_or_kill().await
    }

    async fn wait_or_kill(&mut self) -> Teardown {
        match tokio::time::timeout(self.shutdown_grace, self.child.wait()).await {
            Ok(Ok(status)) => Teardown {
                termination: Termination::Graceful,
                status: Some(status),
            },
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for peer process");
                Teardown {
                    termination: Termination::Unknown,
                    status: None,
                }
            }
            Err(_) => {
                tracing::warn!(
                    grace = ?self.shutdown_grace,
                    "peer did not exit within grace period, killing"
                );
                self.kill().await
            }
        }
    }

    async fn kill(&mut self) -> Teardown {
        if let Err(e) = self.child.kill().await {
            tracing::warn!(error = %e, "failed to kill peer process");
        }
        Teardown {
            termination: Termination::Killed,
            status: self.child.try_wait().ok().flatten(),
        }
    }

    #[cfg(unix)]
    fn request_termination(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // `Child::id` is `None` once the child has been reaped.
        let Some(raw) = self.child.id().and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
            tracing::debug!(error = %e, pid = raw, "failed to send SIGTERM to peer");
        }
    }

    #[cfg(not(unix))]
    fn request_termination(&self) {
        // No polite signal here; closing stdin is the request.
    }

    async fn finish_stderr(&mut self) {
        let Some(task) = self.stderr_task.take() else {
            return;
        };
        let abort = task.abort_handle();
        if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await.is_err() {
            // A grandchild may still hold the pipe open.
            tracing::debug!("peer stderr still open after exit, detaching");
            abort.abort();
        }
    }
}

impl Drop for PeerProcess {
    fn drop(&mut self) {
        if self.teardown.is_none() {
            tracing::warn!(pid = ?self.pid, "peer handle dropped without shutdown, killing");
        }
    }
}

/// Classify an exit observed before the supervisor sent any signal. A
/// signal death at this point came from somewhere else (e.g. SIGPIPE).
#[cfg(unix)]
fn unsignalled_exit(status: ExitStatus) -> Termination {
    use std::os::unix::process::ExitStatusExt;

    if status.signal().is_some() {
        Termination::AlreadyExited
    } else {
        Termination::Graceful
    }
}

#[cfg(not(unix))]
fn unsignalled_exit(_status: ExitStatus) -> Termination {
    Termination::Graceful
}

/// Relative artifact paths are relative to the peer's working directory.
fn resolve_artifact(config: &PeerConfig, artifact: &std::path::Path) -> PathBuf {
    match &config.working_dir {
        Some(dir) if artifact.is_relative() => dir.join(artifact),
        _ => artifact.to_path_buf(),
    }
}

/// Forward peer stderr to `tracing` line by line until EOF.
///
/// Lines are raw bytes: a peer logging in a non-UTF-8 locale is still
/// drained, since dropping the pipe would kill it with SIGPIPE.
fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(&['\n', '\r'][..]);
                    tracing::debug!(target: "peer", pid = ?pid, "{line}");
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(target: "peer", pid = ?pid, error = %e, "stopped reading peer stderr");
                    break;
                }
            }
        }
    })
}
