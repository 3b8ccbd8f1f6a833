//! Speech engine helper supervision
//!
//! The helper is a child process speaking newline-delimited JSON over stdio.
//! Starting it spawns three tasks: a stdout reader that feeds complete lines
//! into a bounded channel, a stderr reader that logs diagnostics, and a
//! waiter that owns the [`Child`] and races its exit against a kill request.
//! The supervisor itself keeps only handles, so liveness and the exit code
//! are observable without blocking on the child.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::{Error, Result};

/// Depth of the stdout line channel; the bridge drains it every loop tick
const LINE_CHANNEL_DEPTH: usize = 256;

/// Handle to a running (or exited) helper child process
pub struct HelperProcess {
    stdin: Option<Arc<Mutex<ChildStdin>>>,
    running: Arc<AtomicBool>,
    exit_code: Arc<AtomicI32>,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    waiter: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl HelperProcess {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stdin: None,
            running: Arc::new(AtomicBool::new(false)),
            exit_code: Arc::new(AtomicI32::new(0)),
            pid: None,
            kill_tx: None,
            waiter: None,
            reader: None,
        }
    }

    /// Spawn the helper executable and wire up its stdio.
    ///
    /// Returns the receiving end of the stdout line channel. Lines are
    /// complete, newline-stripped; a full channel back-pressures the
    /// reader task until the bridge loop drains it.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable cannot be spawned or a stdio
    /// pipe is missing.
    pub fn start(&mut self, path: &Path) -> Result<mpsc::Receiver<String>> {
        let mut child = Command::new(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Helper(format!("cannot spawn {}: {e}", path.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Helper("helper stdin pipe missing".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Helper("helper stdout pipe missing".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Helper("helper stderr pipe missing".to_string()))?;

        self.pid = child.id();
        self.stdin = Some(Arc::new(Mutex::new(stdin)));
        self.running.store(true, Ordering::SeqCst);

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_DEPTH);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("helper stdout read failed: {e}");
                        break;
                    }
                }
            }
        });
        self.reader = Some(reader);

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "voicebridge::helper", "{line}");
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        self.kill_tx = Some(kill_tx);

        let running = Arc::clone(&self.running);
        let exit_code = Arc::clone(&self.exit_code);
        let waiter = tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    tracing::warn!("helper wait failed: {e}");
                    -1
                }
            };
            exit_code.store(code, Ordering::SeqCst);
            running.store(false, Ordering::SeqCst);
        });
        self.waiter = Some(waiter);

        tracing::info!(pid = self.pid, path = %path.display(), "helper started");
        Ok(line_rx)
    }

    /// Write one JSON line to the helper's stdin.
    ///
    /// A write failure means the child went away; the helper is marked as
    /// exited so the caller's next liveness check sees it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HelperNotRunning`] if the helper is not running,
    /// or [`Error::Helper`] if the write fails.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        if !self.is_running() {
            return Err(Error::HelperNotRunning);
        }
        let stdin = self.stdin.as_ref().ok_or(Error::HelperNotRunning)?;
        let mut stdin = stdin.lock().await;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            self.running.store(false, Ordering::SeqCst);
            return Err(Error::Helper(format!("helper stdin write failed: {e}")));
        }
        Ok(())
    }

    /// Stop the helper: best-effort shutdown line, then kill, then reap.
    ///
    /// Idempotent; safe to call on a helper that already exited or was
    /// never started.
    pub async fn stop(&mut self) {
        if self.is_running() {
            let _ = self.send_line("{\"type\":\"shutdown\"}").await;
        }
        // Closing stdin lets a cooperative helper exit on EOF.
        self.stdin = None;
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.await;
        }
        if let Some(reader) = self.reader.take() {
            // The reader may be parked on a full line channel that nobody
            // will drain anymore; cancel it rather than joining it.
            reader.abort();
            let _ = reader.await;
        }
        if let Some(pid) = self.pid.take() {
            tracing::info!(pid, exit_code = self.exit_code(), "helper stopped");
        }
    }

    /// Whether the child is still alive as far as the waiter knows
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Exit code of the last run; signal deaths map to `128 + signal`
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::SeqCst)
    }

    /// OS pid of the current or last child
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Default for HelperProcess {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
