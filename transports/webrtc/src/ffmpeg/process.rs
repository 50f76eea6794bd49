//! FFmpeg subprocess supervision
//!
//! The child is owned by a monitor task. Everything else talks to it
//! through a control channel and observes its exit through a watch
//! channel, so any number of tasks can wait for the exit without racing
//! over the `Child`.

use super::probe::OutputProbe;
use crate::{Error, Result};
use bytes::BytesMut;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

/// Longest output line kept before it is force-split
const MAX_LINE_LEN: usize = 4096;

/// Why the transcoder exited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Clean exit
    Normal,
    /// Exit with a non-zero code
    Error(i32),
    /// Terminated by a signal
    Killed,
}

impl ExitReason {
    fn from_status(status: ExitStatus) -> Self {
        if status.success() {
            ExitReason::Normal
        } else if let Some(code) = status.code() {
            ExitReason::Error(code)
        } else {
            ExitReason::Killed
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Terminate,
    Kill,
}

/// Handle to a running FFmpeg process
pub struct TranscoderProcess {
    pid: Option<u32>,
    control: mpsc::UnboundedSender<Control>,
    exit: watch::Receiver<Option<ExitReason>>,
    kill_started: AtomicBool,
    kill_grace: Duration,
}

impl TranscoderProcess {
    /// Spawn the transcoder
    ///
    /// stdout and stderr are always piped and scanned line by line by
    /// `probe`. Until the probe has found every expected value the output
    /// is logged at `info`, afterwards at `trace`.
    pub fn spawn(
        program: &Path,
        args: &[String],
        probe: Arc<OutputProbe>,
        kill_grace: Duration,
    ) -> Result<Self> {
        tracing::debug!(program = %program.display(), ?args, "Spawning transcoder");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::SubprocessFailure(format!(
                    "failed to spawn {}: {}",
                    program.display(),
                    e
                ))
            })?;

        let pid = child.id();
        tracing::info!(pid = ?pid, "Transcoder started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(scan_output(stdout, Arc::clone(&probe), pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(scan_output(stderr, probe, pid, "stderr"));
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(child, pid, control_rx, exit_tx));

        Ok(Self {
            pid,
            control: control_tx,
            exit: exit_rx,
            kill_started: AtomicBool::new(false),
            kill_grace,
        })
    }

    /// OS process id, if the platform reported one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit reason, once the process has exited
    pub fn exit_reason(&self) -> Option<ExitReason> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_reason().is_some()
    }

    /// Wait until the process exits
    pub async fn wait_exit(&self) -> ExitReason {
        let mut rx = self.exit.clone();
        let result = rx.wait_for(Option::is_some).await.map(|reason| *reason);
        match result {
            Ok(Some(reason)) => reason,
            // The monitor only drops the sender after publishing
            _ => ExitReason::Killed,
        }
    }

    /// Terminate the process: SIGTERM, then SIGKILL after the grace period
    ///
    /// Only the first call runs the sequence; later calls return at once.
    pub async fn kill(&self) {
        if self.kill_started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.has_exited() {
            return;
        }

        tracing::info!(pid = ?self.pid, "Terminating transcoder");
        let _ = self.control.send(Control::Terminate);

        if tokio::time::timeout(self.kill_grace, self.wait_exit())
            .await
            .is_err()
        {
            tracing::warn!(
                pid = ?self.pid,
                "Transcoder did not exit within {:?}, forcing kill",
                self.kill_grace
            );
            let _ = self.control.send(Control::Kill);
        }
    }
}

async fn monitor(
    mut child: Child,
    pid: Option<u32>,
    mut control: mpsc::UnboundedReceiver<Control>,
    exit: watch::Sender<Option<ExitReason>>,
) {
    let mut control_open = true;
    let reason = loop {
        tokio::select! {
            status = child.wait() => {
                break match status {
                    Ok(status) => ExitReason::from_status(status),
                    Err(e) => {
                        tracing::error!(pid = ?pid, "Failed waiting on transcoder: {}", e);
                        ExitReason::Killed
                    }
                };
            }
            command = control.recv(), if control_open => {
                match command {
                    Some(Control::Terminate) => send_terminate(&mut child),
                    Some(Control::Kill) => {
                        if let Err(e) = child.start_kill() {
                            tracing::debug!(pid = ?pid, "SIGKILL failed: {}", e);
                        }
                    }
                    None => {
                        control_open = false;
                        let _ = child.start_kill();
                    }
                }
            }
        }
    };

    match reason {
        ExitReason::Normal => tracing::info!(pid = ?pid, "Transcoder exited"),
        other => tracing::warn!(pid = ?pid, reason = ?other, "Transcoder exited"),
    }
    exit.send_replace(Some(reason));
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(id) = child.id() {
        if let Err(e) = kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
            tracing::debug!(pid = id, "SIGTERM failed: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    // No graceful signal available
    let _ = child.start_kill();
}

/// Split a chunked byte stream on `\r` / `\n` and feed each line to the probe
async fn scan_output<R>(mut reader: R, probe: Arc<OutputProbe>, pid: Option<u32>, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(MAX_LINE_LEN);
    let mut line = Vec::with_capacity(256);

    loop {
        buffer.clear();
        match reader.read_buf(&mut buffer).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(pid = ?pid, stream, "Transcoder output closed: {}", e);
                break;
            }
        }

        for &byte in buffer.iter() {
            if byte == b'\n' || byte == b'\r' {
                emit_line(&probe, &mut line, pid, stream);
            } else {
                line.push(byte);
                if line.len() >= MAX_LINE_LEN {
                    emit_line(&probe, &mut line, pid, stream);
                }
            }
        }
    }
    emit_line(&probe, &mut line, pid, stream);
}

fn emit_line(probe: &OutputProbe, line: &mut Vec<u8>, pid: Option<u32>, stream: &'static str) {
    if line.is_empty() {
        return;
    }
    let text = String::from_utf8_lossy(line);
    let text = text.trim_end();
    if !text.is_empty() {
        if probe.is_resolved() {
            tracing::trace!(pid = ?pid, stream, "{}", text);
        } else {
            tracing::info!(pid = ?pid, stream, "{}", text);
        }
        probe.feed_line(text);
    }
    line.clear();
}
