//! Process transport: one child process, newline-delimited JSON on stdio.
//!
//! Three background tasks run per process: a stdout reader feeding the
//! framing codec, a stderr reader that only logs, and a supervisor that owns
//! the [`Child`] and reports its exit. The readers keep draining both pipes
//! through shutdown so a server writing on its way out never hits a closed
//! pipe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use conduit_domain::config::{ClientOptions, ServerDescriptor, TransportSpec};

use super::{EventSink, ExitStatusInfo, TransportError};
use crate::codec::{encode_frame, Frame, LineBuffer};

/// How long to wait for the process to be reaped after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Size of one stdout read.
const READ_CHUNK: usize = 8 * 1024;

/// Communicates with a child process over stdin/stdout.
pub struct ProcessTransport {
    server: String,
    stdin: Mutex<Option<ChildStdin>>,
    pid: Option<u32>,
    closed: Arc<AtomicBool>,
    /// Stops the stdout/stderr loops once the child is gone.
    readers: CancellationToken,
    /// Asks the supervisor to SIGKILL the child.
    kill: CancellationToken,
    exit: watch::Receiver<Option<ExitStatusInfo>>,
    kill_grace: Duration,
    options: Arc<ClientOptions>,
    events: Arc<EventSink>,
}

impl ProcessTransport {
    /// Spawn the child described by `descriptor` and start its I/O loops.
    ///
    /// A spawn failure is reported on the event channel as well as returned.
    pub(crate) fn spawn(
        descriptor: &ServerDescriptor,
        options: &ClientOptions,
        events: EventSink,
    ) -> Result<Self, TransportError> {
        let TransportSpec::Process { command, args, env, cwd } = &descriptor.transport else {
            return Err(TransportError::InvalidConfig(
                "process transport requires a process descriptor".into(),
            ));
        };

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = TransportError::Spawn {
                    command: command.clone(),
                    message: e.to_string(),
                };
                events.fault(err.clone());
                return Err(err);
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let err = TransportError::Spawn {
                command: command.clone(),
                message: "failed to capture child stdio".into(),
            };
            events.fault(err.clone());
            return Err(err);
        };

        let server = events.server().to_string();
        let pid = child.id();
        tracing::debug!(server = %server, command = %command, ?pid, "spawned MCP server process");

        let events = Arc::new(events);
        let closed = Arc::new(AtomicBool::new(false));
        let readers = CancellationToken::new();
        let kill = CancellationToken::new();
        let (exit_tx, exit_rx) = watch::channel(None);
        let options = Arc::new(options.clone());

        tokio::spawn(read_stdout(
            stdout,
            Arc::clone(&events),
            Arc::clone(&closed),
            readers.clone(),
        ));
        tokio::spawn(read_stderr(stderr, server.clone(), readers.clone()));
        tokio::spawn(supervise(
            child,
            Arc::clone(&events),
            Arc::clone(&closed),
            kill.clone(),
            exit_tx,
            Arc::clone(&options),
        ));

        Ok(Self {
            server,
            stdin: Mutex::new(Some(stdin)),
            pid,
            closed,
            readers,
            kill,
            exit: exit_rx,
            kill_grace: options.kill_grace(),
            options,
            events,
        })
    }

    /// Write one frame as a single line on the child's stdin.
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let mut line = encode_frame(frame)?;
        line.push('\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::Closed)?;
        let written: std::io::Result<()> = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            let err = TransportError::from(e);
            if matches!(err, TransportError::BrokenPipe(_)) && !self.is_closed() {
                self.events.fault(err.clone());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Close stdin, SIGTERM, then SIGKILL after the grace window. Later
    /// calls only wait for the exit.
    ///
    /// Fails if the process exits with a non-benign status during the grace
    /// window. An exit that happened before `close` was already reported on
    /// the event channel and is not repeated here.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            self.wait_exit(self.kill_grace + KILL_WAIT).await;
            return Ok(());
        }

        if self.exit.borrow().is_some() {
            self.readers.cancel();
            return Ok(());
        }

        match tokio::time::timeout(self.kill_grace, self.stdin.lock()).await {
            Ok(mut guard) => {
                if let Some(mut stdin) = guard.take() {
                    if let Err(e) = stdin.shutdown().await {
                        tracing::debug!(server = %self.server, error = %e, "error closing MCP server stdin");
                    }
                }
            }
            Err(_) => {
                tracing::debug!(server = %self.server, "stdin busy during close, skipping shutdown");
            }
        }

        self.terminate();

        if let Some(status) = self.wait_exit(self.kill_grace).await {
            self.readers.cancel();
            if is_benign(&status, &self.options) {
                tracing::debug!(server = %self.server, %status, "MCP server process exited");
                return Ok(());
            }
            tracing::warn!(server = %self.server, %status, "MCP server process failed during shutdown");
            return Err(TransportError::UnexpectedExit(status));
        }

        tracing::warn!(
            server = %self.server,
            grace_ms = self.kill_grace.as_millis() as u64,
            "MCP server process did not exit within grace window, killing"
        );
        self.kill.cancel();
        let killed = self.wait_exit(KILL_WAIT).await;
        self.readers.cancel();
        match killed {
            Some(_) => Ok(()),
            None => Err(TransportError::Io(
                "MCP server process did not exit after SIGKILL".into(),
            )),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait_exit(&self, limit: Duration) -> Option<ExitStatusInfo> {
        let mut rx = self.exit.clone();
        let status = match tokio::time::timeout(limit, rx.wait_for(Option::is_some)).await {
            Ok(Ok(status)) => *status,
            _ => None,
        };
        status
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else { return };
        if self.exit.borrow().is_some() {
            return;
        }
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::debug!(server = %self.server, pid, error = %e, "failed to send SIGTERM");
        }
    }

    /// No graceful signal off unix; closing stdin is the only hint.
    #[cfg(not(unix))]
    fn terminate(&self) {}
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.readers.cancel();
        if !self.is_closed() {
            self.closed.store(true, Ordering::SeqCst);
            self.kill.cancel();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Background tasks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Frames read after `closed` is set are drained and dropped.
async fn read_stdout(
    mut stdout: ChildStdout,
    events: Arc<EventSink>,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let mut lines = LineBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            r = stdout.read(&mut chunk) => r,
        };
        match read {
            Ok(0) => {
                if let Some(tail) = lines.finish() {
                    if !closed.load(Ordering::SeqCst) {
                        events.unit(&tail);
                    }
                }
                tracing::debug!(server = %events.server(), "MCP server stdout closed");
                return;
            }
            Ok(n) => {
                let units = lines.push(&chunk[..n]);
                if closed.load(Ordering::SeqCst) {
                    continue;
                }
                for unit in units {
                    events.unit(&unit);
                }
            }
            Err(e) => {
                tracing::debug!(server = %events.server(), error = %e, "error reading MCP server stdout");
                return;
            }
        }
    }
}

/// Diagnostic output is logged, never parsed.
async fn read_stderr(stderr: ChildStderr, server: String, cancel: CancellationToken) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            l = lines.next_line() => l,
        };
        match line {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::debug!(server = %server, line = %line, "MCP server stderr");
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "error reading MCP server stderr");
                return;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    events: Arc<EventSink>,
    closed: Arc<AtomicBool>,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ExitStatusInfo>>,
    options: Arc<ClientOptions>,
) {
    let waited = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(server = %events.server(), error = %e, "failed to kill MCP server process");
            }
            child.wait().await
        }
    };

    let status = match waited {
        Ok(status) => exit_info(&status),
        Err(e) => {
            tracing::warn!(server = %events.server(), error = %e, "error waiting for MCP server process");
            ExitStatusInfo { code: None, signal: None }
        }
    };
    exit_tx.send_replace(Some(status));

    if closed.load(Ordering::SeqCst) {
        tracing::debug!(server = %events.server(), %status, "MCP server process exited after close");
        return;
    }

    if is_benign(&status, &options) {
        tracing::info!(server = %events.server(), %status, "MCP server process exited");
        events.exited(status);
    } else {
        tracing::warn!(server = %events.server(), %status, "MCP server process exited unexpectedly");
        events.fault(TransportError::UnexpectedExit(status));
    }
}

fn exit_info(status: &std::process::ExitStatus) -> ExitStatusInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitStatusInfo {
        code: status.code(),
        signal,
    }
}

fn is_benign(status: &ExitStatusInfo, options: &ClientOptions) -> bool {
    options.is_benign_exit(status.code, status.signal)
}
