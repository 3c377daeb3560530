//! MCP transport layer.
//!
//! Each MCP server communicates over a transport. Supported:
//! - **Process**: spawn a child process, send JSON-RPC over stdin/stdout.
//! - **Stream**: Server-Sent-Event push channel plus POSTed requests.
//!
//! The set is closed, so [`Transport`] is an enum rather than a trait
//! object. Inbound traffic and out-of-band failures are delivered through
//! the [`TransportEvent`] channel handed over at construction.

pub mod process;
pub mod stream;

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use conduit_domain::config::{ClientOptions, ServerDescriptor, TransportKind, TransportSpec};

use crate::codec::{CodecError, Frame};
use crate::correlation::FrameSink;

pub use process::ProcessTransport;
pub use stream::StreamTransport;

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("transport I/O error: {0}")]
    Io(String),

    #[error("broken pipe writing to MCP server: {0}")]
    BrokenPipe(String),

    #[error("MCP server process exited unexpectedly ({0})")]
    UnexpectedExit(ExitStatusInfo),

    #[error("push channel connection failed: {0}")]
    Connect(String),

    #[error("timed out after {0:?} connecting to {1}")]
    ConnectTimeout(std::time::Duration, String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),

    #[error("transport is closed")]
    Closed,

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                TransportError::BrokenPipe(e.to_string())
            }
            _ => TransportError::Io(e.to_string()),
        }
    }
}

/// How a server process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatusInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl std::fmt::Display for ExitStatusInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "signal {sig}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// What a transport reports to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded inbound frame, in arrival order.
    Frame(Frame),
    /// A unit that could not be decoded. The read loop keeps going.
    Invalid(CodecError),
    /// Unrecoverable failure. Sent at most once per transport.
    Fault(TransportError),
    /// The process exited with a benign status on its own. Sent at most once,
    /// and never together with a `Fault`.
    Exited(ExitStatusInfo),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Wraps the event channel and guarantees the terminal event fires once.
#[derive(Debug)]
pub(crate) struct EventSink {
    server: String,
    tx: EventSender,
    terminal_sent: AtomicBool,
}

impl EventSink {
    pub(crate) fn new(server: &str, tx: EventSender) -> Self {
        Self {
            server: server.to_string(),
            tx,
            terminal_sent: AtomicBool::new(false),
        }
    }

    pub(crate) fn server(&self) -> &str {
        &self.server
    }

    /// Route one decoded (or undecodable) unit to the owner.
    pub(crate) fn unit(&self, unit: &str) {
        let event = match crate::codec::parse_frame(unit) {
            Ok(frame) => TransportEvent::Frame(frame),
            Err(e) => TransportEvent::Invalid(e),
        };
        let _ = self.tx.send(event);
    }

    /// Route an already-parsed JSON body to the owner.
    pub(crate) fn value(&self, value: serde_json::Value) {
        let event = match crate::codec::frame_from_value(value) {
            Ok(frame) => TransportEvent::Frame(frame),
            Err(e) => TransportEvent::Invalid(e),
        };
        let _ = self.tx.send(event);
    }

    /// Report a terminal failure; later calls are ignored.
    pub(crate) fn fault(&self, error: TransportError) {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            tracing::debug!(server = %self.server, error = %error, "suppressing repeated transport fault");
            return;
        }
        let _ = self.tx.send(TransportEvent::Fault(error));
    }

    pub(crate) fn exited(&self, status: ExitStatusInfo) {
        if self.terminal_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(TransportEvent::Exited(status));
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A live channel to one MCP server.
pub enum Transport {
    Process(ProcessTransport),
    Stream(StreamTransport),
}

impl Transport {
    /// Establish the channel described by `descriptor`.
    pub async fn open(
        server: &str,
        descriptor: &ServerDescriptor,
        options: &ClientOptions,
        events: EventSender,
    ) -> Result<Self, TransportError> {
        let sink = EventSink::new(server, events);
        match &descriptor.transport {
            TransportSpec::Process { .. } => {
                ProcessTransport::spawn(descriptor, options, sink).map(Transport::Process)
            }
            TransportSpec::Stream { .. } => StreamTransport::connect(descriptor, options, sink)
                .await
                .map(Transport::Stream),
        }
    }

    /// Write one frame. Fails with [`TransportError::Closed`] after `close`.
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        match self {
            Transport::Process(t) => t.send(frame).await,
            Transport::Stream(t) => t.send(frame).await,
        }
    }

    /// Tear the channel down. Idempotent.
    pub async fn close(&self) -> Result<(), TransportError> {
        match self {
            Transport::Process(t) => t.close().await,
            Transport::Stream(t) => t.close().await,
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Transport::Process(t) => t.is_closed(),
            Transport::Stream(t) => t.is_closed(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Process(_) => TransportKind::Process,
            Transport::Stream(_) => TransportKind::Stream,
        }
    }
}

#[async_trait]
impl FrameSink for Transport {
    async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        self.send(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_broken_pipe() {
        let e: TransportError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed").into();
        assert!(matches!(e, TransportError::BrokenPipe(_)));
        let e: TransportError = std::io::Error::new(std::io::ErrorKind::Other, "weird").into();
        assert!(matches!(e, TransportError::Io(_)));
    }

    #[test]
    fn terminal_event_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("x", tx);
        sink.fault(TransportError::BrokenPipe("a".into()));
        sink.fault(TransportError::BrokenPipe("b".into()));
        sink.exited(ExitStatusInfo { code: Some(0), signal: None });

        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Fault(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn units_are_classified() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new("x", tx);
        sink.unit(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#);
        sink.unit("not json");
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Frame(Frame::Request(_)))));
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Invalid(_))));
    }

    #[test]
    fn exit_status_display() {
        let s = ExitStatusInfo { code: None, signal: Some(9) };
        assert_eq!(s.to_string(), "signal 9");
        let s = ExitStatusInfo { code: Some(1), signal: None };
        assert_eq!(s.to_string(), "exit code 1");
    }
}
