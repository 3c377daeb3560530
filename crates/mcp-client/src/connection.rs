//! One live session with one MCP server: transport, handshake, dispatch of
//! inbound frames, and teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::{watch, OnceCell};

use conduit_domain::config::{ClientOptions, ServerDescriptor};

use crate::codec::{CodecError, Frame};
use crate::correlation::{Correlator, ProgressCallback};
use crate::error::McpError;
use crate::protocol::{
    initialize_params, methods, InitializeResult, JsonRpcError, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, LoggingLevel, LoggingMessage, ServerCapabilities,
};
use crate::transport::{EventReceiver, ExitStatusInfo, Transport, TransportError, TransportEvent};

/// Lifecycle of a [`Connection`]. Moves forward only; a failed connection
/// ends in `Closed` with [`Connection::close_reason`] set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Handshaking,
    Ready,
    Disconnecting,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A notification pushed by a server.
#[derive(Debug, Clone)]
pub struct ServerNotification {
    pub server: String,
    pub method: String,
    pub params: Option<Value>,
}

pub type NotificationHook = Arc<dyn Fn(ServerNotification) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&str, &McpError) + Send + Sync>;

/// Optional callbacks. Without them, notifications and unexpected
/// disconnects go to the log.
#[derive(Clone, Default)]
pub struct ConnectionHooks {
    pub on_notification: Option<NotificationHook>,
    pub on_error: Option<ErrorHook>,
}

impl std::fmt::Debug for ConnectionHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHooks")
            .field("on_notification", &self.on_notification.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

pub struct Connection {
    server: String,
    descriptor: ServerDescriptor,
    options: Arc<ClientOptions>,
    transport: RwLock<Option<Arc<Transport>>>,
    correlator: Correlator,
    init: RwLock<Option<InitializeResult>>,
    intentional: AtomicBool,
    state: watch::Sender<ConnectionState>,
    close_reason: Mutex<Option<McpError>>,
    teardown: OnceCell<Result<(), McpError>>,
    hooks: ConnectionHooks,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("server", &self.server)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Open the transport and run the `initialize` handshake.
    ///
    /// A failed handshake is retried `options.init_retries` times with a
    /// fixed delay, reusing the transport unless it died. The returned
    /// connection is `Ready`.
    pub async fn open(
        server: &str,
        descriptor: ServerDescriptor,
        options: Arc<ClientOptions>,
        hooks: ConnectionHooks,
    ) -> Result<Arc<Self>, McpError> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let conn = Arc::new(Self {
            server: server.to_string(),
            descriptor,
            options,
            transport: RwLock::new(None),
            correlator: Correlator::new(server),
            init: RwLock::new(None),
            intentional: AtomicBool::new(false),
            state,
            close_reason: Mutex::new(None),
            teardown: OnceCell::new(),
            hooks,
        });

        if let Err(e) = conn.establish().await {
            let e = e.for_server(server);
            tracing::error!(server = %server, error = %e, "failed to connect to MCP server");
            let _ = conn.teardown_with(Some(e.clone())).await;
            return Err(e);
        }
        Ok(conn)
    }

    async fn establish(self: &Arc<Self>) -> Result<(), McpError> {
        let attempts = self.options.init_retries + 1;
        let timeout = self.options.init_timeout(self.descriptor.request_timeout_ms);
        let params = serde_json::to_value(initialize_params(
            &self.options.protocol_version,
            &self.options.client_name,
            &self.options.client_version,
        ))
        .map_err(|e| McpError::Protocol(e.to_string()))?;

        let mut last_error = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.options.init_retry_delay()).await;
            }

            self.set_state(ConnectionState::Connecting);
            let transport = self.ensure_transport().await?;

            self.set_state(ConnectionState::Handshaking);
            let outcome = self
                .correlator
                .request(transport.as_ref(), methods::INITIALIZE, Some(params.clone()), timeout, None)
                .await
                .and_then(|value| {
                    serde_json::from_value::<InitializeResult>(value)
                        .map_err(|e| McpError::Protocol(format!("invalid initialize result: {e}")))
                });

            match outcome {
                Ok(result) => {
                    self.on_initialized(transport.as_ref(), result).await;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        server = %self.server,
                        attempt,
                        attempts,
                        error = %e,
                        "MCP initialize failed"
                    );
                    self.correlator.reject_all(e.clone());
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| McpError::Protocol("initialize was not attempted".into())))
    }

    async fn on_initialized(&self, transport: &Transport, result: InitializeResult) {
        if let Err(e) = self
            .correlator
            .notify(transport, methods::INITIALIZED, None)
            .await
        {
            tracing::warn!(server = %self.server, error = %e, "failed to send initialized notification");
        }

        for key in &self.descriptor.expect_capabilities {
            if !result.capabilities.supports(key) {
                tracing::warn!(server = %self.server, capability = %key, "MCP server does not advertise expected capability");
            }
        }

        tracing::info!(
            server = %self.server,
            transport = %transport.kind(),
            server_name = %result.server_info.name,
            server_version = %result.server_info.version,
            protocol = %result.protocol_version,
            "MCP server ready"
        );
        *self.init.write() = Some(result);
        self.set_state(ConnectionState::Ready);
    }

    /// Return the live transport, opening a new one if there is none.
    async fn ensure_transport(self: &Arc<Self>) -> Result<Arc<Transport>, McpError> {
        if let Some(t) = self.transport.read().as_ref() {
            if !t.is_closed() {
                return Ok(Arc::clone(t));
            }
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let transport = Arc::new(
            Transport::open(&self.server, &self.descriptor, &self.options, tx)
                .await
                .map_err(|e| McpError::from(e).for_server(&self.server))?,
        );
        *self.transport.write() = Some(Arc::clone(&transport));
        tokio::spawn(dispatch(
            Arc::downgrade(self),
            Arc::downgrade(&transport),
            rx,
        ));
        Ok(transport)
    }

    // ── requests ──────────────────────────────────────────────────────

    /// Send a request with the server's default timeout.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.send_request(method, params, self.request_timeout(), None).await
    }

    /// Send a request and receive its `notifications/progress` updates.
    pub async fn request_with_progress(
        &self,
        method: &str,
        params: Option<Value>,
        on_progress: ProgressCallback,
    ) -> Result<Value, McpError> {
        self.send_request(method, params, self.request_timeout(), Some(on_progress))
            .await
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<Value, McpError> {
        let transport = self.ready_transport()?;
        self.correlator
            .request(transport.as_ref(), method, params, timeout, on_progress)
            .await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let transport = self.ready_transport()?;
        self.correlator.notify(transport.as_ref(), method, params).await
    }

    fn ready_transport(&self) -> Result<Arc<Transport>, McpError> {
        if self.state() != ConnectionState::Ready {
            return Err(McpError::Disconnected(self.server.clone()));
        }
        self.transport
            .read()
            .clone()
            .ok_or_else(|| McpError::Disconnected(self.server.clone()))
    }

    /// Effective request timeout: the server override, else the default.
    pub fn request_timeout(&self) -> Option<Duration> {
        match self.descriptor.request_timeout_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => self.options.request_timeout(),
        }
    }

    // ── state ─────────────────────────────────────────────────────────

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether the close was requested rather than caused by a failure.
    pub fn is_intentional(&self) -> bool {
        self.intentional.load(Ordering::SeqCst)
    }

    /// Why the connection closed, if it failed.
    pub fn close_reason(&self) -> Option<McpError> {
        self.close_reason.lock().clone()
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.init.read().as_ref().map(|r| r.capabilities.clone())
    }

    pub fn initialize_result(&self) -> Option<InitializeResult> {
        self.init.read().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(server = %self.server, from = %prev, to = %next, "MCP connection state");
        }
    }

    // ── teardown ──────────────────────────────────────────────────────

    /// Close intentionally. Concurrent and repeated calls share one
    /// teardown and its outcome.
    pub async fn shutdown(&self) -> Result<(), McpError> {
        self.intentional.store(true, Ordering::SeqCst);
        self.teardown_with(None).await
    }

    async fn teardown_with(&self, reason: Option<McpError>) -> Result<(), McpError> {
        self.teardown
            .get_or_init(|| async move {
                let rejection = match &reason {
                    Some(e) => {
                        *self.close_reason.lock() = Some(e.clone());
                        e.clone()
                    }
                    None => {
                        self.set_state(ConnectionState::Disconnecting);
                        McpError::Disconnected(self.server.clone())
                    }
                };
                self.correlator.reject_all(rejection);

                let transport = self.transport.write().take();
                let closed = match transport {
                    Some(t) => t.close().await.map_err(McpError::from),
                    None => Ok(()),
                };
                if let Err(e) = &closed {
                    tracing::warn!(server = %self.server, error = %e, "error closing MCP transport");
                }
                self.set_state(ConnectionState::Closed);
                closed
            })
            .await
            .clone()
    }

    // ── inbound ───────────────────────────────────────────────────────

    async fn on_frame(&self, transport: &Transport, frame: Frame) {
        match frame {
            Frame::Response(response) => {
                self.correlator.handle_response(response);
            }
            Frame::Notification(notification) => self.on_notification(notification),
            Frame::Request(request) => self.on_server_request(transport, request).await,
        }
    }

    fn on_notification(&self, notification: JsonRpcNotification) {
        let params = notification.params;
        if notification.method == methods::PROGRESS
            && self.correlator.handle_progress(params.as_ref().unwrap_or(&Value::Null))
        {
            return;
        }

        if let Some(hook) = &self.hooks.on_notification {
            hook(ServerNotification {
                server: self.server.clone(),
                method: notification.method,
                params,
            });
            return;
        }

        if notification.method == methods::MESSAGE {
            match params.map(serde_json::from_value::<LoggingMessage>) {
                Some(Ok(message)) => self.log_server_message(&message),
                _ => tracing::debug!(server = %self.server, "malformed log notification"),
            }
        } else {
            tracing::debug!(server = %self.server, method = %notification.method, "unhandled MCP notification");
        }
    }

    fn log_server_message(&self, message: &LoggingMessage) {
        let logger = message.logger.as_deref().unwrap_or("");
        let data = match &message.data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match message.level {
            LoggingLevel::Debug => tracing::debug!(server = %self.server, logger, "{data}"),
            LoggingLevel::Info | LoggingLevel::Notice => {
                tracing::info!(server = %self.server, logger, "{data}")
            }
            LoggingLevel::Warning => tracing::warn!(server = %self.server, logger, "{data}"),
            _ => tracing::error!(server = %self.server, logger, "{data}"),
        }
    }

    /// Answer `ping`; anything else is refused with method-not-found.
    async fn on_server_request(&self, transport: &Transport, request: JsonRpcRequest) {
        let response = if request.method == methods::PING {
            JsonRpcResponse::success(request.id, json!({}))
        } else {
            tracing::debug!(server = %self.server, method = %request.method, "refusing server request");
            JsonRpcResponse::failure(request.id, JsonRpcError::method_not_found(&request.method))
        };
        if let Err(e) = transport.send(&Frame::Response(response)).await {
            tracing::debug!(server = %self.server, error = %e, "failed to answer server request");
        }
    }

    fn on_invalid(&self, error: CodecError) {
        match error {
            CodecError::InvalidResponse { id, reason } => {
                self.correlator.handle_invalid_response(&id, &reason);
            }
            other => {
                tracing::warn!(server = %self.server, error = %other, "skipping malformed MCP frame");
            }
        }
    }

    async fn on_terminal(&self, transport: &Arc<Transport>, fault: Option<TransportError>, status: Option<ExitStatusInfo>) {
        let error = match fault {
            Some(e) => McpError::from(e).for_server(&self.server),
            None => McpError::Disconnected(self.server.clone()),
        };

        if self.is_intentional() || self.teardown.initialized() {
            tracing::info!(server = %self.server, reason = %error, "MCP transport ended during shutdown");
            return;
        }

        match self.state() {
            ConnectionState::Ready => {
                match status {
                    Some(status) => tracing::info!(server = %self.server, %status, "MCP server exited"),
                    None => tracing::warn!(server = %self.server, error = %error, "MCP connection lost"),
                }
                let _ = self.teardown_with(Some(error)).await;
            }
            ConnectionState::Disconnecting | ConnectionState::Closed => {}
            _ => {
                // Mid-handshake: fail the attempt and let the retry loop
                // open a fresh transport.
                self.correlator.reject_all(error);
                let current = {
                    let mut slot = self.transport.write();
                    let is_current = slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, transport));
                    if is_current {
                        slot.take()
                    } else {
                        None
                    }
                };
                if let Some(t) = current {
                    let _ = t.close().await;
                }
            }
        }
    }
}

/// Pump one transport's events into its connection. Ends when the transport
/// is gone or reports a terminal event.
async fn dispatch(conn: Weak<Connection>, transport: Weak<Transport>, mut events: EventReceiver) {
    while let Some(event) = events.recv().await {
        let (Some(conn), Some(transport)) = (conn.upgrade(), transport.upgrade()) else {
            return;
        };
        match event {
            TransportEvent::Frame(frame) => conn.on_frame(&transport, frame).await,
            TransportEvent::Invalid(error) => conn.on_invalid(error),
            TransportEvent::Fault(error) => {
                conn.on_terminal(&transport, Some(error), None).await;
                return;
            }
            TransportEvent::Exited(status) => {
                conn.on_terminal(&transport, None, Some(status)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Handshaking.to_string(), "handshaking");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }

    #[tokio::test]
    async fn spawn_failure_closes_with_reason() {
        let desc = ServerDescriptor::process("/no/such/mcp-server", Vec::<String>::new());
        let err = Connection::open("ghost", desc, Arc::new(ClientOptions::default()), ConnectionHooks::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Spawn);
    }
}
