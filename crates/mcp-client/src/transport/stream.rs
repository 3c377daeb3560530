//! Stream transport: a Server-Sent-Event push channel for inbound frames,
//! with outbound frames POSTed as JSON.
//!
//! The server may announce where to POST with an `endpoint` event; a
//! configured `message_url` skips that wait. A dropped push channel or a
//! failed POST triggers one reconnect before the failure is surfaced.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use conduit_domain::config::{ClientOptions, ServerDescriptor, TransportSpec};

use super::{EventSink, TransportError};
use crate::codec::{drain_sse_events, encode_frame, Frame, SseEvent};

/// Pause before re-opening a dropped push channel.
const RECONNECT_PAUSE: Duration = Duration::from_millis(200);

const ENDPOINT_EVENT: &str = "endpoint";
const MESSAGE_EVENT: &str = "message";

#[derive(Debug, Clone, Default)]
struct PushState {
    connected: bool,
    endpoint: Option<Url>,
}

struct Shared {
    http: reqwest::Client,
    push_url: Url,
    message_url: Option<Url>,
    headers: HeaderMap,
    connect_timeout: Duration,
    state: watch::Sender<PushState>,
    closed: AtomicBool,
    cancel: CancellationToken,
    /// Token of the current push session; cancelling it forces a reconnect.
    session: Mutex<CancellationToken>,
    events: EventSink,
}

/// HTTP client side of an SSE-based MCP server.
pub struct StreamTransport {
    shared: Arc<Shared>,
}

impl StreamTransport {
    /// Open the push channel and wait until outbound frames have a target.
    pub(crate) async fn connect(
        descriptor: &ServerDescriptor,
        options: &ClientOptions,
        events: EventSink,
    ) -> Result<Self, TransportError> {
        let TransportSpec::Stream { url, message_url, headers } = &descriptor.transport else {
            return Err(TransportError::InvalidConfig(
                "stream transport requires a stream descriptor".into(),
            ));
        };

        let push_url = Url::parse(url)
            .map_err(|e| TransportError::InvalidConfig(format!("invalid url `{url}`: {e}")))?;
        let message_url = message_url
            .as_deref()
            .map(|target| push_url.join(target))
            .transpose()
            .map_err(|e| TransportError::InvalidConfig(format!("invalid message url: {e}")))?;
        let headers = header_map(headers)?;
        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout())
            .build()
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;

        let cancel = CancellationToken::new();
        let (state, _) = watch::channel(PushState {
            connected: false,
            endpoint: message_url.clone(),
        });
        let shared = Arc::new(Shared {
            http,
            push_url,
            message_url,
            headers,
            connect_timeout: options.connect_timeout(),
            state,
            closed: AtomicBool::new(false),
            session: Mutex::new(cancel.child_token()),
            cancel,
            events,
        });

        let response = shared.open_push().await?;
        tracing::debug!(server = %shared.events.server(), url = %shared.push_url, "push channel open");
        tokio::spawn(push_loop(Arc::clone(&shared), response));

        if let Err(e) = shared.wait_ready().await {
            shared.shutdown();
            return Err(e);
        }
        Ok(Self { shared })
    }

    /// POST one frame. On failure the push channel is re-opened once and the
    /// POST retried.
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let body = encode_frame(frame)?;

        match self.shared.post(&body).await {
            Ok(()) => Ok(()),
            Err(TransportError::Closed) => Err(TransportError::Closed),
            Err(first) => {
                tracing::warn!(
                    server = %self.shared.events.server(),
                    error = %first,
                    "MCP stream send failed, reconnecting once"
                );
                self.shared.request_reconnect();
                self.shared.post(&body).await
            }
        }
    }

    /// Stop the push channel and abort in-flight POSTs. Idempotent.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.shared.shutdown();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.state.send_modify(|s| s.connected = false);
        tracing::debug!(server = %self.events.server(), "stream transport closed");
    }

    fn new_session(&self) -> CancellationToken {
        let token = self.cancel.child_token();
        *self.session.lock() = token.clone();
        token
    }

    fn request_reconnect(&self) {
        self.state.send_modify(|s| s.connected = false);
        self.session.lock().cancel();
    }

    /// GET the push URL, bounded by the connect timeout.
    async fn open_push(&self) -> Result<reqwest::Response, TransportError> {
        let request = self
            .http
            .get(self.push_url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "text/event-stream");

        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Closed),
            r = tokio::time::timeout(self.connect_timeout, request.send()) => r,
        };
        let response = match sent {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Err(_) => {
                return Err(TransportError::ConnectTimeout(
                    self.connect_timeout,
                    self.push_url.to_string(),
                ))
            }
        };

        if !response.status().is_success() {
            return Err(TransportError::Http {
                status: response.status().as_u16(),
                url: self.push_url.to_string(),
            });
        }
        Ok(response)
    }

    /// Wait until the push channel is up and a POST target is known.
    ///
    /// If the channel is up but no `endpoint` event arrived within the
    /// connect timeout, POSTs fall back to the push URL.
    async fn wait_ready(&self) -> Result<Url, TransportError> {
        let mut rx = self.state.subscribe();
        let waited = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Closed),
            r = tokio::time::timeout(
                self.connect_timeout,
                rx.wait_for(|s| s.connected && s.endpoint.is_some()),
            ) => r.map(|ready| ready.ok().and_then(|s| s.endpoint.clone())),
        };

        match waited {
            Ok(Some(url)) => Ok(url),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => {
                let connected = self.state.borrow().connected;
                if !connected {
                    return Err(TransportError::ConnectTimeout(
                        self.connect_timeout,
                        self.push_url.to_string(),
                    ));
                }
                tracing::warn!(
                    server = %self.events.server(),
                    url = %self.push_url,
                    "no endpoint event from MCP server, posting to the push URL"
                );
                let fallback = self.push_url.clone();
                self.state.send_modify(|s| s.endpoint = Some(fallback.clone()));
                Ok(fallback)
            }
        }
    }

    async fn post(&self, body: &str) -> Result<(), TransportError> {
        let target = self.wait_ready().await?;
        let request = self
            .http
            .post(target.clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string());

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Closed),
            r = request.send() => r.map_err(|e| TransportError::Request(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                url: target.to_string(),
            });
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        if !is_json {
            return Ok(());
        }

        let text = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Closed),
            t = response.text() => t.map_err(|e| TransportError::Request(e.to_string()))?,
        };
        self.dispatch_body(&text);
        Ok(())
    }

    /// Some servers answer a POST inline instead of on the push channel.
    fn dispatch_body(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Array(batch)) => batch.into_iter().for_each(|v| self.events.value(v)),
            Ok(value) => self.events.value(value),
            Err(_) => self.events.unit(text),
        }
    }

    fn handle_event(&self, event: SseEvent) {
        match event.event.as_str() {
            ENDPOINT_EVENT => {
                if self.message_url.is_some() {
                    return;
                }
                match self.push_url.join(event.data.trim()) {
                    Ok(url) => {
                        tracing::debug!(server = %self.events.server(), %url, "MCP message endpoint announced");
                        self.state.send_modify(|s| s.endpoint = Some(url));
                    }
                    Err(e) => {
                        tracing::warn!(server = %self.events.server(), error = %e, "invalid endpoint event");
                    }
                }
            }
            MESSAGE_EVENT => self.events.unit(&event.data),
            other => {
                tracing::debug!(server = %self.events.server(), event = other, "ignoring SSE event");
            }
        }
    }

    /// Read one push session until it ends. Returns why it ended.
    async fn pump(&self, mut response: reqwest::Response, session: &CancellationToken) -> String {
        self.state.send_modify(|s| s.connected = true);

        let mut raw: Vec<u8> = Vec::new();
        let mut text = String::new();
        loop {
            let chunk = tokio::select! {
                _ = session.cancelled() => return "session cancelled".into(),
                c = response.chunk() => c,
            };
            match chunk {
                Ok(Some(bytes)) => {
                    raw.extend_from_slice(&bytes);
                    decode_utf8(&mut raw, &mut text);
                    for event in drain_sse_events(&mut text) {
                        self.handle_event(event);
                    }
                }
                Ok(None) => return "push channel closed by server".into(),
                Err(e) => return e.to_string(),
            }
        }
    }
}

/// Owns the push channel for the transport's lifetime and re-opens it once
/// per drop.
async fn push_loop(shared: Arc<Shared>, first: reqwest::Response) {
    let mut response = first;
    loop {
        let session = shared.new_session();
        let reason = shared.pump(response, &session).await;
        shared.state.send_modify(|s| s.connected = false);
        if shared.is_closed() {
            return;
        }

        tracing::warn!(server = %shared.events.server(), reason = %reason, "MCP push channel dropped, reconnecting");
        if shared.message_url.is_none() {
            shared.state.send_modify(|s| s.endpoint = None);
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_PAUSE) => {}
        }

        match shared.open_push().await {
            Ok(next) => {
                tracing::info!(server = %shared.events.server(), "MCP push channel reconnected");
                response = next;
            }
            Err(TransportError::Closed) => return,
            Err(e) => {
                if !shared.is_closed() {
                    tracing::error!(server = %shared.events.server(), error = %e, "MCP push channel reconnect failed");
                    shared.events.fault(e);
                }
                return;
            }
        }
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::InvalidConfig(format!("invalid header name `{name}`: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidConfig(format!("invalid value for header `{name}`: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Move the valid UTF-8 prefix of `raw` into `text`, keeping an incomplete
/// trailing sequence for the next chunk.
fn decode_utf8(raw: &mut Vec<u8>, text: &mut String) {
    loop {
        match std::str::from_utf8(raw) {
            Ok(s) => {
                text.push_str(s);
                raw.clear();
                return;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&raw[..valid]));
                match e.error_len() {
                    None => {
                        raw.drain(..valid);
                        return;
                    }
                    Some(bad) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        raw.drain(..valid + bad);
                    }
                }
            }
        }
    }
}
