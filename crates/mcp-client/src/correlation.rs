//! Request/response correlation.
//!
//! Every outbound request gets a process-wide unique numeric id and an entry
//! in the pending table. The entry is removed exactly once: by its response,
//! by its deadline, by a transport failure, or when the caller stops waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::codec::Frame;
use crate::error::McpError;
use crate::protocol::{methods, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Progress, RequestId};
use crate::transport::TransportError;

/// Where outbound frames go.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: &Frame) -> Result<(), TransportError>;
}

static NEXT_ID: AtomicI64 = AtomicI64::new(1);

/// Allocate the next request id. Ids are never reused within a process.
pub fn next_request_id() -> RequestId {
    RequestId::Number(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/// Invoked for each `notifications/progress` tied to a request.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

type Outcome = Result<Value, McpError>;

struct PendingRequest {
    method: String,
    tx: oneshot::Sender<Outcome>,
    on_progress: Option<ProgressCallback>,
}

/// Pending-request table for one connection.
pub struct Correlator {
    server: String,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

/// Removes the entry when the waiting future goes away, however it ends.
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<RequestId, PendingRequest>>,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

impl Correlator {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send a request and wait for its outcome.
    ///
    /// The deadline is fixed before the frame is written, so time spent
    /// sending counts against it. `None` waits indefinitely.
    pub async fn request(
        &self,
        sink: &dyn FrameSink,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<Value, McpError> {
        let id = next_request_id();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let params = match on_progress {
            Some(_) => Some(with_progress_token(params, &id)),
            None => params,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                tx,
                on_progress,
            },
        );
        let guard = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        let frame = Frame::Request(JsonRpcRequest::new(id.clone(), method, params));
        let exchange = async {
            sink.send_frame(&frame).await?;
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(McpError::Disconnected(self.server.clone())),
            }
        };

        let (Some(deadline), Some(timeout)) = (deadline, timeout) else {
            return exchange.await;
        };

        match tokio::time::timeout_at(deadline, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                drop(guard);
                tracing::warn!(
                    server = %self.server,
                    method = %method,
                    id = %id,
                    timeout_ms = timeout.as_millis() as u64,
                    "MCP request timed out"
                );
                let cancel = JsonRpcNotification::new(
                    methods::CANCELLED,
                    Some(json!({ "requestId": id, "reason": "request timed out" })),
                );
                if let Err(e) = sink.send_frame(&Frame::Notification(cancel)).await {
                    tracing::debug!(server = %self.server, error = %e, "failed to send cancellation");
                }
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Send a notification. Nothing is recorded.
    pub async fn notify(
        &self,
        sink: &dyn FrameSink,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), McpError> {
        let frame = Frame::Notification(JsonRpcNotification::new(method, params));
        sink.send_frame(&frame).await.map_err(McpError::from)
    }

    /// Settle the request a response belongs to. Unknown ids are logged and
    /// discarded.
    pub fn handle_response(&self, response: JsonRpcResponse) -> bool {
        let Some(entry) = self.pending.lock().remove(&response.id) else {
            tracing::warn!(server = %self.server, id = %response.id, "response for unknown request id");
            return false;
        };
        tracing::trace!(server = %self.server, id = %response.id, method = %entry.method, "MCP response");
        let _ = entry.tx.send(response.into_result().map_err(McpError::from));
        true
    }

    /// Reject the request behind a response that failed to decode.
    pub fn handle_invalid_response(&self, id: &RequestId, reason: &str) -> bool {
        let Some(entry) = self.pending.lock().remove(id) else {
            tracing::warn!(server = %self.server, id = %id, reason, "invalid response for unknown request id");
            return false;
        };
        let _ = entry.tx.send(Err(McpError::Protocol(format!(
            "invalid response to `{}`: {reason}",
            entry.method
        ))));
        true
    }

    /// Forward a progress notification to its request's callback. Returns
    /// whether a callback received it.
    pub fn handle_progress(&self, params: &Value) -> bool {
        let progress: Progress = match serde_json::from_value(params.clone()) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(server = %self.server, error = %e, "malformed progress notification");
                return false;
            }
        };
        let callback = self
            .pending
            .lock()
            .get(&progress.progress_token)
            .and_then(|entry| entry.on_progress.clone());
        match callback {
            Some(callback) => {
                callback(progress);
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `error`. Returns how many there were.
    pub fn reject_all(&self, error: McpError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::debug!(server = %self.server, count, error = %error, "rejected pending MCP requests");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

fn with_progress_token(params: Option<Value>, id: &RequestId) -> Value {
    let mut params = match params {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => serde_json::Map::new(),
        Some(other) => return other,
    };
    let meta = params
        .entry("_meta")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    if let Value::Object(meta) = meta {
        meta.insert("progressToken".into(), json!(id));
    }
    Value::Object(params)
}
