//! Integration test: boots an in-process SSE MCP server with axum and drives
//! it through the manager.
//!
//! Covers:
//! - `endpoint` event discovery and POST delivery with push-channel replies
//! - a fixed `message_url` answered inline in the POST body
//! - reconnect after the push channel drops
//! - opaque headers on every HTTP call

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use conduit_mcp_client::{ClientConfig, ClientOptions, ErrorKind, McpManager, ServerDescriptor};
use futures_util::stream::Stream;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

// ── Mini server ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct MockState {
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    sse_opens: Arc<AtomicUsize>,
    posts: Arc<AtomicUsize>,
    drop_first_stream: Arc<AtomicBool>,
    last_auth: Arc<parking_lot::Mutex<Option<String>>>,
}

impl MockState {
    fn new(drop_first_stream: bool) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            outbound_tx,
            outbound_rx: Arc::new(Mutex::new(outbound_rx)),
            sse_opens: Arc::new(AtomicUsize::new(0)),
            posts: Arc::new(AtomicUsize::new(0)),
            drop_first_stream: Arc::new(AtomicBool::new(drop_first_stream)),
            last_auth: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    fn record(&self, headers: &HeaderMap) {
        self.posts.fetch_add(1, Ordering::SeqCst);
        if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            *self.last_auth.lock() = Some(auth.to_string());
        }
    }
}

async fn sse(State(state): State<MockState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    state.sse_opens.fetch_add(1, Ordering::SeqCst);
    let drop_now = state.drop_first_stream.swap(false, Ordering::SeqCst);
    let outbound = Arc::clone(&state.outbound_rx);

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("endpoint").data("/message?session=abc"));
        if drop_now {
            return;
        }
        let mut rx = outbound.lock().await;
        while let Some(message) = rx.recv().await {
            yield Ok(Event::default().event("message").data(message));
        }
    };
    Sse::new(stream)
}

async fn message(State(state): State<MockState>, headers: HeaderMap, Json(frame): Json<Value>) -> StatusCode {
    state.record(&headers);
    if let Some(reply) = respond(&frame) {
        let _ = state.outbound_tx.send(reply.to_string());
    }
    StatusCode::ACCEPTED
}

async fn inline(State(state): State<MockState>, headers: HeaderMap, Json(frame): Json<Value>) -> Response {
    state.record(&headers);
    match respond(&frame) {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

fn respond(frame: &Value) -> Option<Value> {
    let id = frame.get("id")?.clone();
    let method = frame.get("method")?.as_str()?;
    let params = frame.get("params").cloned().unwrap_or(Value::Null);
    let result = match method {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "sse-mock", "version": "1.0.0" }
        }),
        "ping" => json!({}),
        "tools/list" => json!({ "tools": [{ "name": "echo", "inputSchema": { "type": "object" } }] }),
        "tools/call" if params["name"] == "echo" => json!({
            "content": [{ "type": "text", "text": params["arguments"]["text"] }]
        }),
        _ => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "not found" }
            }))
        }
    };
    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

async fn start_server(state: MockState) -> SocketAddr {
    let app = Router::new()
        .route("/sse", get(sse))
        .route("/message", post(message))
        .route("/inline", post(inline))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn manager_for(descriptor: ServerDescriptor) -> McpManager {
    let options = ClientOptions {
        connect_timeout_ms: 2_000,
        request_timeout_ms: 5_000,
        ..ClientOptions::default()
    };
    McpManager::new(
        ClientConfig::default()
            .with_server("remote", descriptor)
            .with_options(options),
    )
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn endpoint_discovery_and_push_replies() {
    let state = MockState::new(false);
    let addr = start_server(state.clone()).await;
    let manager = manager_for(ServerDescriptor::stream(format!("http://{addr}/sse")));

    let client = manager
        .use_server("remote")
        .await
        .unwrap()
        .get_client("remote")
        .unwrap();
    assert_eq!(client.server_info().unwrap().name, "sse-mock");

    let tools = client.list_all_tools().await.unwrap();
    assert_eq!(tools.len(), 1);

    let result = client
        .call_tool("echo", json!({ "text": "over sse" }))
        .await
        .unwrap();
    assert_eq!(result.text(), "over sse");

    let err = client.call_tool("missing", json!({})).await.unwrap_err();
    assert_eq!(err.code(), Some(-32601));

    manager.disconnect_all().await.unwrap();
    assert!(manager.get_client("remote").is_none());
}

#[tokio::test]
async fn fixed_message_url_with_inline_replies() {
    let state = MockState::new(false);
    let addr = start_server(state.clone()).await;
    let descriptor = ServerDescriptor::stream(format!("http://{addr}/sse"))
        .with_message_url("/inline")
        .with_header("Authorization", "Bearer secret");
    let manager = manager_for(descriptor);

    manager.use_server("remote").await.unwrap();
    let client = manager.get_client("remote").unwrap();
    client.ping().await.unwrap();

    assert_eq!(state.last_auth.lock().as_deref(), Some("Bearer secret"));
    assert!(state.posts.load(Ordering::SeqCst) >= 3);
    manager.disconnect("remote").await.unwrap();
}

#[tokio::test]
async fn push_channel_drop_reconnects() {
    let state = MockState::new(true);
    let addr = start_server(state.clone()).await;
    let manager = manager_for(ServerDescriptor::stream(format!("http://{addr}/sse")));

    let client = manager
        .use_server("remote")
        .await
        .unwrap()
        .get_client("remote")
        .unwrap();
    let result = client
        .call_tool("echo", json!({ "text": "after reconnect" }))
        .await
        .unwrap();
    assert_eq!(result.text(), "after reconnect");
    assert!(state.sse_opens.load(Ordering::SeqCst) >= 2);

    manager.disconnect_all().await.unwrap();
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let options = ClientOptions {
        connect_timeout_ms: 500,
        init_retries: 0,
        ..ClientOptions::default()
    };
    let manager = McpManager::new(
        ClientConfig::default()
            .with_server("remote", ServerDescriptor::stream(format!("http://{addr}/sse")))
            .with_options(options),
    );

    let err = tokio::time::timeout(Duration::from_secs(10), manager.use_server("remote"))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(manager.active_servers().is_empty());
}
