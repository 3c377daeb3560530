//! Scriptable MCP server over stdio, used by the integration tests.
//!
//! Reads newline-delimited JSON-RPC from stdin and answers on stdout.
//! Diagnostics go to stderr.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "conduit-mock-server", about = "Mock MCP server for tests")]
struct Args {
    /// Answer the first N `initialize` requests with an error.
    #[arg(long, default_value_t = 0)]
    fail_initialize: u64,

    /// Print a non-JSON line on stdout before serving.
    #[arg(long)]
    noisy: bool,

    /// Keep running after SIGTERM.
    #[arg(long)]
    ignore_sigterm: bool,

    /// Exit with this code once stdin closes.
    #[arg(long)]
    exit_code_on_close: Option<i32>,
}

#[derive(Default)]
struct Stats {
    initialize: AtomicU64,
    initialized: AtomicU64,
    log_level: parking_lot::Mutex<Option<String>>,
    client_responses: parking_lot::Mutex<Vec<Value>>,
}

struct Server {
    args: Args,
    stats: Stats,
    out: Mutex<tokio::io::Stdout>,
}

impl Server {
    async fn write(&self, frame: Value) {
        let mut line = frame.to_string();
        line.push('\n');
        let mut out = self.out.lock().await;
        if out.write_all(line.as_bytes()).await.is_err() || out.flush().await.is_err() {
            tracing::warn!("stdout closed");
        }
    }

    async fn reply(&self, id: Value, result: Value) {
        self.write(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
            .await;
    }

    async fn fail(&self, id: Value, code: i64, message: &str) {
        self.write(json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } }))
            .await;
    }

    async fn notify(&self, method: &str, params: Value) {
        self.write(json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await;
    }

    async fn handle(self: Arc<Self>, frame: Value) {
        let method = frame.get("method").and_then(Value::as_str).map(str::to_string);
        let id = frame.get("id").cloned();
        let params = frame.get("params").cloned().unwrap_or(Value::Null);

        let (Some(method), Some(id)) = (method.clone(), id.clone()) else {
            match (method, id) {
                (Some(method), None) => {
                    if method == "notifications/initialized" {
                        self.stats.initialized.fetch_add(1, Ordering::SeqCst);
                    }
                    tracing::debug!(%method, "notification");
                }
                (None, Some(_)) => self.stats.client_responses.lock().push(frame),
                _ => tracing::warn!("unclassifiable frame"),
            }
            return;
        };

        match method.as_str() {
            "initialize" => {
                let n = self.stats.initialize.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= self.args.fail_initialize {
                    self.fail(id, -32603, &format!("initialize attempt {n} rejected")).await;
                    return;
                }
                self.reply(
                    id,
                    json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {
                            "tools": {}, "resources": {}, "prompts": {},
                            "logging": {}, "completions": {}
                        },
                        "serverInfo": { "name": "conduit-mock-server", "version": "0.1.0" },
                        "instructions": "test server"
                    }),
                )
                .await;
            }
            "ping" => self.reply(id, json!({})).await,
            "tools/list" => {
                let page = match params.get("cursor").and_then(Value::as_str) {
                    Some("2") => json!({
                        "tools": [tool("stats"), tool("ping_client")]
                    }),
                    _ => json!({
                        "tools": [tool("echo"), tool("slow"), tool("never"), tool("crash"), tool("log")],
                        "nextCursor": "2"
                    }),
                };
                self.reply(id, page).await;
            }
            "tools/call" => self.call_tool(id, params).await,
            "resources/list" => {
                self.reply(id, json!({ "resources": [{ "uri": "mem://greeting", "name": "greeting" }] }))
                    .await
            }
            "resources/templates/list" => {
                self.reply(
                    id,
                    json!({ "resourceTemplates": [{ "uriTemplate": "mem://{key}", "name": "memory" }] }),
                )
                .await
            }
            "resources/read" => {
                let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
                if uri == "mem://greeting" {
                    self.reply(id, json!({ "contents": [{ "uri": uri, "mimeType": "text/plain", "text": "hello" }] }))
                        .await
                } else {
                    self.fail(id, -32002, "resource not found").await
                }
            }
            "prompts/list" => {
                self.reply(
                    id,
                    json!({ "prompts": [{
                        "name": "greet",
                        "arguments": [{ "name": "who", "required": true }]
                    }] }),
                )
                .await
            }
            "prompts/get" => {
                let who = params["arguments"]["who"].as_str().unwrap_or("world");
                self.reply(
                    id,
                    json!({ "messages": [{
                        "role": "user",
                        "content": { "type": "text", "text": format!("Hello, {who}!") }
                    }] }),
                )
                .await
            }
            "completion/complete" => {
                let prefix = params["argument"]["value"].as_str().unwrap_or_default();
                let values: Vec<&str> = ["alice", "albert", "bob"]
                    .into_iter()
                    .filter(|v| v.starts_with(prefix))
                    .collect();
                self.reply(id, json!({ "completion": { "values": values, "total": values.len(), "hasMore": false } }))
                    .await
            }
            "logging/setLevel" => {
                *self.stats.log_level.lock() = params["level"].as_str().map(str::to_string);
                self.reply(id, json!({})).await
            }
            other => self.fail(id, -32601, &format!("method not found: {other}")).await,
        }
    }

    async fn call_tool(&self, id: Value, params: Value) {
        let name = params["name"].as_str().unwrap_or_default();
        let args = &params["arguments"];
        match name {
            "echo" => {
                let text = args["text"].as_str().unwrap_or_default();
                self.reply(id, text_result(text)).await;
            }
            "slow" => {
                let steps = args["steps"].as_u64().unwrap_or(3);
                let delay = Duration::from_millis(args["delay_ms"].as_u64().unwrap_or(20));
                let token = params["_meta"]["progressToken"].clone();
                for step in 1..=steps {
                    tokio::time::sleep(delay).await;
                    if !token.is_null() {
                        self.notify(
                            "notifications/progress",
                            json!({ "progressToken": token, "progress": step, "total": steps }),
                        )
                        .await;
                    }
                }
                self.reply(id, text_result("done")).await;
            }
            "never" => {}
            "crash" => {
                let code = args["code"].as_i64().unwrap_or(1) as i32;
                tracing::info!(code, "crashing on request");
                std::process::exit(code);
            }
            "log" => {
                let level = args["level"].as_str().unwrap_or("info");
                self.notify(
                    "notifications/message",
                    json!({ "level": level, "logger": "mock", "data": args["message"] }),
                )
                .await;
                self.reply(id, text_result("logged")).await;
            }
            "stats" => {
                let stats = json!({
                    "initializeCount": self.stats.initialize.load(Ordering::SeqCst),
                    "initializedCount": self.stats.initialized.load(Ordering::SeqCst),
                    "logLevel": *self.stats.log_level.lock(),
                    "clientResponses": *self.stats.client_responses.lock(),
                });
                self.reply(id, json!({ "content": [], "structuredContent": stats })).await;
            }
            "ping_client" => {
                self.write(json!({ "jsonrpc": "2.0", "id": "srv-1", "method": "ping" })).await;
                self.write(json!({ "jsonrpc": "2.0", "id": "srv-2", "method": "sampling/createMessage", "params": {} }))
                    .await;
                self.reply(id, text_result("sent")).await;
            }
            other => self.fail(id, -32601, &format!("tool {other} not found")).await,
        }
    }
}

fn tool(name: &str) -> Value {
    json!({ "name": name, "description": format!("mock {name}"), "inputSchema": { "type": "object" } })
}

fn text_result(text: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": text }], "isError": false })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    tracing::info!(?args, "mock MCP server starting");

    #[cfg(unix)]
    if args.ignore_sigterm {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::spawn(async move {
            while sigterm.recv().await.is_some() {
                tracing::info!("ignoring SIGTERM");
            }
        });
    }

    let server = Arc::new(Server {
        args,
        stats: Stats::default(),
        out: Mutex::new(tokio::io::stdout()),
    });

    if server.args.noisy {
        let mut out = server.out.lock().await;
        out.write_all(b"mock server booting, this line is not JSON\n").await?;
        out.flush().await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(frame) => {
                tokio::spawn(Arc::clone(&server).handle(frame));
            }
            Err(e) => tracing::warn!(error = %e, "unparseable input line"),
        }
    }

    if let Some(code) = server.args.exit_code_on_close {
        tracing::info!(code, "stdin closed, exiting with configured code");
        std::process::exit(code);
    }
    if server.args.ignore_sigterm {
        tracing::info!("stdin closed, lingering until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("stdin closed, exiting");
    Ok(())
}
