use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How to reach one MCP server.
///
/// The manager clones every descriptor at construction, so edits made to the
/// caller's copy afterwards are never observed by live connections.
///
/// ```toml
/// [servers.filesystem]
/// transport = "process"
/// command = "npx"
/// args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
///
/// [servers.remote]
/// transport = "stream"
/// url = "http://localhost:8080/sse"
/// headers = { Authorization = "Bearer abc" }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerDescriptor {
    #[serde(flatten)]
    pub transport: TransportSpec,

    /// Per-server override of `options.request_timeout_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,

    /// Capability keys (`"tools"`, `"resources"`, ...) the server is expected
    /// to advertise. Missing ones are logged after the handshake.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect_capabilities: Vec<String>,
}

/// Transport-specific connection parameters, tagged by `transport`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportSpec {
    /// Spawn a subprocess and speak newline-delimited JSON over its stdio.
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables layered over the inherited environment.
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory for the child process.
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// Server-Sent-Event push channel plus POSTed requests.
    Stream {
        /// Push-channel URL (opened with `GET`, `Accept: text/event-stream`).
        url: String,
        /// Fixed POST target. When absent the server must announce one via
        /// an `endpoint` event.
        #[serde(default)]
        message_url: Option<String>,
        /// Opaque headers attached to every HTTP call.
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

/// Discriminant of [`TransportSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Process,
    Stream,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Process => f.write_str("process"),
            TransportKind::Stream => f.write_str("stream"),
        }
    }
}

impl ServerDescriptor {
    /// A process server running `command` with `args`.
    pub fn process<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            transport: TransportSpec::Process {
                command: command.into(),
                args: args.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
                cwd: None,
            },
            request_timeout_ms: None,
            expect_capabilities: Vec::new(),
        }
    }

    /// A stream server whose push channel lives at `url`.
    pub fn stream(url: impl Into<String>) -> Self {
        Self {
            transport: TransportSpec::Stream {
                url: url.into(),
                message_url: None,
                headers: BTreeMap::new(),
            },
            request_timeout_ms: None,
            expect_capabilities: Vec::new(),
        }
    }

    /// Add an environment variable (process servers only; ignored otherwise).
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportSpec::Process { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    /// Set the working directory (process servers only).
    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        if let TransportSpec::Process { cwd, .. } = &mut self.transport {
            *cwd = Some(dir.into());
        }
        self
    }

    /// Add an HTTP header (stream servers only).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportSpec::Stream { headers, .. } = &mut self.transport {
            headers.insert(name.into(), value.into());
        }
        self
    }

    /// Pin the POST target instead of waiting for an `endpoint` event.
    pub fn with_message_url(mut self, target: impl Into<String>) -> Self {
        if let TransportSpec::Stream { message_url, .. } = &mut self.transport {
            *message_url = Some(target.into());
        }
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn expecting(mut self, capability: impl Into<String>) -> Self {
        self.expect_capabilities.push(capability.into());
        self
    }

    pub fn kind(&self) -> TransportKind {
        match self.transport {
            TransportSpec::Process { .. } => TransportKind::Process,
            TransportSpec::Stream { .. } => TransportKind::Stream,
        }
    }

    /// Human-readable target for log lines: the command or the URL.
    pub fn target(&self) -> &str {
        match &self.transport {
            TransportSpec::Process { command, .. } => command,
            TransportSpec::Stream { url, .. } => url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_process_descriptor() {
        let raw = r#"{
            "transport": "process",
            "command": "npx",
            "args": ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"],
            "env": { "NODE_ENV": "production" },
            "cwd": "/srv"
        }"#;
        let desc: ServerDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(desc.kind(), TransportKind::Process);
        match &desc.transport {
            TransportSpec::Process { command, args, env, cwd } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 3);
                assert_eq!(env.get("NODE_ENV").unwrap(), "production");
                assert_eq!(cwd.as_deref(), Some(std::path::Path::new("/srv")));
            }
            other => panic!("expected process transport, got {other:?}"),
        }
    }

    #[test]
    fn deserialize_stream_descriptor_with_headers() {
        let raw = r#"{
            "transport": "stream",
            "url": "http://localhost:8080/sse",
            "headers": { "Authorization": "Bearer abc" },
            "request_timeout_ms": 5000
        }"#;
        let desc: ServerDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(desc.kind(), TransportKind::Stream);
        assert_eq!(desc.target(), "http://localhost:8080/sse");
        assert_eq!(desc.request_timeout_ms, Some(5000));
        match &desc.transport {
            TransportSpec::Stream { headers, message_url, .. } => {
                assert_eq!(headers.get("Authorization").unwrap(), "Bearer abc");
                assert!(message_url.is_none());
            }
            other => panic!("expected stream transport, got {other:?}"),
        }
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let raw = r#"{ "transport": "carrier-pigeon", "command": "coo" }"#;
        assert!(serde_json::from_str::<ServerDescriptor>(raw).is_err());
    }

    #[test]
    fn builder_helpers_only_touch_matching_variant() {
        let desc = ServerDescriptor::process("node", ["server.js"])
            .with_env("DEBUG", "1")
            .with_header("X-Ignored", "yes")
            .expecting("tools");
        match &desc.transport {
            TransportSpec::Process { env, .. } => assert_eq!(env.len(), 1),
            other => panic!("expected process transport, got {other:?}"),
        }
        assert_eq!(desc.expect_capabilities, vec!["tools".to_string()]);

        let desc = ServerDescriptor::stream("http://h/sse").with_env("IGNORED", "1");
        assert_eq!(desc.kind(), TransportKind::Stream);
    }
}
