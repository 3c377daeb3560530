use std::time::Duration;

use serde_json::Value;

use crate::protocol::JsonRpcError;
use crate::transport::TransportError;

/// Errors surfaced by the MCP client.
///
/// `Clone` so that one outcome can be shared by every caller joined onto a
/// single-flight connect or disconnect.
#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    #[error("unknown MCP server: {0}")]
    Configuration(String),

    #[error("failed to spawn MCP server `{server}`: {message}")]
    Spawn { server: String, message: String },

    #[error("MCP transport error: {0}")]
    Transport(TransportError),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server error {code}: {message}")]
    ProtocolFault {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("MCP request `{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("MCP server `{0}` disconnected")]
    Disconnected(String),

    #[error("failed to disconnect {} MCP server(s): {}", .0.len(), summarize(.0))]
    DisconnectAll(Vec<(String, McpError)>),
}

/// Flat taxonomy for callers that only branch on the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Spawn,
    Transport,
    Protocol,
    ProtocolFault,
    Timeout,
    Disconnected,
    Aggregate,
}

impl McpError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::Configuration(_) => ErrorKind::Configuration,
            McpError::Spawn { .. } => ErrorKind::Spawn,
            McpError::Transport(_) => ErrorKind::Transport,
            McpError::Protocol(_) => ErrorKind::Protocol,
            McpError::ProtocolFault { .. } => ErrorKind::ProtocolFault,
            McpError::Timeout { .. } => ErrorKind::Timeout,
            McpError::Disconnected(_) => ErrorKind::Disconnected,
            McpError::DisconnectAll(_) => ErrorKind::Aggregate,
        }
    }

    /// The server-supplied error code, for [`McpError::ProtocolFault`].
    pub fn code(&self) -> Option<i64> {
        match self {
            McpError::ProtocolFault { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn for_server(self, server: &str) -> Self {
        match self {
            McpError::Transport(TransportError::Spawn { message, .. }) => McpError::Spawn {
                server: server.to_string(),
                message,
            },
            other => other,
        }
    }
}

impl From<JsonRpcError> for McpError {
    fn from(e: JsonRpcError) -> Self {
        McpError::ProtocolFault {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

impl From<TransportError> for McpError {
    fn from(e: TransportError) -> Self {
        McpError::Transport(e)
    }
}

impl From<conduit_domain::error::Error> for McpError {
    fn from(e: conduit_domain::error::Error) -> Self {
        match e {
            conduit_domain::error::Error::UnknownServer(name) => McpError::Configuration(name),
            other => McpError::Configuration(other.to_string()),
        }
    }
}

fn summarize(failures: &[(String, McpError)]) -> String {
    failures
        .iter()
        .map(|(server, err)| format!("{server}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_preserves_code_and_data() {
        let err: McpError = JsonRpcError {
            code: -32601,
            message: "not found".into(),
            data: Some(serde_json::json!({ "tool": "foo" })),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::ProtocolFault);
        assert_eq!(err.code(), Some(-32601));
        match err {
            McpError::ProtocolFault { data, .. } => assert_eq!(data.unwrap()["tool"], "foo"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn spawn_failure_is_reclassified_per_server() {
        let err = McpError::from(TransportError::Spawn {
            command: "nope".into(),
            message: "No such file or directory".into(),
        })
        .for_server("fs");
        assert_eq!(err.kind(), ErrorKind::Spawn);
        assert!(err.to_string().contains("`fs`"));
    }

    #[test]
    fn aggregate_display_lists_servers() {
        let err = McpError::DisconnectAll(vec![
            ("a".into(), McpError::Disconnected("a".into())),
            ("b".into(), McpError::Protocol("boom".into())),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("failed to disconnect 2 MCP server(s)"));
        assert!(text.contains("b: MCP protocol error: boom"));
    }
}
