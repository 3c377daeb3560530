//! Per-server client handle exposing the MCP protocol operations.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::connection::{Connection, ConnectionState};
use crate::correlation::ProgressCallback;
use crate::error::McpError;
use crate::manager::McpManager;
use crate::protocol::{
    methods, CallToolResult, CompleteResult, Completion, CompletionReference, GetPromptResult,
    Implementation, ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult, LoggingLevel, Progress, PromptArguments, ReadResourceResult,
    ServerCapabilities, Tool,
};

/// Upper bound on `tools/list` pages followed by [`McpClient::list_all_tools`].
const MAX_TOOL_PAGES: usize = 64;

/// Handle bound to one live connection.
///
/// Operations fail with [`McpError::Disconnected`] once the connection is
/// gone; get a fresh handle from the manager after reconnecting.
#[derive(Clone)]
pub struct McpClient {
    name: String,
    connection: Arc<Connection>,
    manager: McpManager,
}

impl std::fmt::Debug for McpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpClient")
            .field("server", &self.name)
            .field("state", &self.connection.state())
            .finish()
    }
}

impl McpClient {
    pub(crate) fn new(name: &str, connection: Arc<Connection>, manager: McpManager) -> Self {
        Self {
            name: name.to_string(),
            connection,
            manager,
        }
    }

    pub fn server(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn server_capabilities(&self) -> Option<ServerCapabilities> {
        self.connection.capabilities()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.connection.initialize_result().map(|r| r.server_info)
    }

    /// Instructions the server returned from `initialize`, if any.
    pub fn instructions(&self) -> Option<String> {
        self.connection.initialize_result().and_then(|r| r.instructions)
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.connection.request(methods::PING, None).await.map(drop)
    }

    /// One page of `tools/list`.
    pub async fn list_tools(&self, cursor: Option<&str>) -> Result<ListToolsResult, McpError> {
        self.call(methods::TOOLS_LIST, cursor_params(cursor)).await
    }

    /// Every tool, following `nextCursor` until exhausted.
    pub async fn list_all_tools(&self) -> Result<Vec<Tool>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let page = self.list_tools(cursor.as_deref()).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
        tracing::warn!(server = %self.name, pages = MAX_TOOL_PAGES, "tools/list pagination truncated");
        Ok(tools)
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, McpError> {
        self.call(methods::TOOLS_CALL, Some(tool_params(name, arguments))).await
    }

    /// Call a tool and receive its progress notifications.
    pub async fn call_tool_with_progress(
        &self,
        name: &str,
        arguments: Value,
        on_progress: impl Fn(Progress) + Send + Sync + 'static,
    ) -> Result<CallToolResult, McpError> {
        let callback: ProgressCallback = Arc::new(on_progress);
        let value = self
            .connection
            .request_with_progress(methods::TOOLS_CALL, Some(tool_params(name, arguments)), callback)
            .await?;
        decode(methods::TOOLS_CALL, value)
    }

    pub async fn list_resources(&self, cursor: Option<&str>) -> Result<ListResourcesResult, McpError> {
        self.call(methods::RESOURCES_LIST, cursor_params(cursor)).await
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<&str>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        self.call(methods::RESOURCE_TEMPLATES_LIST, cursor_params(cursor)).await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        self.call(methods::RESOURCES_READ, Some(json!({ "uri": uri }))).await
    }

    pub async fn list_prompts(&self, cursor: Option<&str>) -> Result<ListPromptsResult, McpError> {
        self.call(methods::PROMPTS_LIST, cursor_params(cursor)).await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: PromptArguments,
    ) -> Result<GetPromptResult, McpError> {
        self.call(
            methods::PROMPTS_GET,
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// Ask for completions of one argument of a prompt or resource template.
    pub async fn complete(
        &self,
        reference: CompletionReference,
        argument: &str,
        value: &str,
    ) -> Result<Completion, McpError> {
        let params = json!({
            "ref": reference,
            "argument": { "name": argument, "value": value },
        });
        let result: CompleteResult = self.call(methods::COMPLETE, Some(params)).await?;
        Ok(result.completion)
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<(), McpError> {
        self.connection
            .request(methods::LOGGING_SET_LEVEL, Some(json!({ "level": level })))
            .await
            .map(drop)
    }

    /// Raw request for methods without a typed wrapper.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.connection.request(method, params).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.connection.notify(method, params).await
    }

    /// Disconnect this server from the owning manager.
    pub async fn disconnect(&self) -> Result<(), McpError> {
        self.manager.disconnect(&self.name).await
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T, McpError> {
        let value = self.connection.request(method, params).await?;
        decode(method, value)
    }
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, McpError> {
    serde_json::from_value(value)
        .map_err(|e| McpError::Protocol(format!("failed to parse {method} result: {e}")))
}

fn cursor_params(cursor: Option<&str>) -> Option<Value> {
    cursor.map(|c| json!({ "cursor": c }))
}

fn tool_params(name: &str, arguments: Value) -> Value {
    let arguments = match arguments {
        Value::Null => json!({}),
        other => other,
    };
    json!({ "name": name, "arguments": arguments })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_arguments_become_empty_object() {
        let params = tool_params("echo", Value::Null);
        assert_eq!(params, json!({ "name": "echo", "arguments": {} }));
    }

    #[test]
    fn cursor_is_optional() {
        assert!(cursor_params(None).is_none());
        assert_eq!(cursor_params(Some("p2")).unwrap()["cursor"], "p2");
    }

    #[test]
    fn decode_failure_is_protocol_error() {
        let err = decode::<ListToolsResult>(methods::TOOLS_LIST, json!({ "nope": 1 })).unwrap_err();
        assert!(matches!(err, McpError::Protocol(ref m) if m.contains("tools/list")));
    }
}
