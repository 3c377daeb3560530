//! `conduit-mcp-client`: client runtime for MCP (Model Context Protocol)
//! servers.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types and a framing codec.
//! - A process transport (child process, newline-delimited JSON on stdio)
//!   and a stream transport (Server-Sent-Event push channel plus POST).
//! - Request correlation with deadlines and progress callbacks.
//! - A per-server connection state machine with handshake retries.
//! - An [`McpManager`] that deduplicates connects and disconnects per server
//!   name and keeps independent manager instances consistent.
//!
//! # Usage
//!
//! ```rust,ignore
//! use conduit_mcp_client::{ClientConfig, McpManager};
//!
//! let config = ClientConfig::load("mcp.toml")?;
//! let manager = McpManager::new(config);
//!
//! let client = manager.use_server("filesystem").await?.get_client("filesystem").unwrap();
//! for tool in client.list_all_tools().await? {
//!     println!("{}", tool.name);
//! }
//! let result = client.call_tool("read_file", json!({ "path": "/tmp/test.txt" })).await?;
//!
//! manager.disconnect_all().await?;
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod manager;
pub mod protocol;
mod registry;
pub mod transport;

// Re-exports for convenience.
pub use client::McpClient;
pub use conduit_domain::config::{ClientConfig, ClientOptions, ServerDescriptor, TransportKind, TransportSpec};
pub use connection::{ConnectionState, ServerNotification};
pub use error::{ErrorKind, McpError};
pub use manager::{ManagerBuilder, ManagerState, McpManager};
pub use protocol::{CallToolResult, Content, LoggingLevel, Progress, Tool};
