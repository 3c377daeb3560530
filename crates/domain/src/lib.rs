//! `conduit-domain`: configuration and shared error types for Conduit.
//!
//! Kept separate from `conduit-mcp-client` so that configuration loaders can
//! deserialize server tables without pulling in the async runtime.

pub mod config;
pub mod error;
