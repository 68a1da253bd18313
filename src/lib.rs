//! Pentest Collaboration MCP Server Library
//!
//! A Model Context Protocol (MCP) server exposing a pentest collaboration
//! platform as tools. Tool calls arrive over stdio or HTTP, are validated
//! against their schemas, pass a middleware chain and a concurrency limit,
//! and are executed against the collaboration API.

pub mod collab;
pub mod config;
pub mod error;
pub mod mcp;
pub mod observability;

pub use config::Config;
pub use error::{ErrorKind, PentestMcpError, Result, ToolError};
pub use observability::Metrics;
