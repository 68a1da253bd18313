//! MCP (Model Context Protocol) module
//!
//! The tool dispatch engine (registry, schema validation, concurrency limit,
//! middleware chain, dispatcher) and the stdio and HTTP transports in front
//! of it.

pub mod dispatcher;
pub mod http;
pub mod limiter;
pub mod middleware;
pub mod registry;
pub mod schema;
pub mod server;
pub mod shutdown;
pub mod tools;
pub mod types;

pub use dispatcher::{Dispatcher, ToolCall, ToolResult, Transport};
pub use registry::{handler_fn, ToolContext, ToolDefinition, ToolHandler, ToolRegistry};
pub use schema::{CompiledSchema, Schema};
pub use shutdown::Shutdown;
