//! Error types for the Pentest MCP Server
//!
//! This module defines the error hierarchy for all operations in the server:
//! process-level failures (`PentestMcpError`) and the structured tool-level
//! errors (`ToolError`) that are returned to clients instead of being raised.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the Pentest MCP Server
#[derive(Error, Debug)]
pub enum PentestMcpError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Tool registration errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Collaboration API errors
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Metrics registry errors
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required setting: {name}")]
    MissingSetting { name: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Tool registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool already registered: {name}")]
    DuplicateTool { name: String },

    #[error("Invalid schema for tool {name}: {message}")]
    InvalidSchema { name: String, message: String },

    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },
}

/// Failure reported by the collaboration framework API
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct UpstreamError {
    /// HTTP status returned by the API, if a response was received
    pub status: Option<u16>,

    /// Human readable description
    pub message: String,

    /// Whether repeating the request may succeed
    pub retryable: bool,
}

impl UpstreamError {
    /// Build an error from a non-success HTTP status
    pub fn from_status(status: u16, body: &str) -> Self {
        let retryable = status == 429 || (500..600).contains(&status);
        let body = body.trim();
        let message = if body.is_empty() {
            format!("collaboration API returned {}", status)
        } else {
            format!("collaboration API returned {}: {}", status, truncate(body, 512))
        };

        Self {
            status: Some(status),
            message,
            retryable,
        }
    }

    /// Build an error for a request that never produced a response
    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            status: None,
            message: message.into(),
            retryable,
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return UpstreamError::from_status(status.as_u16(), "");
        }
        let retryable = err.is_timeout() || err.is_connect() || err.is_request();
        UpstreamError::transport(err.to_string(), retryable)
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// ==================== Tool-level errors ====================

/// Category of a failed tool call, as seen by clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTool,
    Validation,
    CapacityExceeded,
    Unauthenticated,
    RateLimited,
    Upstream,
    Internal,
    Cancelled,
    Timeout,
    InvalidRequest,
}

impl ErrorKind {
    /// Every declared kind, in declaration order
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::UnknownTool,
        ErrorKind::Validation,
        ErrorKind::CapacityExceeded,
        ErrorKind::Unauthenticated,
        ErrorKind::RateLimited,
        ErrorKind::Upstream,
        ErrorKind::Internal,
        ErrorKind::Cancelled,
        ErrorKind::Timeout,
        ErrorKind::InvalidRequest,
    ];

    /// Stable label used on the wire and in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UnknownTool => "unknown_tool",
            ErrorKind::Validation => "validation",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Internal => "internal",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single violated field reported by argument validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Path of the offending value (`target.port`, `tags[2]`)
    pub field: String,

    /// What is wrong with it
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Structured error descriptor returned for a failed tool call
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ToolError {
    /// Error category
    pub kind: ErrorKind,

    /// Human readable description
    pub message: String,

    /// Whether the client may retry the same call
    #[serde(default)]
    pub retryable: bool,

    /// Field-level detail for validation failures
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,

    /// Seconds until a rate-limited caller may retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ToolError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
            fields: Vec::new(),
            retry_after_secs: None,
        }
    }

    pub fn unknown_tool(name: &str) -> Self {
        Self::new(ErrorKind::UnknownTool, format!("Unknown tool: {}", name))
    }

    /// Validation failure enumerating every violated field
    pub fn validation(fields: Vec<FieldError>) -> Self {
        let summary = fields
            .iter()
            .map(|f| format!("{}: {}", f.field, f.message))
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            fields,
            ..Self::new(ErrorKind::Validation, format!("Invalid arguments: {}", summary))
        }
    }

    pub fn capacity_exceeded(limit: usize) -> Self {
        Self {
            retryable: true,
            ..Self::new(
                ErrorKind::CapacityExceeded,
                format!("All {} tool execution slots are busy", limit),
            )
        }
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    pub fn rate_limited(scope: &str, retry_after_secs: u64) -> Self {
        Self {
            retryable: true,
            retry_after_secs: Some(retry_after_secs),
            ..Self::new(
                ErrorKind::RateLimited,
                format!(
                    "Rate limit exceeded for {}; retry after {} seconds",
                    scope, retry_after_secs
                ),
            )
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn timeout(after_ms: u128) -> Self {
        Self {
            retryable: true,
            ..Self::new(
                ErrorKind::Timeout,
                format!("Tool execution exceeded its deadline after {} ms", after_ms),
            )
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }
}

impl From<UpstreamError> for ToolError {
    fn from(err: UpstreamError) -> Self {
        Self {
            retryable: err.retryable,
            ..Self::new(ErrorKind::Upstream, err.message)
        }
    }
}

impl From<RegistryError> for ToolError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownTool { name } => ToolError::unknown_tool(&name),
            other => ToolError::internal(other.to_string()),
        }
    }
}

/// Result type alias for Pentest MCP operations
pub type Result<T> = std::result::Result<T, PentestMcpError>;
