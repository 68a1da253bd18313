//! Tool registry
//!
//! Holds the tool definitions exposed by the server. Tools are registered at
//! startup and the registry is then shared read-only (behind an `Arc`) by the
//! dispatcher and both transports, so lookups need no locking.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{RegistryError, ToolError};
use crate::mcp::schema::{CompiledSchema, Schema};

/// Per-call information handed to a tool handler
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Correlation id of the call
    pub request_id: String,

    /// Name of the tool being executed
    pub tool: String,

    /// Identity of the caller
    pub client: String,

    /// Cancelled on shutdown or when the caller goes away
    pub cancellation: CancellationToken,

    /// Point in time after which the result is no longer wanted
    pub deadline: Instant,
}

impl ToolContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Body of a tool
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Execute the tool with already validated arguments
    async fn call(&self, args: Value, ctx: ToolContext) -> Result<Value, ToolError>;
}

/// Adapter turning an async closure into a [`ToolHandler`]
pub struct FnHandler<F>(F);

/// Wrap a closure `|args, ctx| async { ... }` as a tool handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    async fn call(&self, args: Value, ctx: ToolContext) -> Result<Value, ToolError> {
        (self.0)(args, ctx).await
    }
}

/// A registered tool: name, description, compiled input schema and handler
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub schema: CompiledSchema,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolDefinition {
    /// Compile `schema` into a definition; malformed schemas are rejected
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Schema,
        handler: impl ToolHandler + 'static,
    ) -> Result<Self, RegistryError> {
        Self::from_json_schema(name, description, schema.to_json(), handler)
    }

    /// Build a definition from a JSON Schema document
    pub fn from_json_schema(
        name: impl Into<String>,
        description: impl Into<String>,
        schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        let schema = CompiledSchema::compile(schema).map_err(|message| RegistryError::InvalidSchema {
            name: name.clone(),
            message,
        })?;
        Ok(Self {
            name,
            description: description.into(),
            schema,
            handler: Arc::new(handler),
        })
    }

    /// Discovery view of this tool
    pub fn summary(&self) -> ToolSummary {
        ToolSummary {
            name: self.name.clone(),
            description: self.description.clone(),
            schema: self.schema.to_json(),
        }
    }
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Name, description and JSON Schema of a tool, as listed to clients
#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// Registry of tool definitions, in registration order
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<ToolDefinition>>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool; names must be unique and schemas well formed
    pub fn register(&mut self, definition: ToolDefinition) -> Result<(), RegistryError> {
        if self.index.contains_key(&definition.name) {
            return Err(RegistryError::DuplicateTool {
                name: definition.name,
            });
        }
        if definition.name.trim().is_empty() {
            return Err(RegistryError::InvalidSchema {
                name: definition.name,
                message: "tool name must not be empty".to_string(),
            });
        }
        if !definition.schema.is_object() {
            return Err(RegistryError::InvalidSchema {
                name: definition.name,
                message: "tool arguments must be described by an object schema".to_string(),
            });
        }

        tracing::debug!(tool = %definition.name, "Registered tool");
        self.index.insert(definition.name.clone(), self.tools.len());
        self.tools.push(Arc::new(definition));
        Ok(())
    }

    /// Look up a tool by name
    pub fn resolve(&self, name: &str) -> Result<Arc<ToolDefinition>, RegistryError> {
        self.index
            .get(name)
            .map(|&i| self.tools[i].clone())
            .ok_or_else(|| RegistryError::UnknownTool {
                name: name.to_string(),
            })
    }

    /// All tools in registration order
    pub fn list(&self) -> Vec<ToolSummary> {
        self.tools.iter().map(|t| t.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> impl ToolHandler {
        handler_fn(|args, _ctx| async move { Ok(args) })
    }

    fn echo_schema() -> Schema {
        Schema::object().required_property("message", Schema::string())
    }

    fn echo(name: &str, description: &str) -> ToolDefinition {
        ToolDefinition::new(name, description, echo_schema(), noop()).unwrap()
    }

    #[test]
    fn test_resolve_returns_registered_definition() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("echo", "Echo")).unwrap();

        let first = registry.resolve("echo").unwrap();
        let second = registry.resolve("echo").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.description, "Echo");
    }

    #[test]
    fn test_duplicate_rejected_without_overwrite() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("echo", "first")).unwrap();
        let err = registry.register(echo("echo", "second")).unwrap_err();

        assert_eq!(
            err,
            RegistryError::DuplicateTool {
                name: "echo".to_string()
            }
        );
        assert_eq!(registry.resolve("echo").unwrap().description, "first");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.resolve("missing"),
            Err(RegistryError::UnknownTool { .. })
        ));
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let bad = Schema::object().property("n", Schema::from_json(&json!({"type": "strnig"})).unwrap());
        let err = ToolDefinition::new("bad", "", bad, noop()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));

        let err = ToolDefinition::from_json_schema("bad", "", json!({"type": 1}), noop()).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));

        let mut registry = ToolRegistry::new();
        let scalar = ToolDefinition::new("scalar", "", Schema::string(), noop()).unwrap();
        let err = registry.register(scalar).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSchema { .. }));
    }

    #[test]
    fn test_list_preserves_insertion_order() {
        let mut registry = ToolRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(echo(name, name)).unwrap();
        }
        let names: Vec<_> = registry.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }
}
