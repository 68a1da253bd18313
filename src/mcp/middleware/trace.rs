//! Span per tool call

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info_span, Instrument};

use super::{Middleware, MiddlewareContext, Next};
use crate::error::ToolError;

/// Runs the rest of the chain inside a `tool_call` span
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &'static str {
        "tracing"
    }

    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Value, ToolError> {
        let span = info_span!(
            "tool_call",
            tool = %ctx.call.tool,
            request_id = %ctx.call.id,
            transport = %ctx.call.transport,
            error_kind = tracing::field::Empty,
        );
        ctx.span = Some(span.clone());

        let result = next.run(ctx).instrument(span.clone()).await;
        if let Err(err) = &result {
            span.record("error_kind", err.kind.as_str());
        }
        result
    }
}
