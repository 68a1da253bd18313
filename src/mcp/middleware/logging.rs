//! Structured per-call logging

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Middleware, MiddlewareContext, Next};
use crate::error::{ErrorKind, ToolError};

/// Emits one event when a call starts and one when it finishes
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Value, ToolError> {
        debug!(
            tool = %ctx.call.tool,
            request_id = %ctx.call.id,
            transport = %ctx.call.transport,
            client = %ctx.call.client,
            "Tool call started"
        );

        let result = next.run(ctx).await;
        let elapsed_ms = ctx.started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => info!(
                tool = %ctx.call.tool,
                request_id = %ctx.call.id,
                transport = %ctx.call.transport,
                client = %ctx.call.client,
                elapsed_ms,
                outcome = "success",
                "Tool call finished"
            ),
            // Caller mistakes and admission decisions are not server faults
            Err(err) if is_expected(err.kind) => info!(
                tool = %ctx.call.tool,
                request_id = %ctx.call.id,
                transport = %ctx.call.transport,
                client = %ctx.call.client,
                elapsed_ms,
                outcome = "error",
                kind = %err.kind,
                error = %err.message,
                "Tool call rejected"
            ),
            Err(err) => warn!(
                tool = %ctx.call.tool,
                request_id = %ctx.call.id,
                transport = %ctx.call.transport,
                client = %ctx.call.client,
                elapsed_ms,
                outcome = "error",
                kind = %err.kind,
                error = %err.message,
                "Tool call failed"
            ),
        }

        result
    }
}

fn is_expected(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Validation
            | ErrorKind::RateLimited
            | ErrorKind::CapacityExceeded
            | ErrorKind::Unauthenticated
    )
}
