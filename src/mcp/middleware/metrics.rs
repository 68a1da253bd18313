//! Tool execution metrics

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use super::{Middleware, MiddlewareContext, Next};
use crate::error::{ErrorKind, ToolError};
use crate::observability::Metrics;

type Outcome = Result<(), ErrorKind>;

/// Records one execution (and its error kind) per call reaching this layer
///
/// The record is written from the context's deferred cleanup, so a call whose
/// future is dropped mid-flight is still counted, as `cancelled`.
pub struct MetricsMiddleware {
    metrics: Arc<Metrics>,
}

impl MetricsMiddleware {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Value, ToolError> {
        let outcome: Arc<Mutex<Option<Outcome>>> = Arc::default();

        let metrics = self.metrics.clone();
        let tool = ctx.call.tool.clone();
        let started = Instant::now();
        let recorded = outcome.clone();
        ctx.defer(move || {
            let outcome = recorded
                .lock()
                .ok()
                .and_then(|mut slot| slot.take())
                .unwrap_or(Err(ErrorKind::Cancelled));
            metrics.record_tool_call(&tool, outcome, started.elapsed());
        });

        let result = next.run(ctx).await;
        if let Ok(mut slot) = outcome.lock() {
            *slot = Some(result.as_ref().map(|_| ()).map_err(|e| e.kind));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::dispatcher::{ToolCall, Transport};
    use crate::mcp::middleware::{Endpoint, MiddlewareChain};
    use crate::observability::{OUTCOME_ERROR, OUTCOME_SUCCESS};
    use serde_json::json;
    use std::time::Duration;

    struct Fixed(Result<Value, ToolError>);

    #[async_trait]
    impl Endpoint for Fixed {
        async fn call(&self, _ctx: &mut MiddlewareContext) -> Result<Value, ToolError> {
            self.0.clone()
        }
    }

    struct Hang;

    #[async_trait]
    impl Endpoint for Hang {
        async fn call(&self, _ctx: &mut MiddlewareContext) -> Result<Value, ToolError> {
            std::future::pending().await
        }
    }

    fn setup() -> (Arc<Metrics>, MiddlewareChain) {
        let metrics = Arc::new(Metrics::new().unwrap());
        let chain = MiddlewareChain::builder()
            .layer(MetricsMiddleware::new(metrics.clone()))
            .build();
        (metrics, chain)
    }

    fn context() -> MiddlewareContext {
        MiddlewareContext::new(ToolCall::new("scan", json!({}), Transport::Stdio))
    }

    #[tokio::test]
    async fn test_records_once_when_context_finishes() {
        let (metrics, chain) = setup();

        let mut ctx = context();
        chain.run(&mut ctx, &Fixed(Ok(json!(1)))).await.unwrap();
        assert_eq!(metrics.tool_executions("scan", OUTCOME_SUCCESS), 0);
        drop(ctx);
        assert_eq!(metrics.tool_executions("scan", OUTCOME_SUCCESS), 1);

        let mut ctx = context();
        let failure = Err(ToolError::internal("broken"));
        chain.run(&mut ctx, &Fixed(failure)).await.unwrap_err();
        drop(ctx);
        assert_eq!(metrics.tool_executions("scan", OUTCOME_ERROR), 1);
        assert_eq!(metrics.tool_errors("scan", ErrorKind::Internal), 1);
    }

    #[tokio::test]
    async fn test_dropped_call_counts_as_cancelled() {
        let (metrics, chain) = setup();

        let mut ctx = context();
        let outcome = tokio::time::timeout(Duration::from_millis(10), chain.run(&mut ctx, &Hang)).await;
        assert!(outcome.is_err());
        drop(ctx);

        assert_eq!(metrics.tool_executions("scan", OUTCOME_ERROR), 1);
        assert_eq!(metrics.tool_errors("scan", ErrorKind::Cancelled), 1);
    }
}
