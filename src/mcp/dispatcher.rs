//! Tool call dispatcher
//!
//! Single entry point used by both transports. A call is resolved against
//! the registry, its arguments are validated, and it then runs through the
//! middleware chain to the execution endpoint, which takes a concurrency slot
//! and runs the handler on its own task. Every failure comes back as a
//! structured [`ToolError`] inside the [`ToolResult`]; nothing escapes as a
//! panic or a transport-level failure.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::Config;
use crate::error::{ErrorKind, ToolError};
use crate::mcp::limiter::ConcurrencyLimiter;
use crate::mcp::middleware::{
    Endpoint, LoggingMiddleware, MetricsMiddleware, MiddlewareChain, MiddlewareContext,
    RateLimitMiddleware, TracingMiddleware,
};
use crate::mcp::registry::{ToolDefinition, ToolRegistry};
use crate::mcp::shutdown::Shutdown;
use crate::observability::Metrics;

/// Deadline applied to calls built without a dispatcher
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on any call deadline (about 30 years)
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Transport a call arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stdio,
    Http,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Stdio => f.write_str("stdio"),
            Transport::Http => f.write_str("http"),
        }
    }
}

/// One tool invocation
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Correlation id echoed back in the result
    pub id: String,
    pub tool: String,
    pub arguments: Value,
    pub transport: Transport,

    /// Identity used for rate limiting and logs
    pub client: String,
    pub received_at: DateTime<Utc>,
    pub deadline: Instant,
    pub cancellation: CancellationToken,
}

/// Deadline `timeout` from now, clamped to a far-future instant
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(FAR_FUTURE)).unwrap_or(now)
}

impl ToolCall {
    pub fn new(tool: impl Into<String>, arguments: Value, transport: Transport) -> Self {
        let client = match transport {
            Transport::Stdio => "stdio",
            Transport::Http => "anonymous",
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tool: tool.into(),
            arguments,
            transport,
            client: client.to_string(),
            received_at: Utc::now(),
            deadline: deadline_after(DEFAULT_TOOL_TIMEOUT),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = client.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Outcome of a dispatched call
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub request_id: String,
    pub tool: String,
    pub outcome: Result<Value, ToolError>,
    pub elapsed: Duration,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.outcome.as_ref().err().map(|e| e.kind)
    }
}

/// Routes tool calls from any transport to their handlers
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    chain: MiddlewareChain,
    limiter: Arc<ConcurrencyLimiter>,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
    tool_timeout: Duration,
}

impl Dispatcher {
    /// Dispatcher with the standard middleware chain
    ///
    /// Order, outermost first: logging, tracing, metrics, rate limiting.
    pub fn new(
        registry: Arc<ToolRegistry>,
        config: &Config,
        metrics: Arc<Metrics>,
        shutdown: Shutdown,
    ) -> Self {
        let chain = MiddlewareChain::builder()
            .layer(LoggingMiddleware)
            .layer(TracingMiddleware)
            .layer(MetricsMiddleware::new(metrics.clone()))
            .optional_layer(RateLimitMiddleware::from_limits(
                config.client_rate_limit,
                config.tool_rate_limit,
                metrics.clone(),
            ))
            .build();
        Self::with_chain(registry, config, metrics, shutdown, chain)
    }

    /// Dispatcher with a caller-supplied chain
    pub fn with_chain(
        registry: Arc<ToolRegistry>,
        config: &Config,
        metrics: Arc<Metrics>,
        shutdown: Shutdown,
        chain: MiddlewareChain,
    ) -> Self {
        tracing::debug!(
            middlewares = ?chain.names(),
            max_concurrent_tools = config.max_concurrent_tools,
            policy = ?config.limiter_policy,
            "Building dispatcher"
        );
        let limiter = ConcurrencyLimiter::new(
            config.max_concurrent_tools,
            config.limiter_policy,
            metrics.clone(),
        );
        Self {
            registry,
            chain,
            limiter: Arc::new(limiter),
            metrics,
            shutdown,
            tool_timeout: config.tool_timeout,
        }
    }

    /// Build a call with the configured deadline, cancelled on forced shutdown
    pub fn new_call(&self, tool: impl Into<String>, arguments: Value, transport: Transport) -> ToolCall {
        ToolCall::new(tool, arguments, transport)
            .with_deadline(deadline_after(self.tool_timeout))
            .with_cancellation(self.shutdown.abort_token().child_token())
    }

    /// Execute a call and report its outcome
    pub async fn dispatch(&self, call: ToolCall) -> ToolResult {
        let started = Instant::now();
        let request_id = call.id.clone();
        let tool = call.tool.clone();

        let outcome = self.execute(call).await;

        ToolResult {
            request_id,
            tool,
            outcome,
            elapsed: started.elapsed(),
        }
    }

    async fn execute(&self, mut call: ToolCall) -> Result<Value, ToolError> {
        let Some(_admitted) = self.shutdown.enter() else {
            return Err(ToolError::cancelled("Server is shutting down"));
        };

        let definition = self.registry.resolve(&call.tool).map_err(|e| {
            tracing::debug!(tool = %call.tool, request_id = %call.id, "Unknown tool requested");
            ToolError::from(e)
        })?;

        call.arguments = definition.schema.validate(&call.arguments).map_err(|fields| {
            self.metrics.record_tool_error(&call.tool, ErrorKind::Validation);
            let err = ToolError::validation(fields);
            tracing::info!(
                tool = %call.tool,
                request_id = %call.id,
                transport = %call.transport,
                error = %err.message,
                "Tool arguments rejected"
            );
            err
        })?;

        let mut ctx = MiddlewareContext::new(call);
        let endpoint = ExecuteTool {
            definition,
            limiter: self.limiter.clone(),
        };
        self.chain.run(&mut ctx, &endpoint).await
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Chain endpoint: take a slot, run the handler, enforce deadline and cancellation
struct ExecuteTool {
    definition: Arc<ToolDefinition>,
    limiter: Arc<ConcurrencyLimiter>,
}

#[async_trait]
impl Endpoint for ExecuteTool {
    async fn call(&self, ctx: &mut MiddlewareContext) -> Result<Value, ToolError> {
        let deadline = ctx.call.deadline;
        let cancellation = ctx.call.cancellation.clone();

        let _slot = self.limiter.acquire(deadline, &cancellation).await?;

        let handler = self.definition.handler.clone();
        let arguments = ctx.call.arguments.clone();
        let tool_ctx = ctx.tool_context();
        let span = ctx.span.clone().unwrap_or_else(tracing::Span::current);

        // Own task so a panicking handler cannot take the transport down
        let mut task = AbortOnDrop(tokio::spawn(
            async move { handler.call(arguments, tool_ctx).await }.instrument(span),
        ));

        tokio::select! {
            biased;
            joined = &mut task.0 => match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => {
                    tracing::error!(tool = %ctx.call.tool, request_id = %ctx.call.id, "Tool handler panicked");
                    Err(ToolError::internal("Tool handler panicked"))
                }
                Err(_) => Err(ToolError::cancelled("Tool task was aborted")),
            },
            _ = cancellation.cancelled() => Err(ToolError::cancelled("Tool call was cancelled")),
            _ = tokio::time::sleep_until(deadline) => {
                Err(ToolError::timeout(ctx.started.elapsed().as_millis()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterPolicy;
    use crate::error::UpstreamError;
    use crate::mcp::registry::handler_fn;
    use crate::mcp::schema::Schema;
    use crate::observability::{OUTCOME_ERROR, OUTCOME_SUCCESS};
    use serde_json::json;

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDefinition::new(
                "echo",
                "Echo the message",
                Schema::object()
                    .required_property("message", Schema::string())
                    .deny_additional(),
                handler_fn(|args, _ctx| async move { Ok(json!({"echo": args["message"]})) }),
            ).unwrap())
            .unwrap();
        registry
            .register(ToolDefinition::new(
                "boom",
                "Panics",
                Schema::object(),
                handler_fn(|_args, _ctx| async move {
                    if true {
                        panic!("handler exploded");
                    }
                    Ok(Value::Null)
                }),
            ).unwrap())
            .unwrap();
        registry
            .register(ToolDefinition::new(
                "sleep",
                "Sleeps for a long time",
                Schema::object(),
                handler_fn(|_args, _ctx| async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                }),
            ).unwrap())
            .unwrap();
        registry
            .register(ToolDefinition::new(
                "upstream",
                "Fails upstream",
                Schema::object(),
                handler_fn(|_args, _ctx| async move {
                    Err(UpstreamError::from_status(503, "maintenance").into())
                }),
            ).unwrap())
            .unwrap();
        registry
    }

    fn dispatcher(config: Config) -> Dispatcher {
        Dispatcher::new(
            Arc::new(registry()),
            &config,
            Arc::new(Metrics::new().unwrap()),
            Shutdown::new(),
        )
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let dispatcher = dispatcher(Config::default());
        let call = dispatcher
            .new_call("echo", json!({"message": "hi"}), Transport::Stdio)
            .with_id("req-1");

        let result = dispatcher.dispatch(call).await;
        assert_eq!(result.request_id, "req-1");
        assert_eq!(result.outcome.unwrap(), json!({"echo": "hi"}));
        assert_eq!(dispatcher.metrics().tool_executions("echo", OUTCOME_SUCCESS), 1);
        assert_eq!(dispatcher.metrics().active_tools(), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_never_executes() {
        let dispatcher = dispatcher(Config::default());
        let call = dispatcher.new_call("nope", json!({}), Transport::Http);

        let result = dispatcher.dispatch(call).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::UnknownTool));
        assert_eq!(dispatcher.metrics().tool_executions("nope", OUTCOME_SUCCESS), 0);
        assert_eq!(dispatcher.metrics().tool_executions("nope", OUTCOME_ERROR), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_cites_field() {
        let dispatcher = dispatcher(Config::default());
        let call = dispatcher.new_call("echo", json!({}), Transport::Stdio);

        let err = dispatcher.dispatch(call).await.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert!(err.fields.iter().any(|f| f.field == "message"));
        assert_eq!(dispatcher.metrics().tool_errors("echo", ErrorKind::Validation), 1);
        assert_eq!(dispatcher.metrics().tool_executions("echo", OUTCOME_ERROR), 0);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_and_releases_slot() {
        let dispatcher = dispatcher(Config {
            max_concurrent_tools: 1,
            limiter_policy: LimiterPolicy::Reject,
            ..Config::default()
        });

        let result = dispatcher
            .dispatch(dispatcher.new_call("boom", json!({}), Transport::Stdio))
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Internal));
        assert_eq!(dispatcher.limiter().in_flight(), 0);

        let result = dispatcher
            .dispatch(dispatcher.new_call("echo", json!({"message": "after"}), Transport::Stdio))
            .await;
        assert!(result.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_produces_timeout() {
        let dispatcher = dispatcher(Config {
            tool_timeout: Duration::from_millis(100),
            ..Config::default()
        });

        let result = dispatcher
            .dispatch(dispatcher.new_call("sleep", json!({}), Transport::Http))
            .await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(dispatcher.limiter().in_flight(), 0);
        assert_eq!(dispatcher.metrics().tool_errors("sleep", ErrorKind::Timeout), 1);
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_overflow() {
        let dispatcher = dispatcher(Config {
            tool_timeout: Duration::from_secs(u64::MAX),
            ..Config::default()
        });

        let call = dispatcher.new_call("echo", json!({"message": "hi"}), Transport::Stdio);
        assert!(call.deadline > Instant::now() + Duration::from_secs(86_400));
        assert!(dispatcher.dispatch(call).await.is_success());
    }

    #[tokio::test]
    async fn test_cancellation_releases_slot() {
        let dispatcher = Arc::new(dispatcher(Config::default()));
        let token = CancellationToken::new();
        let call = dispatcher
            .new_call("sleep", json!({}), Transport::Http)
            .with_cancellation(token.clone());

        let running = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(call).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.limiter().in_flight(), 1);

        token.cancel();
        let result = running.await.unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
        assert_eq!(dispatcher.limiter().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_is_wrapped() {
        let dispatcher = dispatcher(Config::default());
        let err = dispatcher
            .dispatch(dispatcher.new_call("upstream", json!({}), Transport::Stdio))
            .await
            .outcome
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upstream);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_before_execution() {
        let dispatcher = dispatcher(Config {
            client_rate_limit: Some(crate::config::RateLimit {
                max_requests: 2,
                window: Duration::from_secs(60),
            }),
            ..Config::default()
        });

        for _ in 0..2 {
            let call = dispatcher.new_call("echo", json!({"message": "x"}), Transport::Stdio);
            assert!(dispatcher.dispatch(call).await.is_success());
        }
        let call = dispatcher.new_call("echo", json!({"message": "x"}), Transport::Stdio);
        let err = dispatcher.dispatch(call).await.outcome.unwrap_err();
        assert_eq!(err.kind, ErrorKind::RateLimited);
        assert!(err.retry_after_secs.is_some());
        assert_eq!(dispatcher.metrics().rate_limited("client"), 1);
    }

    #[tokio::test]
    async fn test_refuses_calls_after_shutdown() {
        let dispatcher = dispatcher(Config::default());
        dispatcher.shutdown().trigger();

        let call = dispatcher.new_call("echo", json!({"message": "x"}), Transport::Stdio);
        let result = dispatcher.dispatch(call).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_forced_drain_cancels_running_call() {
        let dispatcher = Arc::new(dispatcher(Config::default()));
        let call = dispatcher.new_call("sleep", json!({}), Transport::Stdio);

        let running = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(call).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!dispatcher.shutdown().drain(Duration::from_millis(20)).await);
        let result = running.await.unwrap();
        assert_eq!(result.error_kind(), Some(ErrorKind::Cancelled));
    }
}
