//! Middleware chain for tool calls
//!
//! Every dispatched call flows through an ordered list of [`Middleware`]
//! objects before reaching the tool endpoint. Each one receives the call's
//! [`MiddlewareContext`] and a [`Next`] continuation: it may reject the call
//! before invoking `next`, wrap `next` (timing, spans), or inspect the result
//! afterwards. Returning an error short-circuits everything downstream; the
//! outer middlewares still see that error on the way back out.
//!
//! Cleanup that must happen however the call ends (including the future
//! being dropped mid-flight) is registered with [`MiddlewareContext::defer`].

mod auth;
mod logging;
mod metrics;
mod rate_limit;
mod trace;

pub use auth::BearerAuth;
pub use logging::LoggingMiddleware;
pub use metrics::MetricsMiddleware;
pub use rate_limit::{RateLimitMiddleware, RateLimiter};
pub use trace::TracingMiddleware;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::ToolError;
use crate::mcp::dispatcher::ToolCall;
use crate::mcp::registry::ToolContext;

type Deferred = Box<dyn FnOnce() + Send>;

/// State of one call as it moves through the chain
pub struct MiddlewareContext {
    /// The call being executed; arguments are already validated
    pub call: ToolCall,

    /// Span opened for this call by the tracing middleware
    pub span: Option<tracing::Span>,

    /// When the call entered the chain
    pub started: Instant,

    deferred: Vec<Deferred>,
}

impl MiddlewareContext {
    pub fn new(call: ToolCall) -> Self {
        Self {
            call,
            span: None,
            started: Instant::now(),
            deferred: Vec::new(),
        }
    }

    /// Identity the call is attributed to
    pub fn client(&self) -> &str {
        &self.call.client
    }

    /// Register cleanup that runs when the call finishes, in reverse order
    pub fn defer(&mut self, action: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(action));
    }

    /// View handed to the tool handler
    pub fn tool_context(&self) -> ToolContext {
        ToolContext {
            request_id: self.call.id.clone(),
            tool: self.call.tool.clone(),
            client: self.call.client.clone(),
            cancellation: self.call.cancellation.clone(),
            deadline: self.call.deadline,
        }
    }
}

impl Drop for MiddlewareContext {
    fn drop(&mut self) {
        while let Some(action) = self.deferred.pop() {
            action();
        }
    }
}

/// Terminal step of the chain
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, ctx: &mut MiddlewareContext) -> Result<Value, ToolError>;
}

/// Interceptor applied to every tool call
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Short name, used in logs
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &mut MiddlewareContext, next: Next<'_>) -> Result<Value, ToolError>;
}

/// The remainder of the chain after the current middleware
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    /// Continue with the next middleware, or the endpoint if none is left
    pub async fn run(self, ctx: &mut MiddlewareContext) -> Result<Value, ToolError> {
        match self.remaining.split_first() {
            Some((middleware, rest)) => {
                let next = Next {
                    remaining: rest,
                    endpoint: self.endpoint,
                };
                middleware.handle(ctx, next).await
            }
            None => self.endpoint.call(ctx).await,
        }
    }
}

/// Ordered, immutable list of middlewares
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn builder() -> MiddlewareChainBuilder {
        MiddlewareChainBuilder::default()
    }

    /// Run `ctx` through every middleware and then `endpoint`
    pub async fn run(
        &self,
        ctx: &mut MiddlewareContext,
        endpoint: &dyn Endpoint,
    ) -> Result<Value, ToolError> {
        Next {
            remaining: &self.layers,
            endpoint,
        }
        .run(ctx)
        .await
    }

    /// Middleware names, outermost first
    pub fn names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|m| m.name()).collect()
    }
}

/// Builder fixing the chain order at server construction
#[derive(Default)]
pub struct MiddlewareChainBuilder {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChainBuilder {
    /// Append a middleware; earlier ones wrap later ones
    pub fn layer(mut self, middleware: impl Middleware + 'static) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Append only when present
    pub fn optional_layer(self, middleware: Option<impl Middleware + 'static>) -> Self {
        match middleware {
            Some(m) => self.layer(m),
            None => self,
        }
    }

    pub fn build(self) -> MiddlewareChain {
        MiddlewareChain {
            layers: self.layers,
        }
    }
}
