//! Metrics for tool execution and the HTTP surface
//!
//! Every collector lives in a registry owned by the [`Metrics`] value. The
//! handle is created once in `main` and passed to the dispatcher and the
//! transports; there is no process-wide metrics state.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::error::ErrorKind;

const NAMESPACE: &str = "pentest_mcp";

/// Outcome label for a finished tool call
pub const OUTCOME_SUCCESS: &str = "success";
pub const OUTCOME_ERROR: &str = "error";

/// Counters, histograms and gauges emitted by the server
pub struct Metrics {
    registry: Registry,
    tool_executions: IntCounterVec,
    tool_errors: IntCounterVec,
    tool_duration: HistogramVec,
    http_duration: HistogramVec,
    rate_limited: IntCounterVec,
    active_tools: IntGauge,
}

impl Metrics {
    /// Create and register all collectors
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tool_executions = IntCounterVec::new(
            Opts::new("tool_executions_total", "Tool calls that reached execution")
                .namespace(NAMESPACE),
            &["tool", "outcome"],
        )?;
        let tool_errors = IntCounterVec::new(
            Opts::new("tool_errors_total", "Failed tool calls by error kind").namespace(NAMESPACE),
            &["tool", "kind"],
        )?;
        let tool_duration = HistogramVec::new(
            HistogramOpts::new("tool_duration_seconds", "Tool call latency")
                .namespace(NAMESPACE)
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["tool"],
        )?;
        let http_duration = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request latency")
                .namespace(NAMESPACE),
            &["method", "route", "status"],
        )?;
        let rate_limited = IntCounterVec::new(
            Opts::new("rate_limited_total", "Calls rejected by rate limiting").namespace(NAMESPACE),
            &["scope"],
        )?;
        let active_tools = IntGauge::with_opts(
            Opts::new("active_tool_calls", "Tool calls currently holding an execution slot")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(tool_executions.clone()))?;
        registry.register(Box::new(tool_errors.clone()))?;
        registry.register(Box::new(tool_duration.clone()))?;
        registry.register(Box::new(http_duration.clone()))?;
        registry.register(Box::new(rate_limited.clone()))?;
        registry.register(Box::new(active_tools.clone()))?;

        Ok(Self {
            registry,
            tool_executions,
            tool_errors,
            tool_duration,
            http_duration,
            rate_limited,
            active_tools,
        })
    }

    /// Record a call that went through the middleware chain
    pub fn record_tool_call(&self, tool: &str, outcome: Result<(), ErrorKind>, elapsed: Duration) {
        let label = if outcome.is_ok() { OUTCOME_SUCCESS } else { OUTCOME_ERROR };
        self.tool_executions.with_label_values(&[tool, label]).inc();
        self.tool_duration
            .with_label_values(&[tool])
            .observe(elapsed.as_secs_f64());
        if let Err(kind) = outcome {
            self.record_tool_error(tool, kind);
        }
    }

    /// Record a failure, including ones rejected before execution
    pub fn record_tool_error(&self, tool: &str, kind: ErrorKind) {
        self.tool_errors
            .with_label_values(&[tool, kind.as_str()])
            .inc();
    }

    pub fn record_http_request(&self, method: &str, route: &str, status: u16, elapsed: Duration) {
        self.http_duration
            .with_label_values(&[method, route, &status.to_string()])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_rate_limited(&self, scope: &str) {
        self.rate_limited.with_label_values(&[scope]).inc();
    }

    pub fn slot_acquired(&self) {
        self.active_tools.inc();
    }

    pub fn slot_released(&self) {
        self.active_tools.dec();
    }

    /// Calls recorded for `tool` with the given outcome label
    pub fn tool_executions(&self, tool: &str, outcome: &str) -> u64 {
        self.tool_executions
            .with_label_values(&[tool, outcome])
            .get()
    }

    pub fn tool_errors(&self, tool: &str, kind: ErrorKind) -> u64 {
        self.tool_errors
            .with_label_values(&[tool, kind.as_str()])
            .get()
    }

    pub fn rate_limited(&self, scope: &str) -> u64 {
        self.rate_limited.with_label_values(&[scope]).get()
    }

    pub fn active_tools(&self) -> i64 {
        self.active_tools.get()
    }

    /// Prometheus text exposition of every collector
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
