//! Configuration management for the Pentest MCP Server
//!
//! Settings come from command line flags with `PENTEST_MCP_*` environment
//! variable fallbacks. The resulting [`Config`] is consumed by the dispatcher
//! and transports; nothing reads the environment after startup.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Args, ValueEnum};

use crate::error::{ConfigError, Result};

/// Server name reported by `initialize` and `/info`
pub const SERVER_NAME: &str = "pentest-collab";

/// Longest accepted timeout, backoff or window setting
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Behaviour when every tool execution slot is taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LimiterPolicy {
    /// Queue until a slot frees or the call deadline passes
    Wait,
    /// Fail immediately with `capacity_exceeded`
    Reject,
}

/// Fixed-window request quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Requests allowed per window
    pub max_requests: u32,

    /// Window length
    pub window: Duration,
}

/// Configuration for the Pentest MCP Server
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the collaboration framework API (e.g. `https://reports.example.com/api/v1`)
    pub upstream_url: String,

    /// API token sent to the collaboration framework
    pub upstream_token: Option<String>,

    /// Timeout for a single upstream HTTP request
    pub upstream_timeout: Duration,

    /// Retries for transient upstream failures
    pub upstream_retries: u32,

    /// First retry backoff; doubles on each attempt
    pub upstream_backoff: Duration,

    /// Maximum simultaneously executing tool calls
    pub max_concurrent_tools: usize,

    /// What to do when no execution slot is free
    pub limiter_policy: LimiterPolicy,

    /// Deadline for one tool call, from arrival to result
    pub tool_timeout: Duration,

    /// Quota per client identity
    pub client_rate_limit: Option<RateLimit>,

    /// Quota per tool name
    pub tool_rate_limit: Option<RateLimit>,

    /// Whether HTTP callers must present a bearer token
    pub auth_required: bool,

    /// Expected bearer token
    pub auth_token: Option<String>,

    /// HTTP listen address
    pub bind: SocketAddr,

    /// Origins allowed by CORS; `*` allows any
    pub cors_origins: Vec<String>,

    /// How long shutdown waits for in-flight calls
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_url: "http://127.0.0.1:8000/api/v1".to_string(),
            upstream_token: None,
            upstream_timeout: Duration::from_secs(30),
            upstream_retries: 2,
            upstream_backoff: Duration::from_millis(200),
            max_concurrent_tools: 8,
            limiter_policy: LimiterPolicy::Wait,
            tool_timeout: Duration::from_secs(60),
            client_rate_limit: None,
            tool_rate_limit: None,
            auth_required: false,
            auth_token: None,
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            cors_origins: vec!["*".to_string()],
            drain_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Check settings that would otherwise fail at request time
    pub fn validate(&self) -> Result<()> {
        if self.upstream_url.trim().is_empty() {
            return Err(ConfigError::MissingSetting {
                name: "upstream_url".to_string(),
            }
            .into());
        }

        if self.max_concurrent_tools == 0 {
            return Err(invalid("max_concurrent_tools must be at least 1"));
        }

        if self.tool_timeout.is_zero() {
            return Err(invalid("tool_timeout must be greater than zero"));
        }

        let durations = [
            ("tool_timeout", self.tool_timeout),
            ("upstream_timeout", self.upstream_timeout),
            ("upstream_backoff", self.upstream_backoff),
            ("drain_timeout", self.drain_timeout),
        ];
        for (name, value) in durations {
            if value > MAX_DURATION {
                return Err(invalid(&format!(
                    "{} must be at most {} seconds",
                    name,
                    MAX_DURATION.as_secs()
                )));
            }
        }

        if self.auth_required
            && self
                .auth_token
                .as_deref()
                .map_or(true, |t| t.trim().is_empty())
        {
            return Err(ConfigError::MissingSetting {
                name: "auth_token".to_string(),
            }
            .into());
        }

        for limit in [self.client_rate_limit, self.tool_rate_limit].into_iter().flatten() {
            if limit.window.is_zero() {
                return Err(invalid("rate limit window must be greater than zero"));
            }
            if limit.window > MAX_DURATION {
                return Err(invalid("rate limit window is too long"));
            }
        }

        Ok(())
    }
}

fn invalid(message: &str) -> crate::error::PentestMcpError {
    ConfigError::InvalidConfig {
        message: message.to_string(),
    }
    .into()
}

/// Command line / environment settings shared by every transport
#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Collaboration framework API base URL
    #[arg(long, env = "PENTEST_MCP_UPSTREAM_URL", default_value = "http://127.0.0.1:8000/api/v1")]
    pub upstream_url: String,

    /// Collaboration framework API token
    #[arg(long, env = "PENTEST_MCP_UPSTREAM_TOKEN", hide_env_values = true)]
    pub upstream_token: Option<String>,

    /// Upstream request timeout in seconds
    #[arg(long, env = "PENTEST_MCP_UPSTREAM_TIMEOUT", default_value_t = 30)]
    pub upstream_timeout_secs: u64,

    /// Retries for transient upstream failures
    #[arg(long, env = "PENTEST_MCP_UPSTREAM_RETRIES", default_value_t = 2)]
    pub upstream_retries: u32,

    /// Maximum concurrently executing tools
    #[arg(long, env = "PENTEST_MCP_MAX_CONCURRENT_TOOLS", default_value_t = 8)]
    pub max_concurrent_tools: usize,

    /// Behaviour when all execution slots are busy
    #[arg(long, env = "PENTEST_MCP_LIMITER_POLICY", value_enum, default_value_t = LimiterPolicy::Wait)]
    pub limiter_policy: LimiterPolicy,

    /// Tool execution timeout in seconds
    #[arg(long, env = "PENTEST_MCP_TOOL_TIMEOUT", default_value_t = 60)]
    pub tool_timeout_secs: u64,

    /// Requests per window allowed for one client
    #[arg(long, env = "PENTEST_MCP_CLIENT_RATE_LIMIT")]
    pub client_rate_limit: Option<u32>,

    /// Requests per window allowed for one tool
    #[arg(long, env = "PENTEST_MCP_TOOL_RATE_LIMIT")]
    pub tool_rate_limit: Option<u32>,

    /// Rate limit window in seconds
    #[arg(long, env = "PENTEST_MCP_RATE_LIMIT_WINDOW", default_value_t = 60)]
    pub rate_limit_window_secs: u64,

    /// Seconds to wait for in-flight calls on shutdown
    #[arg(long, env = "PENTEST_MCP_DRAIN_TIMEOUT", default_value_t = 10)]
    pub drain_timeout_secs: u64,
}

/// Settings only meaningful for the HTTP transport
#[derive(Debug, Clone, Args)]
pub struct HttpArgs {
    /// Listen address
    #[arg(long, env = "PENTEST_MCP_BIND", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// Require `Authorization: Bearer <token>` on tool endpoints
    #[arg(long, env = "PENTEST_MCP_AUTH_REQUIRED", default_value_t = false)]
    pub auth_required: bool,

    /// Bearer token expected from clients
    #[arg(long, env = "PENTEST_MCP_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Comma separated CORS origins (`*` for any)
    #[arg(long, env = "PENTEST_MCP_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
    pub cors_origins: Vec<String>,
}

impl ServerArgs {
    /// Build a configuration, optionally with HTTP settings
    pub fn into_config(self, http: Option<HttpArgs>) -> Result<Config> {
        let window = Duration::from_secs(self.rate_limit_window_secs);
        let quota = |max: Option<u32>| {
            max.map(|max_requests| RateLimit {
                max_requests,
                window,
            })
        };

        let mut config = Config {
            upstream_url: self.upstream_url,
            upstream_token: self.upstream_token,
            upstream_timeout: Duration::from_secs(self.upstream_timeout_secs),
            upstream_retries: self.upstream_retries,
            max_concurrent_tools: self.max_concurrent_tools,
            limiter_policy: self.limiter_policy,
            tool_timeout: Duration::from_secs(self.tool_timeout_secs),
            client_rate_limit: quota(self.client_rate_limit),
            tool_rate_limit: quota(self.tool_rate_limit),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            ..Config::default()
        };

        if let Some(http) = http {
            config.bind = http.bind;
            config.auth_required = http.auth_required;
            config.auth_token = http.auth_token;
            config.cors_origins = http.cors_origins;
        }

        config.validate()?;
        Ok(config)
    }
}
