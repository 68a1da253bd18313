//! Pentest Collaboration MCP Server - Rust Implementation
//!
//! Exposes a pentest collaboration platform to AI assistants as MCP tools,
//! over stdio (default) or HTTP.

use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use pentest_mcp_server::collab::{CollabApi, HttpCollabClient};
use pentest_mcp_server::config::{Config, HttpArgs, ServerArgs};
use pentest_mcp_server::error::Result;
use pentest_mcp_server::mcp::http::HttpServer;
use pentest_mcp_server::mcp::server::McpServer;
use pentest_mcp_server::mcp::{tools, Dispatcher, Shutdown, ToolRegistry};
use pentest_mcp_server::observability::Metrics;

/// Pentest Collaboration MCP Server
#[derive(Parser)]
#[command(name = "pentest-mcp-server")]
#[command(author, version, about = "Pentest MCP Server - A Model Context Protocol server for pentest collaboration")]
struct Cli {
    #[command(flatten)]
    server: ServerArgs,

    /// Log output format (logs always go to stderr)
    #[arg(long, env = "PENTEST_MCP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve MCP over stdin/stdout (default)
    Stdio,

    /// Serve tools over HTTP
    Http(HttpArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    let command = cli.command.unwrap_or(Commands::Stdio);
    let config = match &command {
        Commands::Stdio => cli.server.into_config(None)?,
        Commands::Http(http) => cli.server.into_config(Some(http.clone()))?,
    };

    let shutdown = Shutdown::new();
    let dispatcher = build_dispatcher(&config, shutdown.clone())?;
    tokio::spawn(watch_signals(shutdown));

    match command {
        Commands::Stdio => {
            McpServer::new(dispatcher, config.drain_timeout)
                .run_stdio()
                .await?;
            tracing::info!("Server stopped");
            // The blocking stdin reader thread would otherwise keep the runtime alive
            std::process::exit(0);
        }
        Commands::Http(_) => HttpServer::new(dispatcher, config).run().await?,
    }

    tracing::info!("Server stopped");
    Ok(())
}

/// Initialize logging; stdout belongs to the stdio transport
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_dispatcher(config: &Config, shutdown: Shutdown) -> Result<Arc<Dispatcher>> {
    let metrics = Arc::new(Metrics::new()?);

    let api: Arc<dyn CollabApi> = Arc::new(HttpCollabClient::new(config)?);
    let mut registry = ToolRegistry::new();
    tools::register_all(&mut registry, api)?;

    tracing::info!(
        upstream = %config.upstream_url,
        max_concurrent_tools = config.max_concurrent_tools,
        tool_timeout_secs = config.tool_timeout.as_secs(),
        "Starting pentest MCP server"
    );

    Ok(Arc::new(Dispatcher::new(
        Arc::new(registry),
        config,
        metrics,
        shutdown,
    )))
}

/// Trigger shutdown on Ctrl-C or SIGTERM
async fn watch_signals(shutdown: Shutdown) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    shutdown.trigger();
}
