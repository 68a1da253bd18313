//! HTTP transport
//!
//! Stateless REST surface over the shared dispatcher:
//!
//! - `GET /health`, `GET /info`, `GET /metrics` are public
//! - `GET /tools` and `POST /tools/{name}` require a bearer token when auth
//!   is enabled
//!
//! Layers, outermost first: request tracing, HTTP metrics, CORS, then the
//! authentication route layer. CORS answers preflight requests itself so they
//! never reach authentication, and rejected requests are still traced and
//! counted.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, MatchedPath, Path, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

use crate::config::{Config, SERVER_NAME};
use crate::error::{ErrorKind, Result, ToolError};
use crate::mcp::dispatcher::{Dispatcher, Transport};
use crate::mcp::middleware::BearerAuth;
use crate::mcp::types::MCP_VERSION;
use crate::observability::Metrics;

/// Largest accepted request body
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Header carrying the correlation id in both directions
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Time allowed for connections to flush responses after draining
const CONNECTION_GRACE: Duration = Duration::from_secs(1);

/// Error kind to HTTP status; kinds missing here map to 500
const STATUS_TABLE: &[(ErrorKind, StatusCode)] = &[
    (ErrorKind::UnknownTool, StatusCode::NOT_FOUND),
    (ErrorKind::Validation, StatusCode::UNPROCESSABLE_ENTITY),
    (ErrorKind::InvalidRequest, StatusCode::BAD_REQUEST),
    (ErrorKind::Unauthenticated, StatusCode::UNAUTHORIZED),
    (ErrorKind::RateLimited, StatusCode::TOO_MANY_REQUESTS),
    (ErrorKind::CapacityExceeded, StatusCode::SERVICE_UNAVAILABLE),
    (ErrorKind::Cancelled, StatusCode::SERVICE_UNAVAILABLE),
    (ErrorKind::Timeout, StatusCode::GATEWAY_TIMEOUT),
    (ErrorKind::Upstream, StatusCode::BAD_GATEWAY),
    (ErrorKind::Internal, StatusCode::INTERNAL_SERVER_ERROR),
];

/// HTTP status for a failed call
pub fn status_for(kind: ErrorKind) -> StatusCode {
    STATUS_TABLE
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, status)| *status)
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    dispatcher: Arc<Dispatcher>,
    auth: BearerAuth,
    started: Instant,
}

impl AppState {
    fn metrics(&self) -> &Arc<Metrics> {
        self.dispatcher.metrics()
    }
}

/// A tool error rendered as an HTTP response
struct ApiError {
    error: ToolError,
    request_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(self.error.kind);
        let mut headers = HeaderMap::new();

        if let Some(secs) = self.error.retry_after_secs {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        if self.error.kind == ErrorKind::Unauthenticated {
            headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        insert_request_id(&mut headers, self.request_id.as_deref());

        (status, headers, Json(json!({ "error": self.error }))).into_response()
    }
}

fn insert_request_id(headers: &mut HeaderMap, request_id: Option<&str>) {
    if let Some(value) = request_id.and_then(|id| HeaderValue::from_str(id).ok()) {
        headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}

// ==================== Router ====================

/// Build the HTTP application
pub fn router(dispatcher: Arc<Dispatcher>, config: &Config) -> Router {
    let state = AppState {
        dispatcher,
        auth: BearerAuth::from_config(config),
        started: Instant::now(),
    };
    if state.auth.is_required() {
        info!("Bearer authentication enabled for tool endpoints");
    }

    let tools = Router::new()
        .route("/tools", get(list_tools))
        .route("/tools/:name", post(call_tool))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/info", get(server_info))
        .route("/metrics", get(render_metrics))
        .merge(tools)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors_layer(&config.cors_origins))
        .layer(middleware::from_fn_with_state(state.clone(), track_http))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
        .expose_headers([header::RETRY_AFTER, HeaderName::from_static(REQUEST_ID_HEADER)]);

    if origins.is_empty() || origins.iter().any(|o| o.trim() == "*") {
        return cors.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    info!(origins = ?origins, "CORS restricted to configured origins");
    cors.allow_origin(AllowOrigin::list(allowed))
}

// ==================== Layers ====================

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }

    match state.auth.authenticate(request.headers()) {
        Ok(()) => next.run(request).await,
        Err(error) => {
            warn!(path = %request.uri().path(), reason = %error.message, "Rejected unauthenticated request");
            let request_id = header_request_id(request.headers());
            ApiError { error, request_id }.into_response()
        }
    }
}

async fn track_http(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    state.metrics().record_http_request(
        &method,
        &route,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

// ==================== Handlers ====================

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn server_info(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": MCP_VERSION,
        "tools": state.dispatcher.registry().len(),
        "auth_required": state.auth.is_required(),
        "uptime_secs": state.started.elapsed().as_secs(),
        "shutting_down": state.dispatcher.shutdown().is_stopping(),
    }))
}

async fn render_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics().render(),
    )
}

async fn list_tools(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "tools": state.dispatcher.registry().list() }))
}

async fn call_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id =
        header_request_id(&headers).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let arguments = match parse_arguments(&body) {
        Ok(arguments) => arguments,
        Err(error) => {
            return ApiError {
                error,
                request_id: Some(request_id),
            }
            .into_response()
        }
    };

    let client = connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string());

    let call = state
        .dispatcher
        .new_call(name, arguments, Transport::Http)
        .with_id(request_id.clone())
        .with_client(client);

    match state.dispatcher.dispatch(call).await.outcome {
        Ok(result) => {
            let mut headers = HeaderMap::new();
            insert_request_id(&mut headers, Some(&request_id));
            (StatusCode::OK, headers, Json(json!({ "result": result }))).into_response()
        }
        Err(error) => ApiError {
            error,
            request_id: Some(request_id),
        }
        .into_response(),
    }
}

/// Empty bodies mean "no arguments"
fn parse_arguments(body: &[u8]) -> std::result::Result<Value, ToolError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body)
        .map_err(|e| ToolError::invalid_request(format!("Request body is not valid JSON: {}", e)))
}

fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
}

// ==================== Server ====================

/// HTTP transport bound to the configured address
pub struct HttpServer {
    dispatcher: Arc<Dispatcher>,
    config: Config,
}

impl HttpServer {
    pub fn new(dispatcher: Arc<Dispatcher>, config: Config) -> Self {
        Self { dispatcher, config }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown
    ///
    /// Once shutdown is triggered no new connections are accepted, in-flight
    /// calls get up to the drain timeout, and connections still open after
    /// that are closed.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let shutdown = self.dispatcher.shutdown().clone();
        let app = router(self.dispatcher.clone(), &self.config);
        info!(addr = %listener.local_addr()?, "HTTP transport listening");

        let stop = shutdown.stop_token();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .into_future();
        tokio::pin!(server);

        let stop = shutdown.stop_token();
        tokio::select! {
            result = &mut server => {
                result?;
                return Ok(());
            }
            _ = stop.cancelled() => {}
        }

        shutdown.drain(self.config.drain_timeout).await;
        match tokio::time::timeout(CONNECTION_GRACE, server).await {
            Ok(result) => result?,
            Err(_) => warn!("Closing connections that outlived the drain timeout"),
        }
        info!("HTTP transport stopped");
        Ok(())
    }
}
