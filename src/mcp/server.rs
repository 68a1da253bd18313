//! Stdio transport
//!
//! One request per line in, exactly one response line out, in request order.
//! Each line is dispatched on its own task so a slow tool does not hold up
//! decoding of the next line; the join handles are queued in arrival order
//! and a single writer task awaits them one by one, which keeps responses
//! ordered while execution overlaps.
//!
//! Two framings share the channel: MCP JSON-RPC 2.0 messages (anything
//! carrying `jsonrpc` or `method`) and simple `{id, tool, arguments}` lines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SERVER_NAME;
use crate::error::{Result, ToolError};
use crate::mcp::dispatcher::{Dispatcher, Transport};
use crate::mcp::types::*;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Responses allowed to queue ahead of the writer
const PIPELINE_DEPTH: usize = 64;

/// A request task queued for the writer
struct Queued {
    task: JoinHandle<Option<String>>,

    /// Written instead when the task fails; `None` for notifications
    on_failure: Option<String>,
}

/// MCP server for the stdio transport
#[derive(Clone)]
pub struct McpServer {
    dispatcher: Arc<Dispatcher>,

    /// How long to wait for in-flight calls once shutdown starts
    drain_timeout: Duration,

    /// Whether the client sent `notifications/initialized`
    initialized: Arc<AtomicBool>,

    /// Cancellation handles of running `tools/call` requests, by request id
    pending: Arc<DashMap<String, CancellationToken>>,
}

impl McpServer {
    /// Create a new MCP server
    pub fn new(dispatcher: Arc<Dispatcher>, drain_timeout: Duration) -> Self {
        Self {
            dispatcher,
            drain_timeout,
            initialized: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Run the server on the process stdin / stdout
    pub async fn run_stdio(&self) -> Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve one connection until EOF or shutdown
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Queued>(PIPELINE_DEPTH);
        let writer_task = tokio::spawn(write_responses(rx, writer));

        let shutdown = self.dispatcher.shutdown().clone();
        let stop = shutdown.stop_token();
        let mut lines = BufReader::new(reader).lines();

        info!("Stdio transport ready");
        loop {
            let line = tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    info!("Shutdown requested, no longer reading requests");
                    break;
                }
                line = lines.next_line() => line?,
            };

            let Some(line) = line else {
                debug!("Input closed");
                break;
            };
            if line.trim().is_empty() {
                continue;
            }

            let on_failure = failure_response(&line);
            let server = self.clone();
            let task = tokio::spawn(async move { server.handle_line(&line).await });
            if tx.send(Queued { task, on_failure }).await.is_err() {
                warn!("Response writer stopped, closing connection");
                break;
            }
        }
        drop(tx);

        if shutdown.is_stopping() {
            shutdown.drain(self.drain_timeout).await;
        }

        match writer_task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Response writer task failed");
                Ok(())
            }
        }
    }

    /// Decode one line and produce its response line, if any
    async fn handle_line(&self, line: &str) -> Option<String> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "Malformed request line");
                // Best guess at the framing the client speaks
                if line.contains("\"jsonrpc\"") {
                    return encode(&JsonRpcResponse::error(
                        None,
                        JsonRpcError::parse_error(e.to_string()),
                    ));
                }
                return encode(&ToolResponse::new(
                    None,
                    Err(ToolError::invalid_request(format!("Malformed JSON: {}", e))),
                ));
            }
        };

        if value.get("jsonrpc").is_some() || value.get("method").is_some() {
            let response = self.handle_rpc(value).await?;
            encode(&response)
        } else {
            encode(&self.handle_tool_request(value).await)
        }
    }

    // ==================== Simple framing ====================

    async fn handle_tool_request(&self, value: Value) -> ToolResponse {
        let id = value
            .get("id")
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

        let request: ToolRequest = match serde_json::from_value(value) {
            Ok(request) => request,
            Err(e) => {
                return ToolResponse::new(
                    id,
                    Err(ToolError::invalid_request(format!("Invalid tool request: {}", e))),
                )
            }
        };

        let mut call = self
            .dispatcher
            .new_call(request.tool, request.arguments, Transport::Stdio);
        if let Some(id) = &request.id {
            call = call.with_id(id.to_correlation());
        }

        let result = self.dispatcher.dispatch(call).await;
        ToolResponse::new(request.id, result.outcome)
    }

    // ==================== JSON-RPC ====================

    async fn handle_rpc(&self, value: Value) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_value(value.clone()) {
            Ok(request) => request,
            Err(e) => {
                let id = value
                    .get("id")
                    .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
                return Some(JsonRpcResponse::error(
                    id,
                    JsonRpcError::invalid_request(e.to_string()),
                ));
            }
        };

        let method = request.method.clone();
        match method.as_str() {
            methods::INITIALIZE => Some(JsonRpcResponse::success(request.id, self.initialize_result())),
            methods::INITIALIZED => {
                self.initialized.store(true, Ordering::Release);
                debug!("Client initialized");
                None
            }
            methods::CANCELLED => {
                self.cancel_request(request.params.as_ref());
                None
            }
            _ if request.is_notification() => {
                debug!(method = %method, "Ignoring notification");
                None
            }
            methods::PING => Some(JsonRpcResponse::success(request.id, json!({}))),
            methods::LIST_TOOLS => Some(JsonRpcResponse::success(request.id, self.list_tools())),
            methods::CALL_TOOL => Some(self.call_tool(request).await),
            _ => Some(JsonRpcResponse::error(
                request.id,
                JsonRpcError::method_not_found(&method),
            )),
        }
    }

    fn initialize_result(&self) -> Value {
        let result = InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            server_info: ServerInfo {
                name: SERVER_NAME.to_string(),
                version: SERVER_VERSION.to_string(),
            },
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability::default()),
            },
        };
        serde_json::to_value(result).unwrap_or_default()
    }

    fn list_tools(&self) -> Value {
        let tools = self
            .dispatcher
            .registry()
            .list()
            .into_iter()
            .map(|summary| Tool {
                name: summary.name,
                description: Some(summary.description),
                input_schema: summary.schema,
            })
            .collect();
        serde_json::to_value(ListToolsResult { tools }).unwrap_or_default()
    }

    async fn call_tool(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        let params: CallToolParams = match request.params.map(serde_json::from_value) {
            Some(Ok(params)) => params,
            Some(Err(e)) => {
                return JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::invalid_params(format!("Invalid tool parameters: {}", e)),
                )
            }
            None => {
                return JsonRpcResponse::error(
                    request.id,
                    JsonRpcError::invalid_params("Missing tool parameters"),
                )
            }
        };

        let mut call = self
            .dispatcher
            .new_call(params.name, params.arguments, Transport::Stdio);
        let correlation = request.id.as_ref().map(RequestId::to_correlation);
        if let Some(id) = &correlation {
            call = call.with_id(id.clone());
            self.pending.insert(id.clone(), call.cancellation.clone());
        }

        let result = self.dispatcher.dispatch(call).await;

        if let Some(id) = &correlation {
            self.pending.remove(id);
        }

        let content = CallToolResult::from_outcome(&result.outcome);
        match serde_json::to_value(content) {
            Ok(value) => JsonRpcResponse::success(request.id, value),
            Err(e) => JsonRpcResponse::error(
                request.id,
                JsonRpcError::invalid_params(format!("Unserializable tool result: {}", e)),
            ),
        }
    }

    /// Handle `notifications/cancelled` for a running `tools/call`
    fn cancel_request(&self, params: Option<&Value>) {
        let Some(id) = params
            .and_then(|p| p.get("requestId"))
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok())
        else {
            return;
        };

        if let Some((_, token)) = self.pending.remove(&id.to_correlation()) {
            info!(request_id = %id.to_correlation(), "Client cancelled tool call");
            token.cancel();
        }
    }

    /// Whether the client completed the MCP handshake
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

/// Await queued responses in order and write them out
async fn write_responses<W>(mut rx: mpsc::Receiver<Queued>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(queued) = rx.recv().await {
        let line = match queued.task.await {
            Ok(Some(line)) => line,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Request task failed");
                match queued.on_failure {
                    Some(line) => line,
                    None => continue,
                }
            }
        };

        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    writer.shutdown().await?;
    Ok(())
}

/// Response reporting an internal failure for `line`, in its framing
fn failure_response(line: &str) -> Option<String> {
    let message = "Request handler failed";
    let value: Value = serde_json::from_str(line).unwrap_or(Value::Null);
    let id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

    if value.get("jsonrpc").is_some() || value.get("method").is_some() {
        if value.get("id").is_none() {
            return None;
        }
        return encode(&JsonRpcResponse::error(id, JsonRpcError::internal_error(message)));
    }
    encode(&ToolResponse::new(id, Err(ToolError::internal(message))))
}

fn encode<T: Serialize>(response: &T) -> Option<String> {
    match serde_json::to_string(response) {
        Ok(line) => Some(line),
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::mcp::registry::{handler_fn, ToolDefinition, ToolRegistry};
    use crate::mcp::schema::Schema;
    use crate::mcp::shutdown::Shutdown;
    use crate::observability::Metrics;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt};

    fn server() -> McpServer {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDefinition::new(
                "echo",
                "Echo",
                Schema::object().required_property("message", Schema::string()),
                handler_fn(|args, _ctx| async move { Ok(args) }),
            ).unwrap())
            .unwrap();
        registry
            .register(ToolDefinition::new(
                "sleep",
                "Sleep then echo",
                Schema::object().required_property("ms", Schema::integer()),
                handler_fn(|args, _ctx| async move {
                    let ms = args["ms"].as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(json!({"slept": ms}))
                }),
            ).unwrap())
            .unwrap();

        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            &Config::default(),
            Arc::new(Metrics::new().unwrap()),
            Shutdown::new(),
        );
        McpServer::new(Arc::new(dispatcher), Duration::from_secs(1))
    }

    /// Feed `input` to a fresh server and collect its response lines
    async fn exchange(server: McpServer, input: &str) -> Vec<Value> {
        let (client, transport) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(transport);
        let serving = tokio::spawn(async move { server.serve(server_read, server_write).await });

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(input.as_bytes()).await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut lines = tokio::io::BufReader::new(client_read).lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        serving.await.unwrap().unwrap();
        out
    }

    #[tokio::test]
    async fn test_simple_framing() {
        let out = exchange(
            server(),
            "{\"id\":1,\"tool\":\"echo\",\"arguments\":{\"message\":\"hi\"}}\n",
        )
        .await;
        assert_eq!(out, vec![json!({"id": 1, "result": {"message": "hi"}})]);
    }

    #[tokio::test]
    async fn test_responses_keep_request_order() {
        let input = concat!(
            "{\"id\":\"slow\",\"tool\":\"sleep\",\"arguments\":{\"ms\":80}}\n",
            "{\"id\":\"fast\",\"tool\":\"sleep\",\"arguments\":{\"ms\":0}}\n",
        );
        let out = exchange(server(), input).await;
        let ids: Vec<_> = out.iter().map(|v| v["id"].clone()).collect();
        assert_eq!(ids, vec![json!("slow"), json!("fast")]);
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_close_channel() {
        let input = concat!(
            "{not json\n",
            "\n",
            "{\"id\":2,\"tool\":\"echo\",\"arguments\":{\"message\":\"still here\"}}\n",
        );
        let out = exchange(server(), input).await;
        assert_eq!(out.len(), 2);
        assert!(out[0]["id"].is_null());
        assert_eq!(out[0]["error"]["kind"], "invalid_request");
        assert_eq!(out[1]["result"]["message"], "still here");
    }

    fn exploding() -> JoinHandle<Option<String>> {
        tokio::spawn(async {
            if true {
                panic!("request task exploded");
            }
            None
        })
    }

    #[tokio::test]
    async fn test_failed_request_task_still_answers() {
        let (tx, rx) = mpsc::channel(4);
        let (client, transport) = duplex(4096);
        let writer = tokio::spawn(write_responses(rx, transport));

        let lines = [
            "{\"id\":7,\"tool\":\"echo\",\"arguments\":{}}",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}",
            "{\"jsonrpc\":\"2.0\",\"id\":8,\"method\":\"tools/call\"}",
        ];
        for line in lines {
            let queued = Queued {
                task: exploding(),
                on_failure: failure_response(line),
            };
            tx.send(queued).await.unwrap();
        }
        drop(tx);
        writer.await.unwrap().unwrap();

        let mut reader = tokio::io::BufReader::new(client).lines();
        let mut out: Vec<Value> = Vec::new();
        while let Some(line) = reader.next_line().await.unwrap() {
            out.push(serde_json::from_str(&line).unwrap());
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["id"], 7);
        assert_eq!(out[0]["error"]["kind"], "internal");
        assert_eq!(out[1]["id"], 8);
        assert_eq!(out[1]["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn test_errors_are_structured() {
        let input = concat!(
            "{\"id\":1,\"tool\":\"missing\"}\n",
            "{\"id\":2,\"tool\":\"echo\",\"arguments\":{}}\n",
        );
        let out = exchange(server(), input).await;
        assert_eq!(out[0]["error"]["kind"], "unknown_tool");
        assert_eq!(out[1]["error"]["kind"], "validation");
        assert_eq!(out[1]["error"]["fields"][0]["field"], "message");
    }

    #[tokio::test]
    async fn test_json_rpc_session() {
        let server = server();
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{}}\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/list\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"tools/call\",\"params\":{\"name\":\"echo\",\"arguments\":{\"message\":\"hi\"}}}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":4,\"method\":\"tools/call\",\"params\":{\"name\":\"nope\"}}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":5,\"method\":\"bogus\"}\n",
        );
        let out = exchange(server.clone(), input).await;

        assert_eq!(out.len(), 5);
        assert_eq!(out[0]["result"]["serverInfo"]["name"], SERVER_NAME);
        assert_eq!(out[1]["result"]["tools"][0]["name"], "echo");
        assert!(out[1]["result"]["tools"][0]["inputSchema"].is_object());
        assert_eq!(out[2]["result"]["structuredContent"]["message"], "hi");
        assert_eq!(out[3]["result"]["isError"], true);
        assert_eq!(out[4]["error"]["code"], -32601);
        assert!(server.is_initialized());
    }

    #[tokio::test]
    async fn test_shutdown_stops_reading_and_drains() {
        let server = server();
        let shutdown = server.dispatcher.shutdown().clone();

        let (client, transport) = duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(transport);
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(server_read, server_write).await })
        };

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"{\"id\":1,\"tool\":\"sleep\",\"arguments\":{\"ms\":50}}\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger();

        let mut lines = tokio::io::BufReader::new(client_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(response["result"]["slept"], 50);

        serving.await.unwrap().unwrap();
        assert!(lines.next_line().await.unwrap().is_none());
    }
}
