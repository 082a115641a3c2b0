use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use mcp_kit_proto::{
    CallToolParams, CallToolResult, JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcResponse,
    ListToolsParams, ListToolsResult, McpConnection, McpHandler, McpHttpClient,
    McpHttpClientOptions, McpServerConfig,
};

use crate::MCP_ENDPOINT_PATH;
use crate::signals::shutdown_signal;

/// Handler whose tool operations are served by the primary over HTTP.
///
/// The MCP handshake with the upstream happens lazily on the first tool
/// method, so constructing the bridge never blocks on the primary.
pub struct UpstreamToolHandler {
    client: Mutex<McpHttpClient>,
}

impl UpstreamToolHandler {
    pub fn new(main_port: u16, client_name: &str, client_version: &str) -> anyhow::Result<Self> {
        let endpoint = Url::parse(&format!(
            "http://127.0.0.1:{main_port}{MCP_ENDPOINT_PATH}"
        ))?;
        let client = McpHttpClient::new(McpHttpClientOptions::new(
            endpoint,
            client_name,
            client_version,
        ))?;
        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

#[async_trait]
impl McpHandler for UpstreamToolHandler {
    async fn list_tools(&self, params: ListToolsParams) -> anyhow::Result<ListToolsResult> {
        self.client.lock().await.list_tools(params).await
    }

    async fn call_tool(&self, params: CallToolParams) -> anyhow::Result<CallToolResult> {
        let name = params.name.clone();
        match self.client.lock().await.call_tool(params).await {
            Ok(res) => Ok(res),
            Err(e) => {
                debug!(tool = %name, error = %e, "upstream tool call failed");
                // Tool failures stay inside the session as error results.
                Ok(CallToolResult::error(format!("Proxy error: {e:#}")))
            }
        }
    }
}

/// Serve MCP over stdin/stdout until EOF or a shutdown signal.
///
/// Stdout carries nothing but JSON-RPC frames; diagnostics go to stderr via
/// tracing. Batch arrays are rejected, unparseable lines answered with
/// -32700, and neither ends the session.
pub async fn run_stdio_server(
    cfg: McpServerConfig,
    handler: Arc<dyn McpHandler>,
) -> anyhow::Result<()> {
    let mut conn = McpConnection::new(cfg, handler);

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    let mut stdout = tokio::io::stdout();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => {
                info!("stdio session interrupted by signal");
                return Ok(());
            }
        };
        let Some(line) = line else {
            // EOF: the client hung up.
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }

        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                let resp = JsonRpcResponse::err(JsonRpcId::Null, JsonRpcError::parse_error(e.to_string()));
                write_frame(&mut stdout, &resp).await?;
                continue;
            }
        };

        if value.is_array() {
            let resp = JsonRpcResponse::err(
                JsonRpcId::Null,
                JsonRpcError::invalid_request("batching not supported"),
            );
            write_frame(&mut stdout, &resp).await?;
            continue;
        }

        let msg: JsonRpcMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                let resp = JsonRpcResponse::err(
                    JsonRpcId::Null,
                    JsonRpcError::with_detail(-32600, "invalid request", e.to_string()),
                );
                write_frame(&mut stdout, &resp).await?;
                continue;
            }
        };

        if let Some(resp) = conn.handle_message(msg).await {
            write_frame(&mut stdout, &resp).await?;
        }
    }
}

/// Stdio façade for a secondary: every tool method is answered by the
/// primary on `main_port`.
pub async fn run_stdio_bridge(
    main_port: u16,
    cfg: McpServerConfig,
) -> anyhow::Result<()> {
    let name = cfg.server_info.name.clone();
    let version = cfg.server_info.version.clone();
    let handler: Arc<dyn McpHandler> =
        Arc::new(UpstreamToolHandler::new(main_port, &name, &version)?);
    info!(main_port, "stdio bridge delegating to primary");
    run_stdio_server(cfg, handler).await
}

async fn write_frame(
    stdout: &mut tokio::io::Stdout,
    resp: &JsonRpcResponse,
) -> anyhow::Result<()> {
    let out = serde_json::to_string(resp)?;
    stdout.write_all(out.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
