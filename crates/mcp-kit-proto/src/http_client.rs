use std::time::Duration;

use anyhow::Context as _;
use http::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::PROTOCOL_VERSION_LATEST;
use crate::jsonrpc::{JsonRpcId, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
use crate::server::McpConnection;
use crate::sse::first_sse_json;
use crate::types::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsParams,
    ListToolsResult,
};

#[derive(Debug, Clone)]
pub struct McpHttpClientOptions {
    pub endpoint: Url,
    pub client_name: String,
    pub client_version: String,
    pub timeout: Duration,
}

impl McpHttpClientOptions {
    pub fn new(endpoint: Url, client_name: &str, client_version: &str) -> Self {
        Self {
            endpoint,
            client_name: client_name.to_string(),
            client_version: client_version.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// MCP client over the streamable HTTP transport.
///
/// Tracks the session id handed out on `initialize` and performs the
/// lifecycle handshake lazily so callers can just issue tool methods.
pub struct McpHttpClient {
    http: reqwest::Client,
    endpoint: Url,
    client_name: String,
    client_version: String,
    protocol_version: String,
    session_id: Option<String>,
    ready: bool,
}

impl McpHttpClient {
    pub fn new(opts: McpHttpClientOptions) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(opts.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            endpoint: opts.endpoint,
            client_name: opts.client_name,
            client_version: opts.client_version,
            protocol_version: PROTOCOL_VERSION_LATEST.to_string(),
            session_id: None,
            ready: false,
        })
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Run the MCP handshake if it has not happened yet.
    pub async fn ensure_initialized(&mut self) -> anyhow::Result<()> {
        if self.ready {
            return Ok(());
        }
        self.initialize().await.map(|_| ())
    }

    pub async fn initialize(&mut self) -> anyhow::Result<InitializeResult> {
        if self.ready {
            anyhow::bail!("already initialized");
        }

        let params = InitializeParams::new_default(&self.client_name, &self.client_version);
        let req = JsonRpcRequest::new(
            JsonRpcId::String(Uuid::new_v4().to_string()),
            "initialize",
            Some(serde_json::to_value(params)?),
        );

        let (resp, session_id) = self.post_request(req).await?;
        if let Some(sid) = session_id {
            self.session_id = Some(sid);
        }

        let init: InitializeResult = decode_result(resp)?;
        self.protocol_version = init.protocol_version.clone();

        let notif = JsonRpcMessage::Notification(McpConnection::initialized_notification());
        self.post_notification(&notif).await?;
        self.ready = true;

        Ok(init)
    }

    pub async fn list_tools(&mut self, params: ListToolsParams) -> anyhow::Result<ListToolsResult> {
        self.ensure_initialized().await?;
        let req = JsonRpcRequest::new(
            JsonRpcId::String(Uuid::new_v4().to_string()),
            "tools/list",
            Some(serde_json::to_value(params)?),
        );
        let (resp, _) = self.post_request(req).await?;
        decode_result(resp)
    }

    pub async fn call_tool(&mut self, params: CallToolParams) -> anyhow::Result<CallToolResult> {
        self.ensure_initialized().await?;
        let req = JsonRpcRequest::new(
            JsonRpcId::String(Uuid::new_v4().to_string()),
            "tools/call",
            Some(serde_json::to_value(params)?),
        );
        let (resp, _) = self.post_request(req).await?;
        decode_result(resp)
    }

    fn post(&self, body: &impl serde::Serialize) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(self.endpoint.clone())
            .header("accept", "application/json, text/event-stream")
            .header("content-type", "application/json")
            .header("mcp-protocol-version", &self.protocol_version)
            .json(body);
        if let Some(sid) = &self.session_id {
            req = req.header("mcp-session-id", sid);
        }
        req
    }

    async fn post_notification(&self, msg: &JsonRpcMessage) -> anyhow::Result<()> {
        let resp = self.post(msg).send().await.context("send notification")?;
        if resp.status().is_success() {
            // 202 is the expected answer; a stray 200 body is tolerated.
            return Ok(());
        }
        anyhow::bail!("notification failed: {}", resp.status())
    }

    async fn post_request(
        &self,
        req_msg: JsonRpcRequest,
    ) -> anyhow::Result<(JsonRpcResponse, Option<String>)> {
        let resp = self.post(&req_msg).send().await.context("send request")?;
        let status = resp.status();
        let session_id = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        if status == StatusCode::ACCEPTED {
            anyhow::bail!("server answered a request with 202 (no response body)");
        }
        if !status.is_success() {
            anyhow::bail!("mcp http status {status}");
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = resp.text().await.context("read response body")?;
        debug!(content_type = %content_type, "mcp http response");

        let json = if content_type.starts_with("text/event-stream") {
            first_sse_json(&body)?
        } else {
            serde_json::from_str::<Value>(&body).context("parse response body as json")?
        };

        let msg: JsonRpcMessage = serde_json::from_value(json).context("parse json-rpc")?;
        let JsonRpcMessage::Response(r) = msg else {
            anyhow::bail!("expected a json-rpc response");
        };
        Ok((r, session_id))
    }
}

fn decode_result<T: serde::de::DeserializeOwned>(resp: JsonRpcResponse) -> anyhow::Result<T> {
    if resp.jsonrpc != "2.0" {
        anyhow::bail!("invalid jsonrpc version in response");
    }
    if let Some(err) = resp.error {
        anyhow::bail!("mcp json-rpc error {}: {}", err.code, err.message);
    }
    let value = resp.result.context("response carried no result")?;
    serde_json::from_value(value).context("decode result")
}
