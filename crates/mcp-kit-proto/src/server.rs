use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
use crate::types::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ListToolsParams,
    ListToolsResult, ServerInfo,
};
use crate::{PROTOCOL_VERSION_2024_11_05, PROTOCOL_VERSION_LATEST};

/// The opaque request dispatcher the coordination core hands work to.
///
/// Implementations decide what the tools are; the connection machinery only
/// routes `tools/list` and `tools/call` at them.
#[async_trait]
pub trait McpHandler: Send + Sync {
    async fn list_tools(&self, params: ListToolsParams) -> anyhow::Result<ListToolsResult>;
    async fn call_tool(&self, params: CallToolParams) -> anyhow::Result<CallToolResult>;
}

#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub server_info: ServerInfo,
    pub instructions: Option<String>,
    pub capabilities: Value,
    pub supported_protocol_versions: Vec<String>,
}

impl McpServerConfig {
    pub fn for_binary(name: &str, version: &str) -> Self {
        Self {
            server_info: ServerInfo {
                name: name.to_string(),
                version: version.to_string(),
            },
            instructions: None,
            capabilities: serde_json::json!({
                "tools": { "listChanged": false }
            }),
            supported_protocol_versions: vec![
                PROTOCOL_VERSION_LATEST.to_string(),
                PROTOCOL_VERSION_2024_11_05.to_string(),
            ],
        }
    }

    /// Echo the requested revision when we support it, otherwise answer
    /// with the newest one we do.
    fn negotiate(&self, requested: &str) -> String {
        if self
            .supported_protocol_versions
            .iter()
            .any(|v| v == requested)
        {
            requested.to_string()
        } else {
            PROTOCOL_VERSION_LATEST.to_string()
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Phase {
    Fresh,
    Initializing,
    Ready,
}

/// Per-connection MCP lifecycle state machine.
///
/// Enforces `initialize` -> `notifications/initialized` -> ready ordering
/// and routes tool methods at the handler once ready.
pub struct McpConnection {
    cfg: McpServerConfig,
    handler: Arc<dyn McpHandler>,
    phase: Phase,
    protocol_version: Option<String>,
}

impl McpConnection {
    pub fn new(cfg: McpServerConfig, handler: Arc<dyn McpHandler>) -> Self {
        Self {
            cfg,
            handler,
            phase: Phase::Fresh,
            protocol_version: None,
        }
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Handle one message. Requests produce a response; notifications and
    /// stray responses produce `None`.
    pub async fn handle_message(&mut self, msg: JsonRpcMessage) -> Option<JsonRpcResponse> {
        match msg {
            JsonRpcMessage::Request(req) => Some(self.handle_request(req).await),
            JsonRpcMessage::Notification(n) => {
                self.handle_notification(&n);
                None
            }
            JsonRpcMessage::Response(_) => None,
        }
    }

    async fn handle_request(&mut self, req: JsonRpcRequest) -> JsonRpcResponse {
        if req.jsonrpc != "2.0" {
            return JsonRpcResponse::err(
                req.id,
                JsonRpcError::invalid_request("invalid jsonrpc version"),
            );
        }

        match req.method.as_str() {
            "initialize" => self.handle_initialize(req),
            // Ping is valid in every phase.
            "ping" => JsonRpcResponse::ok(req.id, serde_json::json!({})),
            "tools/list" => {
                if self.phase != Phase::Ready {
                    return JsonRpcResponse::err(req.id, JsonRpcError::not_initialized());
                }
                let params = match decode_params::<ListToolsParams>(req.params) {
                    Ok(p) => p,
                    Err(detail) => {
                        return JsonRpcResponse::err(req.id, JsonRpcError::invalid_params(detail));
                    }
                };
                match self.handler.list_tools(params).await {
                    Ok(res) => {
                        JsonRpcResponse::ok(req.id, serde_json::to_value(res).unwrap_or(Value::Null))
                    }
                    Err(e) => JsonRpcResponse::err(req.id, JsonRpcError::internal(e.to_string())),
                }
            }
            "tools/call" => {
                if self.phase != Phase::Ready {
                    return JsonRpcResponse::err(req.id, JsonRpcError::not_initialized());
                }
                let Some(raw) = req.params else {
                    return JsonRpcResponse::err(
                        req.id,
                        JsonRpcError::invalid_params("missing params"),
                    );
                };
                let params = match serde_json::from_value::<CallToolParams>(raw) {
                    Ok(p) => p,
                    Err(e) => {
                        return JsonRpcResponse::err(
                            req.id,
                            JsonRpcError::invalid_params(e.to_string()),
                        );
                    }
                };
                match self.handler.call_tool(params).await {
                    Ok(res) => {
                        JsonRpcResponse::ok(req.id, serde_json::to_value(res).unwrap_or(Value::Null))
                    }
                    Err(e) => JsonRpcResponse::err(req.id, JsonRpcError::internal(e.to_string())),
                }
            }
            _ => JsonRpcResponse::err(req.id, JsonRpcError::method_not_found()),
        }
    }

    fn handle_initialize(&mut self, req: JsonRpcRequest) -> JsonRpcResponse {
        if self.phase != Phase::Fresh {
            return JsonRpcResponse::err(
                req.id,
                JsonRpcError::invalid_request("already initialized"),
            );
        }
        let Some(raw) = req.params else {
            return JsonRpcResponse::err(req.id, JsonRpcError::invalid_params("missing params"));
        };
        let init: InitializeParams = match serde_json::from_value(raw) {
            Ok(p) => p,
            Err(e) => {
                return JsonRpcResponse::err(req.id, JsonRpcError::invalid_params(e.to_string()));
            }
        };

        let negotiated = self.cfg.negotiate(&init.protocol_version);
        self.protocol_version = Some(negotiated.clone());
        self.phase = Phase::Initializing;

        let result = InitializeResult {
            protocol_version: negotiated,
            capabilities: self.cfg.capabilities.clone(),
            server_info: self.cfg.server_info.clone(),
            instructions: self.cfg.instructions.clone(),
        };
        JsonRpcResponse::ok(req.id, serde_json::to_value(result).unwrap_or(Value::Null))
    }

    fn handle_notification(&mut self, n: &JsonRpcNotification) {
        if n.jsonrpc != "2.0" {
            return;
        }
        if n.method == "notifications/initialized" && self.phase == Phase::Initializing {
            self.phase = Phase::Ready;
        }
    }

    pub fn initialized_notification() -> JsonRpcNotification {
        JsonRpcNotification::new("notifications/initialized", None)
    }
}

fn decode_params<T: serde::de::DeserializeOwned + Default>(
    params: Option<Value>,
) -> Result<T, String> {
    match params {
        Some(v) => serde_json::from_value(v).map_err(|e| e.to_string()),
        None => Ok(T::default()),
    }
}
