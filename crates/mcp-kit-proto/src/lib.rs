//! Model Context Protocol (MCP) primitives shared across the workspace.
//!
//! Scope is deliberately narrow: the JSON-RPC message model, the lifecycle
//! state machine a server connection runs (`initialize` handshake plus
//! `tools/list` / `tools/call` routing), and a client for the streamable
//! HTTP transport. Everything a tool actually *does* lives behind the
//! [`McpHandler`] seam.

mod http_client;
mod jsonrpc;
mod server;
mod sse;
mod types;

pub use http_client::{McpHttpClient, McpHttpClientOptions};
pub use jsonrpc::{
    JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
};
pub use server::{McpConnection, McpHandler, McpServerConfig};
pub use sse::{first_sse_json, sse_data_events};
pub use types::{
    CallToolParams, CallToolResult, ClientInfo, ContentBlock, InitializeParams, InitializeResult,
    ListToolsParams, ListToolsResult, ServerInfo, Tool,
};

/// Newest protocol revision this implementation speaks.
pub const PROTOCOL_VERSION_LATEST: &str = "2025-06-18";

/// Older revision many deployed clients still request.
pub const PROTOCOL_VERSION_2024_11_05: &str = "2024-11-05";
