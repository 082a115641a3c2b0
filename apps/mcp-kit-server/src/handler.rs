use async_trait::async_trait;
use serde_json::json;

use mcp_kit_coord::now_ms;
use mcp_kit_proto::{
    CallToolParams, CallToolResult, ListToolsParams, ListToolsResult, McpHandler, Tool,
};

/// Built-in tool set so the binary is a working MCP server out of the box.
///
/// Deployments embedding the coordination core swap this for their own
/// [`McpHandler`]; nothing in the core depends on these tools.
pub struct DemoToolHandler {
    version: String,
    started_at_ms: u64,
}

impl DemoToolHandler {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            started_at_ms: now_ms(),
        }
    }

    fn echo(&self, args: Option<serde_json::Value>) -> CallToolResult {
        let Some(text) = args
            .as_ref()
            .and_then(|a| a.get("text"))
            .and_then(|t| t.as_str())
        else {
            return CallToolResult::error("Missing 'text' argument");
        };
        CallToolResult::text(text)
    }

    fn server_info(&self) -> CallToolResult {
        let info = json!({
            "name": "mcp-kit-server",
            "version": self.version,
            "pid": std::process::id(),
            "uptime_ms": now_ms().saturating_sub(self.started_at_ms),
        });
        CallToolResult {
            content: vec![mcp_kit_proto::ContentBlock::Text {
                text: info.to_string(),
            }],
            structured_content: Some(info),
            is_error: Some(false),
        }
    }
}

#[async_trait]
impl McpHandler for DemoToolHandler {
    async fn list_tools(&self, _params: ListToolsParams) -> anyhow::Result<ListToolsResult> {
        Ok(ListToolsResult {
            tools: vec![
                Tool {
                    name: "echo".to_string(),
                    title: Some("Echo".to_string()),
                    description: Some("Repeat the given text back".to_string()),
                    input_schema: json!({
                        "type": "object",
                        "properties": {
                            "text": { "type": "string" }
                        },
                        "required": ["text"]
                    }),
                },
                Tool {
                    name: "server_info".to_string(),
                    title: Some("Server info".to_string()),
                    description: Some("Version, PID and uptime of the serving instance".to_string()),
                    input_schema: json!({ "type": "object", "properties": {} }),
                },
            ],
            next_cursor: None,
        })
    }

    async fn call_tool(&self, params: CallToolParams) -> anyhow::Result<CallToolResult> {
        Ok(match params.name.as_str() {
            "echo" => self.echo(params.arguments),
            "server_info" => self.server_info(),
            other => CallToolResult::error(format!("Unknown tool: {other}")),
        })
    }
}
