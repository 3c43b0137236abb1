//! MCP (Model Context Protocol) JSON-RPC 2.0 message types used during the
//! initialization handshake and tool discovery.

use muster_core::ToolDescriptor;
use serde::{Deserialize, Serialize};

/// Protocol revision muster offers in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Revisions a server may answer with and still be considered compatible.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Correlates the response.
    pub id: u64,
    /// Method name.
    pub method: String,
    /// Method parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// A request with the given id.
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Method name.
    pub method: String,
    /// An empty object when none was given.
    pub params: serde_json::Value,
}

impl JsonRpcNotification {
    /// A notification; missing params become `{}`.
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params: params.unwrap_or_else(|| serde_json::json!({})),
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version tag.
    #[allow(dead_code)]
    pub jsonrpc: String,
    /// Absent on notifications.
    pub id: Option<u64>,
    /// Present on server-initiated requests and notifications.
    #[serde(default)]
    pub method: Option<String>,
    /// Set on success.
    pub result: Option<serde_json::Value>,
    /// Set on failure.
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Server-specific detail.
    pub data: Option<serde_json::Value>,
}

/// MCP tool definition from the `tools/list` response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpToolDef {
    /// Tool name.
    pub name: String,
    /// Empty when the server gives none.
    #[serde(default)]
    pub description: String,
    /// JSON Schema of the arguments.
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl McpToolDef {
    /// Converts the wire definition into a descriptor owned by `provider`.
    pub fn into_descriptor(self, provider: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name,
            provider: provider.to_string(),
            description: self.description,
            schema: self.input_schema,
        }
    }
}

/// MCP server capabilities from the `initialize` response.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerCapabilities {
    /// Present when the server offers tools.
    #[serde(default)]
    pub tools: Option<serde_json::Value>,
    /// Present when the server offers resources.
    #[serde(default)]
    pub resources: Option<serde_json::Value>,
    /// Present when the server offers prompts.
    #[serde(default)]
    pub prompts: Option<serde_json::Value>,
}

/// MCP initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    /// Revision the server chose.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// What the server offers.
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Name and version, when sent.
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

impl InitializeResult {
    /// Checks the negotiated revision against [`SUPPORTED_PROTOCOL_VERSIONS`].
    pub fn check_compatible(&self) -> Result<(), String> {
        if SUPPORTED_PROTOCOL_VERSIONS.contains(&self.protocol_version.as_str()) {
            Ok(())
        } else {
            Err(format!(
                "unsupported protocol version '{}' (supported: {})",
                self.protocol_version,
                SUPPORTED_PROTOCOL_VERSIONS.join(", ")
            ))
        }
    }
}

/// Server identity from `initialize`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version. Empty when omitted.
    #[serde(default)]
    pub version: String,
}

/// Parameters muster sends with `initialize`.
pub fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "muster",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}

/// Extracts the tool list from a `tools/list` result.
///
/// A result without a `tools` array is an incompatible manifest.
pub fn parse_tool_list(result: serde_json::Value) -> Result<Vec<McpToolDef>, String> {
    let tools = result
        .get("tools")
        .cloned()
        .ok_or_else(|| "tools/list result has no 'tools' field".to_string())?;
    serde_json::from_value(tools).map_err(|e| format!("failed to parse tools: {e}"))
}
