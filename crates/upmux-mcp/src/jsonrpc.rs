//! JSON-RPC 2.0 framing shared by every transport.
//!
//! Only the handshake (`initialize`, `notifications/initialized`) and
//! `tools/list` are spoken here; tool invocation belongs to the proxy layer.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use upmux_core::{ToolInfo, TransportError};

/// Protocol revision announced in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Upper bound on `tools/list` pages, guarding against cursor loops.
pub const MAX_TOOL_PAGES: usize = 100;

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub const fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    /// Whether this message answers request `id`.
    pub fn answers(&self, id: u64) -> bool {
        self.id.as_ref().and_then(Value::as_u64) == Some(id)
            && (self.result.is_some() || self.error.is_some())
    }

    /// Unwrap the result or map the error.
    pub fn into_result(self) -> Result<Value, TransportError> {
        if let Some(err) = self.error {
            return Err(TransportError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        self.result
            .ok_or_else(|| TransportError::Protocol("missing result in response".to_string()))
    }
}

/// A notification line (no id, no response expected).
pub fn notification(method: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": {}
    })
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": "upmux",
            "version": env!("CARGO_PKG_VERSION")
        },
        "capabilities": {}
    })
}

/// Whether an `initialize` result advertises the tools capability.
pub fn supports_tools(init_result: &Value) -> bool {
    init_result
        .get("capabilities")
        .and_then(|c| c.get("tools"))
        .is_some()
}

pub fn tools_list_params(cursor: Option<&str>) -> Option<Value> {
    cursor.map(|c| json!({ "cursor": c }))
}

#[derive(Debug, Deserialize)]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<ToolInfo>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

/// Parse one `tools/list` result into tools and the next cursor.
pub fn parse_tools_page(result: Value) -> Result<(Vec<ToolInfo>, Option<String>), TransportError> {
    let page: ToolsPage = serde_json::from_value(result)?;
    let next = page.next_cursor.filter(|c| !c.is_empty());
    Ok((page.tools, next))
}
