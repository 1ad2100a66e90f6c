//! Wire protocol types
//!
//! JSON-RPC 2.0 framing plus the request/result shapes of the tool-serving
//! protocol (revision `2024-11-05`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use agent_core::{AgentError, Result, ToolDescriptor};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC "method not found"
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Request correlation id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

/// Any message on the wire.
///
/// Variant order matters for untagged decoding: a request has both `id`
/// and `method`, a response has `id` only, a notification `method` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| AgentError::Protocol(format!("invalid JSON-RPC message: {} (raw: {})", e, raw)))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(request)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(response)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notification: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(notification)
    }
}

/// JSON-RPC request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: RequestId::Number(id),
            method: method.into(),
            params,
        }
    }

    /// Create an initialize request
    pub fn initialize(id: i64, client_name: &str) -> Self {
        Self::new(id, "initialize", Some(serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": client_name,
                "version": env!("CARGO_PKG_VERSION")
            }
        })))
    }

    /// Create a paginated list request (`tools/list`, `resources/list`, ...)
    pub fn list(id: i64, method: &str, cursor: Option<&str>) -> Self {
        let params = cursor.map(|c| serde_json::json!({ "cursor": c }));
        Self::new(id, method, params)
    }

    /// Create a tools/call request
    pub fn call_tool(id: i64, name: &str, arguments: &Map<String, Value>) -> Self {
        Self::new(id, "tools/call", Some(serde_json::json!({
            "name": name,
            "arguments": arguments
        })))
    }

    pub fn read_resource(id: i64, uri: &str) -> Self {
        Self::new(id, "resources/read", Some(serde_json::json!({ "uri": uri })))
    }

    pub fn get_prompt(id: i64, name: &str, arguments: &Map<String, Value>) -> Self {
        Self::new(id, "prompts/get", Some(serde_json::json!({
            "name": name,
            "arguments": arguments
        })))
    }

    pub fn ping(id: i64) -> Self {
        Self::new(id, "ping", None)
    }
}

/// JSON-RPC response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Decode the result payload, turning an error object into
    /// `AgentError::Protocol`.
    pub fn into_result<T: serde::de::DeserializeOwned>(self, method: &str) -> Result<T> {
        if let Some(err) = self.error {
            return Err(AgentError::Protocol(format!(
                "{} failed: {} (code {})",
                method, err.message, err.code
            )));
        }
        let result = self.result.unwrap_or(Value::Null);
        serde_json::from_value(result)
            .map_err(|e| AgentError::Protocol(format!("unexpected {} result: {}", method, e)))
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn initialized() -> Self {
        Self::new("notifications/initialized", None)
    }
}

/// Name and version of a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Capabilities a server advertises in its initialize result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
}

impl ServerCapabilities {
    pub fn supports_tools(&self) -> bool {
        self.tools.is_some()
    }

    pub fn supports_resources(&self) -> bool {
        self.resources.is_some()
    }

    pub fn supports_prompts(&self) -> bool {
        self.prompts.is_some()
    }
}

/// Server capability manifest returned by `initialize`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Tool definition from a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub input_schema: Value,
}

impl From<McpTool> for ToolDescriptor {
    fn from(tool: McpTool) -> Self {
        ToolDescriptor::new(tool.name, tool.description.unwrap_or_default(), tool.input_schema)
    }
}

/// Readable resource advertised by a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Argument accepted by a prompt template
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// Prompt template advertised by a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// One page of a list call; `items` is whichever array the method returns
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Page<T> {
    #[serde(alias = "tools", alias = "resources", alias = "prompts")]
    pub items: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

/// Result of a tools/call response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(default)]
    pub is_error: bool,
}

/// Content of one resource returned by resources/read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResourceResult {
    pub contents: Vec<ResourceContents>,
}

/// Message of an expanded prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: Value,
}

impl PromptMessage {
    /// Text of a `{"type": "text"}` content block
    pub fn text(&self) -> Option<&str> {
        self.content.get("text").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPromptResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub messages: Vec<PromptMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_variants_decode() {
        let request = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#).unwrap();
        assert!(matches!(request, JsonRpcMessage::Request(ref r) if r.id == RequestId::Number(7)));

        let response = JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","id":"a","result":{}}"#).unwrap();
        assert!(matches!(response, JsonRpcMessage::Response(ref r) if r.id == RequestId::String("a".into())));

        let notification =
            JsonRpcMessage::parse(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#).unwrap();
        assert!(matches!(notification, JsonRpcMessage::Notification(_)));

        assert!(JsonRpcMessage::parse("Starting server...").is_err());
    }

    #[test]
    fn test_call_tool_request_shape() {
        let mut args = Map::new();
        args.insert("a".into(), json!(5));
        let request = JsonRpcRequest::call_tool(3, "add", &args);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "add", "arguments": {"a": 5}}})
        );
    }

    #[test]
    fn test_initialize_result_decode() {
        let response = JsonRpcResponse::success(
            RequestId::Number(1),
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {"listChanged": false}},
                "serverInfo": {"name": "Simple Example Server", "version": "1.0.0"}
            }),
        );
        let result: InitializeResult = response.into_result("initialize").unwrap();
        assert!(result.capabilities.supports_tools());
        assert!(!result.capabilities.supports_prompts());
        assert_eq!(result.server_info.name, "Simple Example Server");
    }

    #[test]
    fn test_page_decodes_any_list() {
        let page: Page<McpTool> = serde_json::from_value(json!({
            "tools": [{"name": "add", "inputSchema": {"type": "object"}}],
            "nextCursor": "2"
        }))
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_cursor.as_deref(), Some("2"));

        let descriptor: ToolDescriptor = page.items[0].clone().into();
        assert_eq!(descriptor.description, "");
    }

    #[test]
    fn test_error_response_is_protocol_error() {
        let response = JsonRpcResponse::failure(RequestId::Number(2), METHOD_NOT_FOUND, "Method not found");
        let err = response.into_result::<Value>("prompts/list").unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
    }
}
