//! Tool System
//!
//! Tool descriptors discovered from a tool server, the call/result pair the
//! reasoning loop exchanges with it, and the `ToolSession` seam the loop
//! executes calls through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// Structured key/value arguments of a tool call
pub type ToolArguments = Map<String, Value>;

/// A callable tool advertised by a tool server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool identifier within a session
    pub name: String,

    /// JSON Schema describing the arguments
    pub input_schema: Value,

    /// Human-readable description (shown to LLM)
    #[serde(default)]
    pub description: String,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            input_schema,
            description: description.into(),
        }
    }
}

/// Tool call request from the LLM
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Correlation id assigned by the provider
    pub id: String,

    /// Tool identifier
    pub name: String,

    /// Arguments as key-value pairs
    #[serde(default)]
    pub arguments: ToolArguments,
}

impl ToolCallRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: ToolArguments) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Result of executing one `ToolCallRequest`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Id of the request this answers
    pub id: String,

    /// Structured payload (content blocks, plain text or an error description)
    pub content: Value,

    /// Whether the tool reported a failure
    #[serde(default)]
    pub is_error: bool,
}

impl ToolCallResult {
    pub fn success(id: impl Into<String>, content: Value) -> Self {
        Self {
            id: id.into(),
            content,
            is_error: false,
        }
    }

    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: Value::String(message.into()),
            is_error: true,
        }
    }

    /// Flatten the payload to text for providers that only take strings.
    ///
    /// Content-block arrays contribute the `text` of each block; other
    /// blocks are rendered as compact JSON.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .map(|block| match block.get("text").and_then(Value::as_str) {
                    Some(text) => text.to_string(),
                    None => block.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Snapshot of the tools a session discovered.
///
/// Replaced wholesale on every discovery; never merged.
#[derive(Clone, Debug, Default)]
pub struct ToolCatalogue {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolCatalogue {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        let index = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        Self { tools, index }
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Tools in discovery order
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Get tool names
    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl From<Vec<ToolDescriptor>> for ToolCatalogue {
    fn from(tools: Vec<ToolDescriptor>) -> Self {
        Self::new(tools)
    }
}

/// Something that can execute tool calls on behalf of the reasoning loop.
///
/// Implemented by the protocol session; tests substitute in-memory fakes.
#[async_trait]
pub trait ToolSession: Send + Sync {
    /// Last discovered catalogue
    fn catalogue(&self) -> Arc<ToolCatalogue>;

    /// Execute one call.
    ///
    /// Application-level tool failures come back as `Ok` with
    /// `is_error = true`; `Err` is reserved for unknown tools, timeouts and
    /// channel failures.
    async fn call_tool(&self, name: &str, arguments: ToolArguments) -> Result<ToolCallResult>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_catalogue_lookup() {
        let catalogue = ToolCatalogue::new(vec![
            ToolDescriptor::new("add", "Add two numbers", json!({"type": "object"})),
            ToolDescriptor::new("echo", "Echo a message", json!({"type": "object"})),
        ]);

        assert_eq!(catalogue.len(), 2);
        assert_eq!(catalogue.names(), vec!["add", "echo"]);
        assert!(catalogue.contains("echo"));
        assert!(catalogue.get("unknown").is_none());
    }

    #[test]
    fn test_result_text_flattens_blocks() {
        let result = ToolCallResult::success(
            "call_1",
            json!([{"type": "text", "text": "8"}, {"type": "image"}]),
        );
        assert_eq!(result.text(), "8\n{\"type\":\"image\"}");

        let failure = ToolCallResult::failure("call_2", "Cannot divide by zero");
        assert!(failure.is_error);
        assert_eq!(failure.text(), "Cannot divide by zero");
    }
}
