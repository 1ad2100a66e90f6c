//! Conversation Messages
//!
//! The transcript is an append-only, ordered list of [`Message`]s. Providers
//! rebuild their request context strictly from this order.

use serde::{Deserialize, Serialize};

use crate::tool::{ToolCallRequest, ToolCallResult};

/// A single entry in a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// User input
    User { content: String },

    /// Final assistant text
    AssistantText { content: String },

    /// Tool invocations requested by the model, in the order it returned them
    AssistantToolCalls { calls: Vec<ToolCallRequest> },

    /// Outcome of one requested invocation
    ToolResult { result: ToolCallResult },
}

impl Message {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Message::AssistantText {
            content: content.into(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Message::AssistantToolCalls { calls }
    }

    /// Create a tool result message
    pub fn tool_result(result: ToolCallResult) -> Self {
        Message::ToolResult { result }
    }
}

/// Append-only conversation transcript
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a saved sequence
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Add a message
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Get all messages
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Requests from the most recent `AssistantToolCalls` entry that have no
    /// matching `ToolResult` after it. Each result answers one request.
    pub fn unanswered_calls(&self) -> Vec<ToolCallRequest> {
        let Some(pos) = self
            .messages
            .iter()
            .rposition(|m| matches!(m, Message::AssistantToolCalls { .. }))
        else {
            return Vec::new();
        };
        let Message::AssistantToolCalls { calls } = &self.messages[pos] else {
            return Vec::new();
        };

        let mut answered: Vec<&str> = self.messages[pos + 1..]
            .iter()
            .filter_map(|m| match m {
                Message::ToolResult { result } => Some(result.id.as_str()),
                _ => None,
            })
            .collect();

        calls
            .iter()
            .filter(|c| match answered.iter().position(|id| *id == c.id) {
                Some(i) => {
                    answered.swap_remove(i);
                    false
                }
                None => true,
            })
            .cloned()
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.messages.clear();
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
