//! Claude-style Provider
//!
//! Anthropic Messages API. Tool calls and results travel as `tool_use` /
//! `tool_result` content blocks.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use agent_core::{
    AgentError, Completion, GenerationOptions, LlmProvider, Message, Outcome, Result, TokenUsage, ToolArguments,
    ToolCallRequest, ToolCatalogue,
};

use crate::http::{BlockMessage, build_client, merge_blocks, send_json};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const API_VERSION: &str = "2023-06-01";

const NAME: &str = "anthropic";

/// Messages API adapter
pub struct AnthropicProvider {
    client: Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(api_key)
            .map_err(|e| AgentError::Config(format!("Invalid API key format: {}", e)))?;
        key.set_sensitive(true);
        headers.insert(HeaderName::from_static("x-api-key"), key);
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(API_VERSION),
        );

        Ok(Self {
            client: build_client(headers, timeout)?,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
        })
    }

    pub(crate) fn build_request(
        transcript: &[Message],
        tools: &ToolCatalogue,
        options: &GenerationOptions,
    ) -> MessagesRequest {
        let blocks = transcript.iter().flat_map(|message| -> Vec<(&'static str, Value)> {
            match message {
                Message::User { content } => vec![("user", json!({"type": "text", "text": content}))],
                // empty text blocks are rejected by the API
                Message::AssistantText { content } if content.is_empty() => Vec::new(),
                Message::AssistantText { content } => {
                    vec![("assistant", json!({"type": "text", "text": content}))]
                }
                Message::AssistantToolCalls { calls } => calls
                    .iter()
                    .map(|call| {
                        (
                            "assistant",
                            json!({"type": "tool_use", "id": call.id, "name": call.name, "input": call.arguments}),
                        )
                    })
                    .collect(),
                Message::ToolResult { result } => vec![(
                    "user",
                    json!({
                        "type": "tool_result",
                        "tool_use_id": result.id,
                        "content": result.text(),
                        "is_error": result.is_error
                    }),
                )],
            }
        });

        let tools: Vec<Value> = tools
            .tools()
            .iter()
            .map(|t| json!({"name": t.name, "description": t.description, "input_schema": t.input_schema}))
            .collect();

        MessagesRequest {
            model: options.model.clone(),
            max_tokens: options.max_tokens,
            system: options.system_prompt.clone(),
            temperature: options.temperature,
            top_p: options.top_p,
            messages: merge_blocks(blocks),
            tools: (!tools.is_empty()).then_some(tools),
        }
    }

    pub(crate) fn parse_response(response: MessagesResponse) -> Result<Completion> {
        if response.stop_reason.as_deref() == Some("refusal") {
            return Err(AgentError::ContentPolicy("anthropic declined to answer".into()));
        }

        let mut text = Vec::new();
        let mut calls = Vec::new();
        for block in response.content {
            match block {
                ContentBlock::Text { text: t } => text.push(t),
                ContentBlock::ToolUse { id, name, input } => {
                    let arguments = match input {
                        Value::Object(map) => map,
                        Value::Null => ToolArguments::new(),
                        other => {
                            return Err(AgentError::Provider(format!(
                                "tool_use input for {} is not an object: {}",
                                name, other
                            )));
                        }
                    };
                    calls.push(ToolCallRequest::new(id, name, arguments));
                }
                ContentBlock::Other => {}
            }
        }

        let outcome = if calls.is_empty() {
            Outcome::FinalAnswer(text.join("\n"))
        } else {
            Outcome::ToolCalls(calls)
        };

        let mut completion = Completion::new(outcome, response.model);
        if let Some(usage) = response.usage {
            completion = completion.with_usage(TokenUsage::new(usage.input_tokens, usage.output_tokens));
        }
        Ok(completion)
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        NAME
    }

    async fn infer(
        &self,
        transcript: &[Message],
        tools: &ToolCatalogue,
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let body = Self::build_request(transcript, tools, options);
        tracing::debug!(model = %body.model, messages = body.messages.len(), "Sending messages request");

        let request = self.client.post(format!("{}/v1/messages", self.base_url)).json(&body);
        let response: MessagesResponse = send_json(NAME, request).await?;
        Self::parse_response(response)
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    pub messages: Vec<BlockMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        /// Blank ids are replaced by the agent loop
        #[serde(default)]
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
