//! OpenAI-style Provider
//!
//! Chat Completions API with function tools. Works against any endpoint
//! that speaks the same shape.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agent_core::{
    AgentError, Completion, GenerationOptions, LlmProvider, Message, Outcome, Result, TokenUsage, ToolArguments,
    ToolCallRequest, ToolCatalogue,
};

use crate::http::{build_client, send_json};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const NAME: &str = "openai";

/// Chat Completions adapter
pub struct OpenAiProvider {
    client: Client,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: &str, base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| AgentError::Config(format!("Invalid API key format: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        Ok(Self {
            client: build_client(headers, timeout)?,
            base_url: base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/').to_string(),
        })
    }

    /// Request body for one inference call
    pub(crate) fn build_request(
        transcript: &[Message],
        tools: &ToolCatalogue,
        options: &GenerationOptions,
    ) -> ChatRequest {
        let mut messages = Vec::with_capacity(transcript.len() + 1);
        if let Some(system) = &options.system_prompt {
            messages.push(ChatMessage::text("system", system));
        }
        for message in transcript {
            messages.push(match message {
                Message::User { content } => ChatMessage::text("user", content),
                Message::AssistantText { content } => ChatMessage::text("assistant", content),
                Message::AssistantToolCalls { calls } => ChatMessage {
                    role: "assistant",
                    content: None,
                    tool_calls: Some(
                        calls
                            .iter()
                            .map(|call| WireToolCall {
                                id: call.id.clone(),
                                kind: "function".into(),
                                function: WireFunctionCall {
                                    name: call.name.clone(),
                                    arguments: Value::Object(call.arguments.clone()).to_string(),
                                },
                            })
                            .collect(),
                    ),
                    tool_call_id: None,
                },
                Message::ToolResult { result } => ChatMessage {
                    role: "tool",
                    content: Some(result.text()),
                    tool_calls: None,
                    tool_call_id: Some(result.id.clone()),
                },
            });
        }

        let tools: Vec<ToolDefinition> = tools
            .tools()
            .iter()
            .map(|t| ToolDefinition {
                kind: "function",
                function: FunctionDefinition {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect();

        ChatRequest {
            model: options.model.clone(),
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            top_p: options.top_p,
            tools: (!tools.is_empty()).then_some(tools),
        }
    }

    pub(crate) fn parse_response(response: ChatResponse) -> Result<Completion> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::Provider("openai response had no choices".into()))?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(AgentError::ContentPolicy("openai response was filtered".into()));
        }
        if let Some(refusal) = choice.message.refusal {
            return Err(AgentError::ContentPolicy(refusal));
        }

        let calls = choice.message.tool_calls.unwrap_or_default();
        let outcome = if calls.is_empty() {
            Outcome::FinalAnswer(choice.message.content.unwrap_or_default())
        } else {
            Outcome::ToolCalls(calls.into_iter().map(decode_call).collect::<Result<_>>()?)
        };

        let mut completion = Completion::new(outcome, response.model);
        if let Some(usage) = response.usage {
            completion = completion.with_usage(TokenUsage::new(usage.prompt_tokens, usage.completion_tokens));
        }
        Ok(completion)
    }
}

fn decode_call(call: WireToolCall) -> Result<ToolCallRequest> {
    let raw = call.function.arguments.trim();
    let arguments = if raw.is_empty() {
        ToolArguments::new()
    } else {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => map,
            Ok(other) => {
                return Err(AgentError::Provider(format!(
                    "arguments for {} are not an object: {}",
                    call.function.name, other
                )));
            }
            Err(e) => {
                return Err(AgentError::Provider(format!(
                    "malformed arguments for {}: {}",
                    call.function.name, e
                )));
            }
        }
    };
    Ok(ToolCallRequest::new(call.id, call.function.name, arguments))
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
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
        tracing::debug!(model = %body.model, messages = body.messages.len(), "Sending chat completion");

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        let response: ChatResponse = send_json(NAME, request).await?;
        Self::parse_response(response)
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ChatMessage {
    pub role: &'static str,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &'static str, content: &str) -> Self {
        Self {
            role,
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    pub function: WireFunctionCall,
}

fn function_kind() -> String {
    "function".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireFunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Choice {
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<WireToolCall>>,
    #[serde(default)]
    pub refusal: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}
