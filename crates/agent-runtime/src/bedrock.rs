//! Bedrock-style Provider
//!
//! Bedrock Converse API authenticated with a Bedrock API key (bearer
//! token). The request shape is the same for every model family Bedrock
//! hosts.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use agent_core::{
    AgentError, Completion, GenerationOptions, LlmProvider, Message, Outcome, Result, TokenUsage, ToolArguments,
    ToolCallRequest, ToolCatalogue,
};

use crate::http::{BlockMessage, build_client, merge_blocks, send_json};

pub const DEFAULT_REGION: &str = "us-east-1";

const NAME: &str = "bedrock";

/// Stop reasons that mean the model's output was blocked
const BLOCKED_STOP_REASONS: &[&str] = &["guardrail_intervened", "content_filtered"];

/// Converse API adapter
pub struct BedrockProvider {
    client: Client,
    base_url: Url,
}

impl BedrockProvider {
    /// `base_url` defaults to the regional runtime endpoint
    pub fn new(api_key: &str, region: &str, base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|e| AgentError::Config(format!("Invalid API key format: {}", e)))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let base = match base_url {
            Some(url) => url.to_string(),
            None => format!("https://bedrock-runtime.{}.amazonaws.com", region),
        };
        let base_url = Url::parse(&base)
            .map_err(|e| AgentError::Config(format!("invalid Bedrock endpoint '{}': {}", base, e)))?;

        Ok(Self {
            client: build_client(headers, timeout)?,
            base_url,
        })
    }

    /// `{base}/model/{modelId}/converse`, with the model id percent-encoded
    pub(crate) fn converse_url(&self, model_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| AgentError::Config(format!("Bedrock endpoint {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(["model", model_id, "converse"]);
        Ok(url)
    }

    pub(crate) fn build_request(
        transcript: &[Message],
        tools: &ToolCatalogue,
        options: &GenerationOptions,
    ) -> ConverseRequest {
        let blocks = transcript.iter().flat_map(|message| -> Vec<(&'static str, Value)> {
            match message {
                Message::User { content } => vec![("user", json!({"text": content}))],
                Message::AssistantText { content } if content.is_empty() => Vec::new(),
                Message::AssistantText { content } => vec![("assistant", json!({"text": content}))],
                Message::AssistantToolCalls { calls } => calls
                    .iter()
                    .map(|call| {
                        (
                            "assistant",
                            json!({"toolUse": {"toolUseId": call.id, "name": call.name, "input": call.arguments}}),
                        )
                    })
                    .collect(),
                Message::ToolResult { result } => vec![(
                    "user",
                    json!({"toolResult": {
                        "toolUseId": result.id,
                        "content": [{"text": result.text()}],
                        "status": if result.is_error { "error" } else { "success" }
                    }}),
                )],
            }
        });

        let tool_config = (!tools.is_empty()).then(|| {
            json!({
                "tools": tools.tools().iter().map(|t| json!({"toolSpec": {
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": {"json": t.input_schema}
                }})).collect::<Vec<_>>()
            })
        });

        let mut inference = Map::new();
        inference.insert("maxTokens".into(), json!(options.max_tokens));
        inference.insert("temperature".into(), json!(options.temperature));
        if let Some(top_p) = options.top_p {
            inference.insert("topP".into(), json!(top_p));
        }

        ConverseRequest {
            messages: merge_blocks(blocks),
            system: options.system_prompt.as_ref().map(|s| vec![json!({"text": s})]),
            inference_config: Value::Object(inference),
            tool_config,
        }
    }

    pub(crate) fn parse_response(response: ConverseResponse, model: &str) -> Result<Completion> {
        if let Some(reason) = response.stop_reason.as_deref() {
            if BLOCKED_STOP_REASONS.contains(&reason) {
                return Err(AgentError::ContentPolicy(format!("bedrock stopped with {}", reason)));
            }
        }

        let mut text = Vec::new();
        let mut calls = Vec::new();
        for block in response.output.message.content {
            if let Some(t) = block.get("text").and_then(Value::as_str) {
                text.push(t.to_string());
            } else if let Some(tool_use) = block.get("toolUse") {
                let tool_use: ToolUse = serde_json::from_value(tool_use.clone())
                    .map_err(|e| AgentError::Provider(format!("Unexpected bedrock toolUse block: {}", e)))?;
                let arguments = match tool_use.input {
                    Value::Object(map) => map,
                    Value::Null => ToolArguments::new(),
                    other => {
                        return Err(AgentError::Provider(format!(
                            "toolUse input for {} is not an object: {}",
                            tool_use.name, other
                        )));
                    }
                };
                calls.push(ToolCallRequest::new(tool_use.tool_use_id, tool_use.name, arguments));
            }
        }

        let outcome = if calls.is_empty() {
            Outcome::FinalAnswer(text.join("\n"))
        } else {
            Outcome::ToolCalls(calls)
        };

        let mut completion = Completion::new(outcome, model);
        if let Some(usage) = response.usage {
            completion = completion.with_usage(TokenUsage::new(usage.input_tokens, usage.output_tokens));
        }
        Ok(completion)
    }
}

#[async_trait]
impl LlmProvider for BedrockProvider {
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
        let url = self.converse_url(&options.model)?;
        tracing::debug!(model = %options.model, messages = body.messages.len(), "Sending converse request");

        let response: ConverseResponse = send_json(NAME, self.client.post(url).json(&body)).await?;
        Self::parse_response(response, &options.model)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConverseRequest {
    pub messages: Vec<BlockMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Vec<Value>>,
    pub inference_config: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConverseResponse {
    pub output: ConverseOutput,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConverseOutput {
    pub message: OutputMessage,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OutputMessage {
    #[serde(default)]
    pub content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolUse {
    #[serde(default)]
    tool_use_id: String,
    name: String,
    #[serde(default)]
    input: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::{ToolCallResult, ToolDescriptor};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL: &str = "anthropic.claude-3-haiku-20240307-v1:0";

    fn catalogue() -> ToolCatalogue {
        ToolCatalogue::new(vec![ToolDescriptor::new("add", "Add two numbers together.", json!({"type": "object"}))])
    }

    fn options() -> GenerationOptions {
        GenerationOptions {
            model: MODEL.into(),
            system_prompt: Some("be brief".into()),
            ..GenerationOptions::default()
        }
    }

    #[test]
    fn test_default_endpoint_and_url() {
        let provider = BedrockProvider::new("k", "eu-west-1", None, Duration::from_secs(5)).unwrap();
        let url = provider.converse_url(MODEL).unwrap();
        assert_eq!(url.host_str(), Some("bedrock-runtime.eu-west-1.amazonaws.com"));
        assert!(url.path().starts_with("/model/anthropic.claude-3-haiku"));
        assert!(url.path().ends_with("/converse"));
    }

    #[test]
    fn test_request_framing() {
        let transcript = vec![
            Message::user("5+3?"),
            Message::tool_calls(vec![ToolCallRequest::new("tu_1", "add", ToolArguments::new())]),
            Message::tool_result(ToolCallResult::failure("tu_1", "boom")),
        ];
        let value = serde_json::to_value(BedrockProvider::build_request(&transcript, &catalogue(), &options())).unwrap();

        assert_eq!(value["system"], json!([{"text": "be brief"}]));
        assert_eq!(value["inferenceConfig"]["maxTokens"], 2048);
        assert_eq!(value["messages"][1]["content"][0]["toolUse"]["toolUseId"], "tu_1");
        assert_eq!(value["messages"][2]["content"][0]["toolResult"]["status"], "error");
        assert_eq!(value["toolConfig"]["tools"][0]["toolSpec"]["inputSchema"]["json"], json!({"type": "object"}));
    }

    #[test]
    fn test_guardrail_is_policy_error() {
        let response: ConverseResponse = serde_json::from_value(json!({
            "output": {"message": {"role": "assistant", "content": []}},
            "stopReason": "guardrail_intervened"
        }))
        .unwrap();
        assert!(matches!(
            BedrockProvider::parse_response(response, MODEL),
            Err(AgentError::ContentPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_infer_tool_use() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/model/{}/converse", MODEL)))
            .and(header("authorization", "Bearer brk-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": {"message": {"role": "assistant", "content": [
                    {"text": "Adding."},
                    {"toolUse": {"toolUseId": "tu_7", "name": "add", "input": {"a": 5, "b": 3}}}
                ]}},
                "stopReason": "tool_use",
                "usage": {"inputTokens": 12, "outputTokens": 4, "totalTokens": 16}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = BedrockProvider::new("brk-key", DEFAULT_REGION, Some(&server.uri()), Duration::from_secs(5)).unwrap();
        let completion = provider.infer(&[Message::user("5+3?")], &catalogue(), &options()).await.unwrap();
        let Outcome::ToolCalls(calls) = completion.outcome else {
            panic!("expected tool calls");
        };
        assert_eq!(calls[0].id, "tu_7");
        assert_eq!(calls[0].arguments.get("b"), Some(&json!(3)));
        assert_eq!(completion.usage.unwrap().total_tokens, 16);
    }

    #[tokio::test]
    async fn test_infer_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let provider = BedrockProvider::new("k", DEFAULT_REGION, Some(&server.uri()), Duration::from_secs(5)).unwrap();
        let err = provider.infer(&[Message::user("hi")], &catalogue(), &options()).await.unwrap_err();
        assert!(matches!(err, AgentError::Provider(ref msg) if msg.contains("503")));
    }
}
