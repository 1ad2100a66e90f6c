//! LLM Provider Strategy Pattern
//!
//! Defines a common interface for all inference backends (OpenAI-style,
//! Claude-style, Bedrock-style) so the reasoning loop never branches on
//! which one it talks to.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::provider::{GenerationOptions, LlmProvider, Outcome};
//!
//! let completion = provider.infer(transcript.messages(), &catalogue, &options).await?;
//! match completion.outcome {
//!     Outcome::FinalAnswer(text) => println!("{text}"),
//!     Outcome::ToolCalls(calls) => { /* execute in order */ }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;
use crate::tool::{ToolCallRequest, ToolCatalogue};

/// Configuration for LLM generation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Model identifier (e.g., "gpt-4o-mini", "claude-3-haiku-20240307")
    pub model: String,

    /// Temperature for sampling (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Top-p nucleus sampling
    #[serde(default)]
    pub top_p: Option<f32>,

    /// System prompt, sent through the provider's dedicated channel
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> u32 { 2048 }

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".into(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: None,
            system_prompt: None,
        }
    }
}

/// What the model decided to do this round. Never both.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    /// Answer the user directly
    FinalAnswer(String),

    /// Invoke these tools, in this order
    ToolCalls(Vec<ToolCallRequest>),
}

/// Response from one inference call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Completion {
    pub outcome: Outcome,

    /// Model that generated this response
    pub model: String,

    /// Token usage statistics (if available)
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn new(outcome: Outcome, model: impl Into<String>) -> Self {
        Self {
            outcome,
            model: model.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Token usage statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for new backends. Adapters are
/// stateless across calls: everything they need is in `transcript`.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider family name, for logs
    fn name(&self) -> &str;

    /// Produce either a final answer or a set of tool calls.
    ///
    /// Fails with a provider-class `AgentError` on network, auth or rate
    /// limit failure and with `AgentError::ContentPolicy` on refusal.
    async fn infer(
        &self,
        transcript: &[Message],
        tools: &ToolCatalogue,
        options: &GenerationOptions,
    ) -> Result<Completion>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_options_defaults() {
        let opts = GenerationOptions::default();
        assert_eq!(opts.temperature, 0.7);
        assert_eq!(opts.max_tokens, 2048);
        assert!(opts.system_prompt.is_none());
    }

    #[test]
    fn test_usage_total() {
        let usage = TokenUsage::new(120, 30);
        assert_eq!(usage.total_tokens, 150);
    }
}
