//! Provider Configuration

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use agent_core::{AgentConfig, AgentError, GenerationOptions, LlmProvider, Result};

use crate::anthropic::AnthropicProvider;
use crate::bedrock::{BedrockProvider, DEFAULT_REGION};
use crate::openai::OpenAiProvider;

/// Inference backend family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenaiStyle,
    ClaudeStyle,
    BedrockStyle,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenaiStyle => write!(f, "openai_style"),
            ProviderKind::ClaudeStyle => write!(f, "claude_style"),
            ProviderKind::BedrockStyle => write!(f, "bedrock_style"),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai_style" | "openai" => Ok(ProviderKind::OpenaiStyle),
            "claude_style" | "claude" | "anthropic" => Ok(ProviderKind::ClaudeStyle),
            "bedrock_style" | "bedrock" => Ok(ProviderKind::BedrockStyle),
            other => Err(AgentError::Config(format!("unknown provider '{}'", other))),
        }
    }
}

/// Sampling parameters forwarded to the backend
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferenceParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Replaces the agent's default system prompt when set
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_temperature() -> f32 { 0.7 }
fn default_max_tokens() -> u32 { 2048 }
fn default_timeout_secs() -> u64 { 120 }
fn default_iteration_ceiling() -> usize { 10 }

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: None,
            system_prompt: None,
        }
    }
}

/// Which backend to call and how
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    pub model_id: String,

    /// API key or bearer token
    #[serde(default)]
    pub api_key: Option<String>,

    /// Override the backend's default endpoint
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bedrock region
    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub inference: InferenceParams,

    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Tool-call rounds allowed per turn
    #[serde(default = "default_iteration_ceiling")]
    pub iteration_ceiling: usize,
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider", &self.provider)
            .field("model_id", &self.model_id)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("region", &self.region)
            .field("inference", &self.inference)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("iteration_ceiling", &self.iteration_ceiling)
            .finish()
    }
}

impl ProviderConfig {
    pub fn new(provider: ProviderKind, model_id: impl Into<String>) -> Self {
        Self {
            provider,
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            region: None,
            inference: InferenceParams::default(),
            request_timeout_secs: default_timeout_secs(),
            iteration_ceiling: default_iteration_ceiling(),
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.inference.system_prompt = Some(prompt.into());
        self
    }

    /// Load credentials and endpoint overrides from the environment
    /// (reading a `.env` file first, if present)
    pub fn from_env(provider: ProviderKind, model_id: impl Into<String>) -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(provider, model_id, |key| std::env::var(key).ok())
    }

    fn from_lookup(
        provider: ProviderKind,
        model_id: impl Into<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let (key_var, url_var) = match provider {
            ProviderKind::OpenaiStyle => ("OPENAI_API_KEY", "OPENAI_BASE_URL"),
            ProviderKind::ClaudeStyle => ("ANTHROPIC_API_KEY", "ANTHROPIC_BASE_URL"),
            ProviderKind::BedrockStyle => ("AWS_BEARER_TOKEN_BEDROCK", "BEDROCK_BASE_URL"),
        };
        let api_key = lookup(key_var)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AgentError::Config(format!("{} is not set", key_var)))?;

        let mut config = Self::new(provider, model_id).with_api_key(api_key);
        config.base_url = lookup(url_var).filter(|u| !u.trim().is_empty());
        if provider == ProviderKind::BedrockStyle {
            config.region = lookup("AWS_REGION");
        }
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn generation_options(&self) -> GenerationOptions {
        let defaults = AgentConfig::default().generation;
        GenerationOptions {
            model: self.model_id.clone(),
            temperature: self.inference.temperature,
            max_tokens: self.inference.max_tokens,
            top_p: self.inference.top_p,
            system_prompt: self.inference.system_prompt.clone().or(defaults.system_prompt),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(AgentError::Config("model_id is required".into()));
        }
        if self.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            return Err(AgentError::Config(format!("{} needs credentials", self.provider)));
        }
        if self.iteration_ceiling == 0 {
            return Err(AgentError::Config("iteration_ceiling must be at least 1".into()));
        }
        Ok(())
    }

    /// Construct the adapter this config describes
    pub fn build_provider(&self) -> Result<Arc<dyn LlmProvider>> {
        self.validate()?;
        let key = self.api_key.as_deref().unwrap_or_default();
        let base_url = self.base_url.as_deref();
        let timeout = self.request_timeout();

        let provider: Arc<dyn LlmProvider> = match self.provider {
            ProviderKind::OpenaiStyle => Arc::new(OpenAiProvider::new(key, base_url, timeout)?),
            ProviderKind::ClaudeStyle => Arc::new(AnthropicProvider::new(key, base_url, timeout)?),
            ProviderKind::BedrockStyle => Arc::new(BedrockProvider::new(
                key,
                self.region.as_deref().unwrap_or(DEFAULT_REGION),
                base_url,
                timeout,
            )?),
        };
        Ok(provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_from_json() {
        let config: ProviderConfig = serde_json::from_str(
            r#"{"provider": "claude_style", "model_id": "claude-3-haiku-20240307", "api_key": "sk-ant-secret",
                "inference": {"temperature": 0.2}}"#,
        )
        .unwrap();
        assert_eq!(config.provider, ProviderKind::ClaudeStyle);
        assert_eq!(config.inference.max_tokens, 2048);
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
        assert!(!format!("{:?}", config).contains("sk-ant-secret"));

        let options = config.generation_options();
        assert_eq!(options.model, "claude-3-haiku-20240307");
        assert!(options.system_prompt.is_some());
    }

    #[test]
    fn test_from_lookup() {
        let env = HashMap::from([
            ("AWS_BEARER_TOKEN_BEDROCK", "brk"),
            ("AWS_REGION", "eu-central-1"),
        ]);
        let lookup = |key: &str| env.get(key).map(ToString::to_string);

        let config = ProviderConfig::from_lookup(ProviderKind::BedrockStyle, "amazon.nova-lite-v1:0", lookup).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("brk"));
        assert_eq!(config.region.as_deref(), Some("eu-central-1"));
        assert!(config.build_provider().is_ok());

        let err = ProviderConfig::from_lookup(ProviderKind::OpenaiStyle, "gpt-4o-mini", lookup).unwrap_err();
        assert!(matches!(err, AgentError::Config(ref msg) if msg.contains("OPENAI_API_KEY")));
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenaiStyle);
        assert_eq!("Anthropic".parse::<ProviderKind>().unwrap(), ProviderKind::ClaudeStyle);
        assert_eq!(ProviderKind::BedrockStyle.to_string(), "bedrock_style");
        assert!("llama".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn test_build_requires_credentials() {
        let config = ProviderConfig::new(ProviderKind::OpenaiStyle, "gpt-4o-mini");
        assert!(matches!(config.build_provider(), Err(AgentError::Config(_))));

        let config = config.with_api_key("sk-test").with_base_url("http://localhost:9999/v1");
        assert_eq!(config.build_provider().unwrap().name(), "openai");
    }
}
