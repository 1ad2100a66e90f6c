//! # agent-runtime
//!
//! Provider adapters and the constructors outside callers use.
//!
//! ## Providers
//!
//! - **openai_style**: Chat Completions API
//! - **claude_style**: Anthropic Messages API
//! - **bedrock_style**: Bedrock Converse API
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{ProviderConfig, ProviderKind, ServerConfig, create_agent, create_session};
//!
//! agent_runtime::telemetry::init_tracing()?;
//! let session = create_session(ServerConfig::process("python", ["server.py"])).await?;
//! let agent = create_agent(session.clone(), &ProviderConfig::from_env(ProviderKind::OpenaiStyle, "gpt-4o-mini")?)?;
//! let reply = agent.chat("what is 5+3?").await?;
//! session.close().await?;
//! ```

use std::sync::Arc;

use tracing::{info, warn};

pub mod anthropic;
pub mod bedrock;
pub mod config;
mod http;
pub mod openai;
pub mod telemetry;

pub use anthropic::AnthropicProvider;
pub use bedrock::BedrockProvider;
pub use config::{InferenceParams, ProviderConfig, ProviderKind};
pub use openai::OpenAiProvider;

// Re-export core types for convenience
pub use agent_core::{AgentError, AgentLoop, AgentResponse, LlmProvider, Message, Result, ToolDescriptor};
pub use mcp_client::{McpSession, ServerConfig, SessionState};

/// Connect to a tool server and discover its tools.
///
/// The connection is attempted once; on failure nothing is left running.
pub async fn create_session(config: ServerConfig) -> Result<Arc<McpSession>> {
    let session = McpSession::new(config)?;
    session.connect().await?;

    match session.list_tools().await {
        Ok(tools) => {
            info!(server = session.name(), tools = tools.len(), "Tool server connected");
            Ok(Arc::new(session))
        }
        Err(e) => {
            warn!(server = session.name(), error = %e, "Tool discovery failed");
            if let Err(close_err) = session.close().await {
                warn!(server = session.name(), "Failed to close session: {}", close_err);
            }
            Err(e)
        }
    }
}

/// Build an agent loop over `session` using the backend `config` names
pub fn create_agent(session: Arc<McpSession>, config: &ProviderConfig) -> Result<AgentLoop> {
    let provider = config.build_provider()?;
    info!(provider = %config.provider, model = %config.model_id, "Creating agent");
    agent_core::AgentBuilder::new()
        .session(session)
        .provider(provider)
        .generation(config.generation_options())
        .iteration_ceiling(config.iteration_ceiling)
        .inference_timeout(config.request_timeout())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_rpc(server: &MockServer, method_name: &str, id: i64, result: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path("/mcp"))
            .and(body_partial_json(json!({"method": method_name})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": id, "result": result})))
            .mount(server)
            .await;
    }

    async fn tool_server() -> MockServer {
        let server = MockServer::start().await;
        mount_rpc(&server, "initialize", 1, json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "http-calc", "version": "1.0.0"}
        }))
        .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "notifications/initialized"})))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;
        mount_rpc(&server, "tools/list", 2, json!({
            "tools": [{"name": "add", "description": "Add two numbers together.", "inputSchema": {"type": "object"}}]
        }))
        .await;
        mount_rpc(&server, "tools/call", 3, json!({"content": [{"type": "text", "text": "8"}]})).await;
        server
    }

    async fn model_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_string_contains("tool_call_id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini",
                "choices": [{"message": {"content": "5 + 3 = 8"}, "finish_reason": "stop"}]
            })))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "gpt-4o-mini",
                "choices": [{"message": {"tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "add", "arguments": "{\"a\":5,\"b\":3}"}
                }]}, "finish_reason": "tool_calls"}]
            })))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_session_and_agent_over_request_transport() {
        let tools = tool_server().await;
        let model = model_server().await;

        let session = create_session(ServerConfig::request(format!("{}/mcp", tools.uri())))
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.tools().names(), vec!["add"]);

        let config = ProviderConfig::new(ProviderKind::OpenaiStyle, "gpt-4o-mini")
            .with_api_key("sk-test")
            .with_base_url(model.uri());
        let agent = create_agent(session.clone(), &config).unwrap();

        let response = agent.chat("what is 5+3?").await.unwrap();
        assert!(response.response.contains('8'));
        assert_eq!(response.tool_calls_made[0].result.text(), "8");
        assert_eq!(agent.history().len(), 4);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_session_unreachable_server() {
        let err = create_session(ServerConfig::request("http://127.0.0.1:9/mcp")).await.err().expect("expected transport error");
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_create_agent_rejects_missing_credentials() {
        let tools = tool_server().await;
        let session = create_session(ServerConfig::request(format!("{}/mcp", tools.uri())))
            .await
            .unwrap();
        let config = ProviderConfig::new(ProviderKind::ClaudeStyle, "claude-3-haiku-20240307");
        assert!(matches!(create_agent(session, &config), Err(AgentError::Config(_))));
    }
}
