//! Shared HTTP plumbing for the provider adapters

use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use agent_core::{AgentError, Result};

/// Longest slice of an error body carried into an error message
const EXCERPT_LEN: usize = 300;

pub(crate) fn build_client(headers: HeaderMap, timeout: Duration) -> Result<Client> {
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|e| AgentError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Send a prepared request and decode a successful JSON reply
pub(crate) async fn send_json<T: DeserializeOwned>(provider: &str, request: RequestBuilder) -> Result<T> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            AgentError::Provider(format!("{} request timed out", provider))
        } else {
            AgentError::Provider(format!("{} request failed: {}", provider, e))
        }
    })?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AgentError::Provider(format!("Failed to read {} response: {}", provider, e)))?;

    if !status.is_success() {
        return Err(classify_status(provider, status, &body));
    }
    debug!(provider, %status, bytes = body.len(), "Inference response received");

    serde_json::from_str(&body)
        .map_err(|e| AgentError::Provider(format!("Unexpected {} response: {}", provider, e)))
}

/// Map a non-success status to an error class
pub(crate) fn classify_status(provider: &str, status: StatusCode, body: &str) -> AgentError {
    let excerpt: String = body.chars().take(EXCERPT_LEN).collect();
    match status.as_u16() {
        401 | 403 => AgentError::Auth(format!("{} rejected the credentials ({})", provider, status)),
        429 => {
            warn!(provider, "Rate limit exceeded");
            AgentError::RateLimited(format!("{}: {}", provider, excerpt))
        }
        _ if body.contains("content_policy_violation") => {
            AgentError::ContentPolicy(format!("{}: {}", provider, excerpt))
        }
        _ => AgentError::Provider(format!("{} API error ({}): {}", provider, status, excerpt)),
    }
}

/// One role's turn in a content-block conversation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct BlockMessage {
    pub role: &'static str,
    pub content: Vec<Value>,
}

/// Fold `(role, block)` pairs into messages, merging consecutive blocks of
/// the same role. Backends that alternate roles strictly need this for
/// several tool results following one assistant turn.
pub(crate) fn merge_blocks(blocks: impl IntoIterator<Item = (&'static str, Value)>) -> Vec<BlockMessage> {
    let mut messages: Vec<BlockMessage> = Vec::new();
    for (role, block) in blocks {
        match messages.last_mut() {
            Some(last) if last.role == role => last.content.push(block),
            _ => messages.push(BlockMessage { role, content: vec![block] }),
        }
    }
    messages
}
