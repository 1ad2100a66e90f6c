//! Request/response transport
//!
//! Every `send` is one POST round-trip; whatever the reply carries is queued
//! for `receive`. There is no persistent connection, so `receive` only ever
//! returns data produced by an earlier `send`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use agent_core::{AgentError, Result};

use super::sse::SseDecoder;
use super::{Transport, TransportKind, auth_headers};
use crate::config::AuthConfig;
use crate::protocol::JsonRpcMessage;

const SESSION_HEADER: &str = "mcp-session-id";

/// Transport doing one HTTP POST per message
pub struct HttpTransport {
    url: Url,
    client: Client,
    session_id: Option<String>,
    pending: VecDeque<JsonRpcMessage>,
    open: bool,
}

impl HttpTransport {
    pub fn new(url: &str, auth: Option<&AuthConfig>, timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| AgentError::Config(format!("invalid server url '{}': {}", url, e)))?;
        let client = Client::builder()
            .default_headers(auth_headers(auth)?)
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url,
            client,
            session_id: None,
            pending: VecDeque::new(),
            open: false,
        })
    }

    /// Session id assigned by the server, if any
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    fn enqueue_json(&mut self, body: &str) -> Result<()> {
        let value: Value = serde_json::from_str(body)
            .map_err(|e| AgentError::Protocol(format!("invalid response body from {}: {}", self.url, e)))?;
        let values = match value {
            Value::Array(batch) => batch,
            single => vec![single],
        };
        for value in values {
            let message: JsonRpcMessage = serde_json::from_value(value)
                .map_err(|e| AgentError::Protocol(format!("invalid JSON-RPC message from {}: {}", self.url, e)))?;
            self.pending.push_back(message);
        }
        Ok(())
    }

    fn enqueue_events(&mut self, body: &str) -> Result<()> {
        let mut decoder = SseDecoder::new();
        let mut events = decoder.feed(body.as_bytes());
        events.extend(decoder.finish());
        for event in events.into_iter().filter(|e| e.event == "message") {
            self.pending.push_back(JsonRpcMessage::parse(&event.data)?);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Request
    }

    async fn connect(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    async fn send(&mut self, message: &JsonRpcMessage) -> Result<()> {
        if !self.open {
            return Err(AgentError::Transport(format!("{} transport is closed", self.url)));
        }

        let mut request = self.client
            .post(self.url.clone())
            .header(ACCEPT, HeaderValue::from_static("application/json, text/event-stream"))
            .json(message);
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout(format!("POST to {} timed out", self.url))
            } else {
                AgentError::Transport(format!("POST to {} failed: {}", self.url, e))
            }
        })?;

        let status = response.status();
        if let Some(id) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            self.session_id = Some(id.to_string());
        }
        let is_event_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        let body = response.text().await
            .map_err(|e| AgentError::Transport(format!("Failed to read reply from {}: {}", self.url, e)))?;

        if !status.is_success() {
            let excerpt: String = body.chars().take(200).collect();
            return Err(AgentError::Transport(format!("{} returned HTTP {}: {}", self.url, status, excerpt)));
        }
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT || body.trim().is_empty() {
            return Ok(());
        }

        debug!(server = %self.url, "<- {}", body.trim());
        if is_event_stream {
            self.enqueue_events(&body)
        } else {
            self.enqueue_json(&body)
        }
    }

    async fn receive(&mut self, _timeout: Option<Duration>) -> Result<JsonRpcMessage> {
        if !self.open {
            return Err(AgentError::TransportClosed(format!("{} transport is closed", self.url)));
        }
        self.pending.pop_front().ok_or_else(|| {
            AgentError::Transport(format!("no reply pending from {}: nothing was sent that produced one", self.url))
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.pending.clear();
        Ok(())
    }
}
