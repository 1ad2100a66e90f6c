//! Event-stream transport
//!
//! Server → client messages arrive on a long-lived `text/event-stream`
//! response; client → server messages are POSTed to the endpoint named by
//! the stream's first `endpoint` event. A dropped stream surfaces as
//! `TransportClosed`; reconnecting is the caller's decision.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, HeaderValue};
use reqwest::{Client, Url};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use agent_core::{AgentError, Result};

use super::{Inbound, Transport, TransportKind, auth_headers, next_inbound};
use crate::config::AuthConfig;
use crate::protocol::JsonRpcMessage;

const INBOUND_CAPACITY: usize = 64;

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
///
/// Bytes may be split anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            if let Some(event) = self.process_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event not followed by a blank line
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(event) = self.process_line(line.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let event = SseEvent {
            event: self.event.take().unwrap_or_else(|| "message".into()),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(event)
    }
}

/// Transport over an event stream plus a POST endpoint
pub struct SseTransport {
    url: Url,
    client: Client,
    endpoint: Option<Url>,
    /// Bound on each POST; the stream itself stays open indefinitely
    post_timeout: Duration,
    inbound: Option<Inbound>,
    reader: Option<JoinHandle<()>>,
}

impl SseTransport {
    pub fn new(url: &str, auth: Option<&AuthConfig>, post_timeout: Duration) -> Result<Self> {
        let url = Url::parse(url)
            .map_err(|e| AgentError::Config(format!("invalid stream url '{}': {}", url, e)))?;
        let client = Client::builder()
            .default_headers(auth_headers(auth)?)
            .build()
            .map_err(|e| AgentError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url,
            client,
            endpoint: None,
            post_timeout,
            inbound: None,
            reader: None,
        })
    }

    /// POST endpoint announced by the server, once connected
    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.as_ref()
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn connect(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Err(AgentError::InvalidState(format!("{} is already connected", self.url)));
        }
        debug!("Opening event stream: {}", self.url);

        let response = self.client
            .get(self.url.clone())
            .header(ACCEPT, HeaderValue::from_static("text/event-stream"))
            .send()
            .await
            .map_err(|e| AgentError::Transport(format!("Failed to open event stream {}: {}", self.url, e)))?;
        if !response.status().is_success() {
            return Err(AgentError::Transport(format!(
                "Event stream {} returned HTTP {}",
                self.url,
                response.status()
            )));
        }

        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let peer = self.url.to_string();

        self.reader = Some(tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut decoder = SseDecoder::new();
            let mut stream = response.bytes_stream();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(AgentError::TransportClosed(format!("event stream {} dropped: {}", peer, e))))
                            .await;
                        return;
                    }
                };
                for event in decoder.feed(&chunk) {
                    match event.event.as_str() {
                        "endpoint" => {
                            if let Some(sender) = endpoint_tx.take() {
                                let _ = sender.send(event.data);
                            }
                        }
                        "message" => match JsonRpcMessage::parse(&event.data) {
                            Ok(message) => {
                                if tx.send(Ok(message)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!(server = %peer, "Skipping malformed event: {}", e),
                        },
                        other => debug!(server = %peer, event = other, "Ignoring event"),
                    }
                }
            }
            debug!(server = %peer, "Event stream ended");
        }));
        self.inbound = Some(rx);

        let endpoint = endpoint_rx.await.map_err(|_| {
            AgentError::Transport(format!("Event stream {} ended before announcing an endpoint", self.url))
        })?;
        let endpoint = self.url.join(endpoint.trim())
            .map_err(|e| AgentError::Transport(format!("Invalid endpoint '{}': {}", endpoint, e)))?;
        debug!(server = %self.url, %endpoint, "Event stream connected");
        self.endpoint = Some(endpoint);
        Ok(())
    }

    async fn send(&mut self, message: &JsonRpcMessage) -> Result<()> {
        let endpoint = self.endpoint.clone()
            .ok_or_else(|| AgentError::Transport(format!("{} transport is not connected", self.url)))?;

        let response = self.client
            .post(endpoint)
            .timeout(self.post_timeout)
            .json(message)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AgentError::Timeout(format!("POST to {} timed out", self.url))
                } else {
                    AgentError::Transport(format!("POST to {} failed: {}", self.url, e))
                }
            })?;
        if !response.status().is_success() {
            return Err(AgentError::Transport(format!(
                "POST to {} returned HTTP {}",
                self.url,
                response.status()
            )));
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Option<Duration>) -> Result<JsonRpcMessage> {
        let peer = self.url.to_string();
        next_inbound(self.inbound.as_mut(), timeout, &peer).await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.inbound = None;
        self.endpoint = None;
        Ok(())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(reader) = &self.reader {
            reader.abort();
        }
    }
}
