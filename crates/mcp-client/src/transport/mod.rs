//! Transport abstraction and implementations
//!
//! - [`stdio::StdioTransport`] spawns a child process and exchanges
//!   newline-delimited JSON over its stdin/stdout.
//! - [`sse::SseTransport`] keeps an event stream open for server → client
//!   messages and POSTs client → server messages to the endpoint the stream
//!   announces.
//! - [`http::HttpTransport`] does one POST round-trip per message.
//!
//! Each variant owns its OS/network resource and releases it on `close()`
//! or drop. None of them reconnects on its own.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc;

use agent_core::{AgentError, Result};

use crate::config::{AuthConfig, ServerConfig, TransportConfig};
use crate::protocol::JsonRpcMessage;

pub mod http;
pub mod sse;
pub mod stdio;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Which concrete channel a transport uses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Process,
    Stream,
    Request,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Process => write!(f, "process"),
            TransportKind::Stream => write!(f, "stream"),
            TransportKind::Request => write!(f, "request"),
        }
    }
}

/// Duplex message channel to one tool server.
///
/// `receive` must be cancel-safe: dropping an in-flight call never loses a
/// message that has not been returned yet.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Launch or dial the peer. Fails with `AgentError::Transport`.
    async fn connect(&mut self) -> Result<()>;

    /// Send one complete message. Fails with `AgentError::Transport` once
    /// the channel is closed.
    async fn send(&mut self, message: &JsonRpcMessage) -> Result<()>;

    /// Next inbound message. `None` waits indefinitely.
    ///
    /// Fails with `AgentError::TransportClosed` when the peer disconnects
    /// and `AgentError::Timeout` when `timeout` elapses first.
    async fn receive(&mut self, timeout: Option<Duration>) -> Result<JsonRpcMessage>;

    /// Release the underlying resource. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// Build the transport described by `config`, unconnected
pub fn from_config(config: &ServerConfig) -> Result<Box<dyn Transport>> {
    let auth = config.auth.as_ref();
    let transport: Box<dyn Transport> = match &config.transport {
        TransportConfig::Process { command, args, env, cwd } => Box::new(
            StdioTransport::new(command, args.clone())
                .with_envs(env.clone())
                .with_cwd(cwd.clone()),
        ),
        TransportConfig::Stream { url } => {
            Box::new(SseTransport::new(url, auth, config.request_timeout())?)
        }
        TransportConfig::Request { url } => {
            Box::new(HttpTransport::new(url, auth, config.request_timeout())?)
        }
    };
    Ok(transport)
}

/// Inbound queue fed by a background reader task
pub(crate) type Inbound = mpsc::Receiver<Result<JsonRpcMessage>>;

/// Pull the next message off a reader task's queue
pub(crate) async fn next_inbound(
    inbound: Option<&mut Inbound>,
    timeout: Option<Duration>,
    peer: &str,
) -> Result<JsonRpcMessage> {
    let Some(rx) = inbound else {
        return Err(AgentError::TransportClosed(format!("{} transport is not connected", peer)));
    };

    let next = match timeout {
        Some(limit) => tokio::time::timeout(limit, rx.recv())
            .await
            .map_err(|_| AgentError::Timeout(format!("no message from {} within {:?}", peer, limit)))?,
        None => rx.recv().await,
    };

    next.unwrap_or_else(|| Err(AgentError::TransportClosed(format!("{} disconnected", peer))))
}

/// Default headers for the HTTP-based transports
pub(crate) fn auth_headers(auth: Option<&AuthConfig>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let Some(auth) = auth else {
        return Ok(headers);
    };

    if let Some(token) = &auth.bearer_token {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| AgentError::Config(format!("invalid bearer token: {}", e)))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    for (name, value) in &auth.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AgentError::Config(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AgentError::Config(format!("invalid value for header '{}': {}", name, e)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcNotification;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_next_inbound_timeout_and_close() {
        let (tx, mut rx) = mpsc::channel(4);

        let err = next_inbound(Some(&mut rx), Some(Duration::from_millis(10)), "test")
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));

        tx.send(Ok(JsonRpcNotification::initialized().into())).await.unwrap();
        drop(tx);
        assert!(next_inbound(Some(&mut rx), None, "test").await.is_ok());

        let err = next_inbound(Some(&mut rx), None, "test").await.unwrap_err();
        assert!(matches!(err, AgentError::TransportClosed(_)));

        let err = next_inbound(None, None, "test").await.unwrap_err();
        assert!(matches!(err, AgentError::TransportClosed(_)));
    }

    #[test]
    fn test_auth_headers() {
        let auth = AuthConfig {
            bearer_token: Some("abc".into()),
            headers: HashMap::from([("X-Api-Key".to_string(), "k".to_string())]),
        };
        let headers = auth_headers(Some(&auth)).unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer abc");
        assert_eq!(headers.get("x-api-key").unwrap(), "k");
        assert!(auth_headers(None).unwrap().is_empty());
    }

    #[test]
    fn test_from_config_picks_variant() {
        let config = ServerConfig::request("http://localhost:9000/mcp");
        assert_eq!(from_config(&config).unwrap().kind(), TransportKind::Request);

        let config = ServerConfig::process("python", ["server.py"]);
        assert_eq!(from_config(&config).unwrap().kind(), TransportKind::Process);
    }
}
