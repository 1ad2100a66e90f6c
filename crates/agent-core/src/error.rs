//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Connect/send/receive failure on a transport channel
    #[error("Transport error: {0}")]
    Transport(String),

    /// Peer disconnected (process exited, stream dropped)
    #[error("Transport closed: {0}")]
    TransportClosed(String),

    /// Malformed or incompatible initialization exchange
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// Response could not be decoded against the expected schema
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Tool absent from the last discovered catalogue
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// No response within the configured budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// LLM provider error (network, malformed response, server failure)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider rejected the credentials
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Provider rate limit hit
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Provider refused to answer
    #[error("Content policy refusal: {0}")]
    ContentPolicy(String),

    /// Tool-calling cycle hit the iteration ceiling
    #[error("Loop limit exceeded after {0} tool rounds")]
    LoopLimitExceeded(usize),

    /// Another turn is already in progress on this agent loop
    #[error("Agent loop is busy with another turn")]
    Busy,

    /// Operation not allowed in the current session state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Channel-level failure that ends the owning session
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AgentError::Transport(_) | AgentError::TransportClosed(_) | AgentError::Io(_)
        )
    }

    /// Failure raised by an inference backend
    pub fn is_provider(&self) -> bool {
        matches!(
            self,
            AgentError::Provider(_)
                | AgentError::Auth(_)
                | AgentError::RateLimited(_)
                | AgentError::ContentPolicy(_)
        )
    }

    /// Check if error is retryable by the caller.
    ///
    /// The core itself never retries; this only classifies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Transport(_)
                | AgentError::TransportClosed(_)
                | AgentError::Timeout(_)
                | AgentError::RateLimited(_)
                | AgentError::Busy
                | AgentError::Io(_)
        )
    }
}
