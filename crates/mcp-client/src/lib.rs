//! # mcp-client
//!
//! Client side of the tool-serving protocol.
//!
//! ```text
//!   McpSession ── handshake, discovery, tools/call, stale-reply filtering
//!       │
//!   Transport  ── Process (child stdin/stdout)
//!                 Stream  (event stream + POST endpoint)
//!                 Request (one POST per message)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mcp_client::{McpSession, ServerConfig};
//!
//! let session = McpSession::new(ServerConfig::process("python", ["server.py"]))?;
//! session.connect().await?;
//! let tools = session.list_tools().await?;
//! let result = session.call_tool("add", args).await?;
//! session.close().await?;
//! ```

pub mod config;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::{AuthConfig, ServerConfig, TransportConfig};
pub use protocol::{
    GetPromptResult, Implementation, Prompt, PromptArgument, PromptMessage, ReadResourceResult, Resource,
    ResourceContents, ServerCapabilities,
};
pub use session::{McpSession, SessionState};
pub use transport::{HttpTransport, SseTransport, StdioTransport, Transport, TransportKind};
