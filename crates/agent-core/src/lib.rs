//! # agent-core
//!
//! Provider-agnostic agent loop over a tool-serving session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         AgentLoop                             │
//! │  ┌─────────────┐   ┌──────────────┐   ┌────────────────────┐  │
//! │  │ Transcript  │───│  Reasoning   │───│    LlmProvider     │  │
//! │  │ (append-    │   │    Loop      │   │    (Strategy)      │  │
//! │  │  only)      │   └──────┬───────┘   └────────────────────┘  │
//! │  └─────────────┘          │                                   │
//! │                    ┌──────┴───────┐                           │
//! │                    │ ToolSession  │  (tool server session)    │
//! │                    └──────────────┘                           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait hides the OpenAI/Claude/Bedrock request shapes;
//! `ToolSession` hides which transport the tool server is reached over.

pub mod error;
pub mod message;
pub mod provider;
pub mod reasoning;
pub mod tool;

pub use error::{AgentError, Result};
pub use message::{Message, Transcript};
pub use provider::{Completion, GenerationOptions, LlmProvider, Outcome, TokenUsage};
pub use reasoning::{AgentBuilder, AgentConfig, AgentLoop, AgentResponse, LoopState, ToolCallRecord, ToolInfo};
pub use tool::{ToolArguments, ToolCallRequest, ToolCallResult, ToolCatalogue, ToolDescriptor, ToolSession};
