//! Server Configuration
//!
//! How to reach one tool server. Deserialises from JSON/TOML so the caller
//! can keep server definitions in whatever store it owns.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use agent_core::{AgentError, Result};

/// Which transport to use and its endpoint
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport_kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Spawn a child process and talk over its stdin/stdout
    Process {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },

    /// Long-lived event stream plus a POST endpoint it announces
    Stream { url: String },

    /// One POST round-trip per message
    Request { url: String },
}

/// Credentials sent with HTTP transports
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Configuration for one tool server
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name used in logs
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(flatten)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub auth: Option<AuthConfig>,

    /// Budget for each request/response exchange
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Budget for transport connect plus handshake
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_name() -> String {
    "tool-server".into()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl ServerConfig {
    /// Local server launched as a child process
    pub fn process<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = command.into();
        Self::with_transport(
            command.clone(),
            TransportConfig::Process {
                command,
                args: args.into_iter().map(Into::into).collect(),
                env: HashMap::new(),
                cwd: None,
            },
        )
    }

    /// Remote server over an event stream
    pub fn stream(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::with_transport(url.clone(), TransportConfig::Stream { url })
    }

    /// Remote server over plain request/response HTTP
    pub fn request(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::with_transport(url.clone(), TransportConfig::Request { url })
    }

    fn with_transport(name: String, transport: TransportConfig) -> Self {
        Self {
            name,
            transport,
            auth: None,
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let TransportConfig::Process { env, .. } = &mut self.transport {
            env.insert(key.into(), value.into());
        }
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Parse from a JSON document
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| AgentError::Config(format!("invalid server config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.transport {
            TransportConfig::Process { command, .. } if command.trim().is_empty() => {
                Err(AgentError::Config("process transport needs a command".into()))
            }
            TransportConfig::Stream { url } | TransportConfig::Request { url } => {
                reqwest::Url::parse(url)
                    .map(|_| ())
                    .map_err(|e| AgentError::Config(format!("invalid server url '{}': {}", url, e)))
            }
            _ => Ok(()),
        }
    }
}
