//! Protocol Session
//!
//! Owns one transport, runs the initialization handshake and exposes the
//! discovery and invocation primitives. One request is in flight at a time;
//! the transport sits behind an async mutex so a cancelled call releases it
//! and its late reply is discarded by id on the next exchange.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use agent_core::{AgentError, Result, ToolArguments, ToolCallResult, ToolCatalogue, ToolDescriptor, ToolSession};

use crate::config::ServerConfig;
use crate::protocol::{
    CallToolResult, GetPromptResult, Implementation, InitializeResult, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND, McpTool, PROTOCOL_VERSION, Page, Prompt,
    ReadResourceResult, Resource, ServerCapabilities,
};
use crate::transport::{self, Transport};

const CLIENT_NAME: &str = "mcp-agent";

/// Protocol revisions this client can talk to
const SUPPORTED_VERSIONS: &[&str] = &[PROTOCOL_VERSION, "2025-03-26", "2025-06-18"];

/// Lifecycle of a session. `Closed` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Initializing => "initializing",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Client session with one tool server
pub struct McpSession {
    config: ServerConfig,
    transport: Mutex<Box<dyn Transport>>,
    state: RwLock<SessionState>,
    next_id: AtomicI64,
    server: RwLock<Option<InitializeResult>>,
    tools: RwLock<Arc<ToolCatalogue>>,
    resources: RwLock<Arc<Vec<Resource>>>,
    prompts: RwLock<Arc<Vec<Prompt>>>,
}

impl McpSession {
    /// Session over the transport `config` describes, not yet connected
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let transport = transport::from_config(&config)?;
        Ok(Self::with_transport(config, transport))
    }

    /// Session over a caller-supplied transport
    pub fn with_transport(config: ServerConfig, transport: Box<dyn Transport>) -> Self {
        Self {
            config,
            transport: Mutex::new(transport),
            state: RwLock::new(SessionState::Uninitialized),
            next_id: AtomicI64::new(1),
            server: RwLock::new(None),
            tools: RwLock::new(Arc::new(ToolCatalogue::default())),
            resources: RwLock::new(Arc::new(Vec::new())),
            prompts: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Connect the transport and run the handshake. Attempted exactly once
    /// per session; a failed session must be replaced, not reconnected.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            if *state != SessionState::Uninitialized {
                return Err(AgentError::InvalidState(format!(
                    "session '{}' cannot connect from state {}",
                    self.config.name, *state
                )));
            }
            *state = SessionState::Initializing;
        }

        let mut transport = self.transport.lock().await;
        let limit = self.config.connect_timeout();
        let outcome = match tokio::time::timeout(limit, self.handshake(&mut **transport)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AgentError::Timeout(format!(
                "handshake with '{}' exceeded {:?}",
                self.config.name, limit
            ))),
        };

        match outcome {
            Ok(manifest) => {
                info!(
                    server = %self.config.name,
                    name = %manifest.server_info.name,
                    version = %manifest.server_info.version,
                    protocol = %manifest.protocol_version,
                    "Session ready"
                );
                *self.server.write().unwrap_or_else(PoisonError::into_inner) = Some(manifest);
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                warn!(server = %self.config.name, error = %e, "Handshake failed");
                self.set_state(SessionState::Failed);
                if let Err(close_err) = transport.close().await {
                    debug!(server = %self.config.name, "Failed to close transport: {}", close_err);
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self, transport: &mut dyn Transport) -> Result<InitializeResult> {
        transport.connect().await?;

        let request = JsonRpcRequest::initialize(self.next_id(), CLIENT_NAME);
        let response = exchange(transport, request, self.config.connect_timeout(), &self.config.name).await?;
        let manifest: InitializeResult = response
            .into_result("initialize")
            .map_err(|e| AgentError::Handshake(format!("{}: {}", self.config.name, e)))?;

        if !SUPPORTED_VERSIONS.contains(&manifest.protocol_version.as_str()) {
            return Err(AgentError::Handshake(format!(
                "{} speaks unsupported protocol version {}",
                self.config.name, manifest.protocol_version
            )));
        }

        transport.send(&JsonRpcNotification::initialized().into()).await?;
        Ok(manifest)
    }

    /// Discover every tool, replacing the cached catalogue in one step
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let tools: Vec<McpTool> = self.list_all("tools/list").await?;
        let descriptors: Vec<ToolDescriptor> = tools.into_iter().map(Into::into).collect();
        debug!(server = %self.config.name, count = descriptors.len(), "Discovered tools");

        *self.tools.write().unwrap_or_else(PoisonError::into_inner) =
            Arc::new(ToolCatalogue::new(descriptors.clone()));
        Ok(descriptors)
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>> {
        let resources: Vec<Resource> = self.list_all("resources/list").await?;
        *self.resources.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(resources.clone());
        Ok(resources)
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let prompts: Vec<Prompt> = self.list_all("prompts/list").await?;
        *self.prompts.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(prompts.clone());
        Ok(prompts)
    }

    /// Invoke a tool from the last discovered catalogue.
    ///
    /// A failure the server reports for the tool comes back as an `is_error`
    /// result. Names missing from the catalogue fail with `UnknownTool`
    /// before anything is sent.
    pub async fn call_tool(&self, name: &str, arguments: ToolArguments) -> Result<ToolCallResult> {
        self.ensure_ready()?;
        if !self.tools().contains(name) {
            return Err(AgentError::UnknownTool(name.to_string()));
        }

        let id = self.next_id();
        let started = Instant::now();
        let response = self.request(JsonRpcRequest::call_tool(id, name, &arguments)).await?;
        let correlation = id.to_string();

        if let Some(err) = response.error {
            warn!(server = %self.config.name, tool = name, code = err.code, "Tool call rejected: {}", err.message);
            return Ok(ToolCallResult::failure(
                correlation,
                format!("{} (code {})", err.message, err.code),
            ));
        }

        let result: CallToolResult = serde_json::from_value(response.result.unwrap_or(Value::Null))
            .map_err(|e| AgentError::Protocol(format!("unexpected tools/call result: {}", e)))?;
        debug!(
            server = %self.config.name,
            tool = name,
            is_error = result.is_error,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Tool call finished"
        );

        Ok(ToolCallResult {
            id: correlation,
            content: Value::Array(result.content),
            is_error: result.is_error,
        })
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult> {
        self.ensure_ready()?;
        let response = self.request(JsonRpcRequest::read_resource(self.next_id(), uri)).await?;
        response.into_result("resources/read")
    }

    /// Expand a prompt template with the given arguments
    pub async fn get_prompt(&self, name: &str, arguments: ToolArguments) -> Result<GetPromptResult> {
        self.ensure_ready()?;
        let response = self.request(JsonRpcRequest::get_prompt(self.next_id(), name, &arguments)).await?;
        response.into_result("prompts/get")
    }

    /// Liveness check
    pub async fn ping(&self) -> Result<()> {
        self.ensure_ready()?;
        let response = self.request(JsonRpcRequest::ping(self.next_id())).await?;
        response.into_result::<Value>("ping").map(|_| ())
    }

    /// Close the session and its transport. Idempotent; safe on a failed
    /// session.
    pub async fn close(&self) -> Result<()> {
        let previous = std::mem::replace(
            &mut *self.state.write().unwrap_or_else(PoisonError::into_inner),
            SessionState::Closed,
        );
        if previous == SessionState::Closed {
            return Ok(());
        }
        debug!(server = %self.config.name, from = %previous, "Closing session");
        self.transport.lock().await.close().await
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Server identity from the handshake
    pub fn server_info(&self) -> Option<Implementation> {
        self.manifest(|m| m.server_info.clone())
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.manifest(|m| m.capabilities.clone())
    }

    /// Usage hints the server sent with its manifest
    pub fn instructions(&self) -> Option<String> {
        self.manifest(|m| m.instructions.clone()).flatten()
    }

    /// Last discovered tool catalogue
    pub fn tools(&self) -> Arc<ToolCatalogue> {
        Arc::clone(&self.tools.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn resources(&self) -> Arc<Vec<Resource>> {
        Arc::clone(&self.resources.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn prompts(&self) -> Arc<Vec<Prompt>> {
        Arc::clone(&self.prompts.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn manifest<T>(&self, f: impl FnOnce(&InitializeResult) -> T) -> Option<T> {
        self.server.read().unwrap_or_else(PoisonError::into_inner).as_ref().map(f)
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// `Ready` -> `Failed`. A session already closed stays closed.
    fn fail_if_ready(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state == SessionState::Ready {
            *state = SessionState::Failed;
            true
        } else {
            false
        }
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            SessionState::Ready => Ok(()),
            other => Err(AgentError::InvalidState(format!(
                "session '{}' is {}",
                self.config.name, other
            ))),
        }
    }

    async fn list_all<T: DeserializeOwned>(&self, method: &str) -> Result<Vec<T>> {
        self.ensure_ready()?;
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let request = JsonRpcRequest::list(self.next_id(), method, cursor.as_deref());
            let page: Page<T> = self.request(request).await?.into_result(method)?;
            items.extend(page.items);

            match page.next_cursor {
                Some(next) if !next.is_empty() => {
                    if cursor.as_deref() == Some(next.as_str()) {
                        return Err(AgentError::Protocol(format!("{} repeated cursor '{}'", method, next)));
                    }
                    cursor = Some(next);
                }
                _ => return Ok(items),
            }
        }
    }

    /// One exchange on the shared transport. A channel failure fails the
    /// session and releases the transport; a timeout leaves it usable.
    async fn request(&self, request: JsonRpcRequest) -> Result<JsonRpcResponse> {
        let mut transport = self.transport.lock().await;
        let result = exchange(&mut **transport, request, self.config.request_timeout(), &self.config.name).await;

        if let Err(e) = &result {
            if e.is_transport() && self.fail_if_ready() {
                warn!(server = %self.config.name, error = %e, "Transport failed, session is no longer usable");
                if let Err(close_err) = transport.close().await {
                    debug!(server = %self.config.name, "Failed to close transport: {}", close_err);
                }
            }
        }
        result
    }
}

/// Send `request` and wait for the response carrying its id, all within
/// `limit`.
///
/// Replies to abandoned requests are dropped, server pings answered, other
/// server requests refused and notifications logged.
async fn exchange(
    transport: &mut dyn Transport,
    request: JsonRpcRequest,
    limit: Duration,
    server: &str,
) -> Result<JsonRpcResponse> {
    let method = request.method.clone();
    tokio::time::timeout(limit, send_and_await(transport, request, server))
        .await
        .unwrap_or_else(|_| Err(AgentError::Timeout(format!("{} to {} exceeded {:?}", method, server, limit))))
}

async fn send_and_await(
    transport: &mut dyn Transport,
    request: JsonRpcRequest,
    server: &str,
) -> Result<JsonRpcResponse> {
    let id = request.id.clone();
    debug!(server, %id, method = %request.method, "Sending request");
    transport.send(&request.into()).await?;

    loop {
        match transport.receive(None).await? {
            JsonRpcMessage::Response(response) if response.id == id => return Ok(response),
            JsonRpcMessage::Response(stale) => {
                debug!(server, id = %stale.id, "Discarding response to an abandoned request");
            }
            JsonRpcMessage::Request(inbound) => {
                let reply = if inbound.method == "ping" {
                    JsonRpcResponse::success(inbound.id, serde_json::json!({}))
                } else {
                    debug!(server, method = %inbound.method, "Refusing server request");
                    JsonRpcResponse::failure(inbound.id, METHOD_NOT_FOUND, format!("Method not found: {}", inbound.method))
                };
                transport.send(&reply.into()).await?;
            }
            JsonRpcMessage::Notification(notification) => {
                debug!(server, method = %notification.method, "Server notification");
            }
        }
    }
}

#[async_trait]
impl ToolSession for McpSession {
    fn catalogue(&self) -> Arc<ToolCatalogue> {
        self.tools()
    }

    async fn call_tool(&self, name: &str, arguments: ToolArguments) -> Result<ToolCallResult> {
        McpSession::call_tool(self, name, arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use crate::transport::TransportKind;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    type Responder = Box<dyn FnMut(&JsonRpcRequest) -> Vec<Result<JsonRpcMessage>> + Send>;

    /// In-memory server: every request sent is answered by `responder`
    struct FakeTransport {
        sent: Arc<StdMutex<Vec<JsonRpcMessage>>>,
        queue: VecDeque<Result<JsonRpcMessage>>,
        responder: Responder,
        closed: Arc<StdMutex<bool>>,
        /// Tool whose invocation stalls `send` after its replies are queued
        stall: Option<(&'static str, Duration)>,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Process
        }

        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn send(&mut self, message: &JsonRpcMessage) -> Result<()> {
            if *self.closed.lock().unwrap() {
                return Err(AgentError::Transport("closed".into()));
            }
            self.sent.lock().unwrap().push(message.clone());
            if let JsonRpcMessage::Request(request) = message {
                let replies = (self.responder)(request);
                self.queue.extend(replies);
                if let Some((tool, delay)) = self.stall {
                    let target = request.params.as_ref().and_then(|p| p.get("name")).and_then(Value::as_str);
                    if request.method == "tools/call" && target == Some(tool) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
            Ok(())
        }

        async fn receive(&mut self, _timeout: Option<Duration>) -> Result<JsonRpcMessage> {
            self.queue
                .pop_front()
                .unwrap_or_else(|| Err(AgentError::Timeout("no reply".into())))
        }

        async fn close(&mut self) -> Result<()> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    struct Harness {
        session: McpSession,
        sent: Arc<StdMutex<Vec<JsonRpcMessage>>>,
        closed: Arc<StdMutex<bool>>,
    }

    impl Harness {
        fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    fn reply(request: &JsonRpcRequest, result: Value) -> Result<JsonRpcMessage> {
        Ok(JsonRpcResponse::success(request.id.clone(), result).into())
    }

    fn manifest() -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "fake", "version": "0.1.0"},
            "instructions": "be nice"
        })
    }

    fn tool(name: &str) -> Value {
        json!({"name": name, "description": name, "inputSchema": {"type": "object"}})
    }

    fn harness(handler: impl FnMut(&JsonRpcRequest) -> Vec<Result<JsonRpcMessage>> + Send + 'static) -> Harness {
        stalled_harness(None, handler)
    }

    fn stalled_harness(
        stall: Option<(&'static str, Duration)>,
        mut handler: impl FnMut(&JsonRpcRequest) -> Vec<Result<JsonRpcMessage>> + Send + 'static,
    ) -> Harness {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(StdMutex::new(false));
        let transport = FakeTransport {
            sent: Arc::clone(&sent),
            queue: VecDeque::new(),
            responder: Box::new(move |request| match request.method.as_str() {
                "initialize" => vec![reply(request, manifest())],
                _ => handler(request),
            }),
            closed: Arc::clone(&closed),
            stall,
        };
        let config = ServerConfig::process("fake", Vec::<String>::new()).with_request_timeout(Duration::from_secs(1));
        Harness {
            session: McpSession::with_transport(config, Box::new(transport)),
            sent,
            closed,
        }
    }

    fn calculator() -> Harness {
        harness(|request| match request.method.as_str() {
            "tools/list" => vec![reply(request, json!({"tools": [tool("add")]}))],
            "tools/call" => {
                let params = request.params.clone().unwrap_or_default();
                let a = params["arguments"]["a"].as_i64().unwrap_or(0);
                let b = params["arguments"]["b"].as_i64().unwrap_or(0);
                vec![reply(request, json!({"content": [{"type": "text", "text": (a + b).to_string()}]}))]
            }
            _ => vec![],
        })
    }

    fn args(value: Value) -> ToolArguments {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_handshake() {
        let h = calculator();
        assert_eq!(h.session.state(), SessionState::Uninitialized);
        assert!(matches!(h.session.list_tools().await, Err(AgentError::InvalidState(_))));

        h.session.connect().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Ready);
        assert_eq!(h.session.server_info().unwrap().name, "fake");
        assert!(h.session.capabilities().unwrap().supports_tools());
        assert_eq!(h.session.instructions().as_deref(), Some("be nice"));

        let sent = h.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert!(matches!(&sent[1], JsonRpcMessage::Notification(n) if n.method == "notifications/initialized"));

        assert!(matches!(h.session.connect().await, Err(AgentError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_malformed_manifest_fails_handshake() {
        let sent = Arc::new(StdMutex::new(Vec::new()));
        let closed = Arc::new(StdMutex::new(false));
        let transport = FakeTransport {
            sent,
            queue: VecDeque::new(),
            responder: Box::new(|request| vec![reply(request, json!({"unexpected": true}))]),
            closed: Arc::clone(&closed),
            stall: None,
        };
        let session = McpSession::with_transport(ServerConfig::process("fake", Vec::<String>::new()), Box::new(transport));

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, AgentError::Handshake(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(*closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_call_tool() {
        let h = calculator();
        h.session.connect().await.unwrap();
        let tools = h.session.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "add");

        let result = h.session.call_tool("add", args(json!({"a": 5, "b": 3}))).await.unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "8");
    }

    #[tokio::test]
    async fn test_unknown_tool_sends_nothing() {
        let h = calculator();
        h.session.connect().await.unwrap();
        h.session.list_tools().await.unwrap();
        let before = h.sent_count();

        let err = h.session.call_tool("nonexistent", ToolArguments::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::UnknownTool(ref name) if name == "nonexistent"));
        assert_eq!(h.sent_count(), before);
    }

    #[tokio::test]
    async fn test_pagination_and_atomic_replacement() {
        let mut listings = 0;
        let h = harness(move |request| match request.method.as_str() {
            "tools/list" => {
                let cursor = request.params.as_ref().and_then(|p| p.get("cursor")).cloned();
                let page = match (listings, cursor) {
                    (0, None) => json!({"tools": [tool("add")], "nextCursor": "p2"}),
                    (0, Some(_)) => {
                        listings += 1;
                        json!({"tools": [tool("multiply")]})
                    }
                    _ => json!({"tools": [tool("echo")]}),
                };
                vec![reply(request, page)]
            }
            "tools/call" => vec![reply(request, json!({"content": []}))],
            _ => vec![],
        });
        h.session.connect().await.unwrap();

        let first = h.session.list_tools().await.unwrap();
        assert_eq!(first.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(), vec!["add", "multiply"]);
        assert!(h.session.call_tool("multiply", ToolArguments::new()).await.is_ok());

        let second = h.session.list_tools().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(h.session.tools().names(), vec!["echo"]);
        assert!(matches!(
            h.session.call_tool("add", ToolArguments::new()).await,
            Err(AgentError::UnknownTool(_))
        ));
    }

    #[tokio::test]
    async fn test_server_failures_become_error_results() {
        let h = harness(|request| match request.method.as_str() {
            "tools/list" => vec![reply(request, json!({"tools": [tool("divide"), tool("broken")]}))],
            "tools/call" if request.params.as_ref().unwrap()["name"] == "divide" => vec![reply(
                request,
                json!({"content": [{"type": "text", "text": "Division by zero"}], "isError": true}),
            )],
            "tools/call" => vec![Ok(JsonRpcResponse::failure(request.id.clone(), -32603, "internal").into())],
            _ => vec![],
        });
        h.session.connect().await.unwrap();
        h.session.list_tools().await.unwrap();

        let result = h.session.call_tool("divide", ToolArguments::new()).await.unwrap();
        assert!(result.is_error);
        assert_eq!(result.text(), "Division by zero");

        let result = h.session.call_tool("broken", ToolArguments::new()).await.unwrap();
        assert!(result.is_error);
        assert!(result.text().contains("internal"));
        assert_eq!(h.session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_stale_replies_and_server_requests() {
        let h = harness(|request| match request.method.as_str() {
            "ping" => vec![
                Ok(JsonRpcResponse::success(RequestId::Number(999), json!({})).into()),
                Ok(JsonRpcNotification::new("notifications/message", None).into()),
                Ok(JsonRpcRequest::new(77, "ping", None).into()),
                Ok(JsonRpcRequest::new(78, "sampling/createMessage", None).into()),
                reply(request, json!({})),
            ],
            _ => vec![],
        });
        h.session.connect().await.unwrap();
        h.session.ping().await.unwrap();

        let sent = h.sent.lock().unwrap().clone();
        let answers: Vec<&JsonRpcResponse> = sent
            .iter()
            .filter_map(|m| match m {
                JsonRpcMessage::Response(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].id, RequestId::Number(77));
        assert!(answers[0].error.is_none());
        assert_eq!(answers[1].error.as_ref().unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_timeout_keeps_session_ready() {
        let h = harness(|request| match request.method.as_str() {
            "tools/list" => vec![reply(request, json!({"tools": [tool("slow")]}))],
            _ => vec![],
        });
        h.session.connect().await.unwrap();
        h.session.list_tools().await.unwrap();

        let err = h.session.call_tool("slow", ToolArguments::new()).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
        assert_eq!(h.session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_transport_drop_fails_session() {
        let h = harness(|request| match request.method.as_str() {
            "tools/list" => vec![reply(request, json!({"tools": [tool("add")]}))],
            _ => vec![Err(AgentError::TransportClosed("server exited".into()))],
        });
        h.session.connect().await.unwrap();
        h.session.list_tools().await.unwrap();

        let err = h.session.call_tool("add", ToolArguments::new()).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(h.session.state(), SessionState::Failed);
        assert!(*h.closed.lock().unwrap());
        assert!(matches!(
            h.session.call_tool("add", ToolArguments::new()).await,
            Err(AgentError::InvalidState(_))
        ));

        h.session.close().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let h = calculator();
        h.session.connect().await.unwrap();
        h.session.close().await.unwrap();
        h.session.close().await.unwrap();
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(*h.closed.lock().unwrap());
        assert!(matches!(h.session.ping().await, Err(AgentError::InvalidState(_))));
    }

    fn echo_args(request: &JsonRpcRequest) -> Result<JsonRpcMessage> {
        let params = request.params.clone().unwrap_or_default();
        let text = params["arguments"]["text"].as_str().unwrap_or_default().to_string();
        reply(request, json!({"content": [{"type": "text", "text": text}]}))
    }

    fn echo_with_slow() -> Harness {
        stalled_harness(Some(("slow", Duration::from_secs(3))), |request| match request.method.as_str() {
            "tools/list" => vec![reply(request, json!({"tools": [tool("slow"), tool("echo")]}))],
            "tools/call" => vec![echo_args(request)],
            _ => vec![],
        })
    }

    #[tokio::test]
    async fn test_stalled_send_is_bounded_by_request_timeout() {
        let h = echo_with_slow();
        h.session.connect().await.unwrap();
        h.session.list_tools().await.unwrap();

        let started = Instant::now();
        let err = h.session.call_tool("slow", args(json!({"text": "late"}))).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(h.session.state(), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_leak_into_next() {
        let h = echo_with_slow();
        h.session.connect().await.unwrap();
        h.session.list_tools().await.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            h.session.call_tool("slow", args(json!({"text": "late"}))),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(h.session.state(), SessionState::Ready);

        // the abandoned call's reply is still queued ahead of this one
        let result = h.session.call_tool("echo", args(json!({"text": "fresh"}))).await.unwrap();
        assert_eq!(result.text(), "fresh");
        let again = h.session.call_tool("echo", args(json!({"text": "again"}))).await.unwrap();
        assert_eq!(again.text(), "again");
    }

    #[tokio::test]
    async fn test_transport_error_after_close_keeps_closed() {
        let h = stalled_harness(Some(("add", Duration::from_millis(200))), |request| match request.method.as_str() {
            "tools/list" => vec![reply(request, json!({"tools": [tool("add")]}))],
            _ => vec![Err(AgentError::TransportClosed("server exited".into()))],
        });
        h.session.connect().await.unwrap();
        h.session.list_tools().await.unwrap();

        let (call, closed) = tokio::join!(h.session.call_tool("add", ToolArguments::new()), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.session.close().await
        });
        assert!(call.unwrap_err().is_transport());
        closed.unwrap();
        assert_eq!(h.session.state(), SessionState::Closed);
        assert!(*h.closed.lock().unwrap());
    }
}
