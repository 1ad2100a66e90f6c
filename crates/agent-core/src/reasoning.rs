//! Reasoning Loop
//!
//! Drives the observe → act → feed back cycle: ask the provider, execute
//! whatever tools it requests (sequentially, in the order returned), append
//! the results and ask again until it produces a final answer or the
//! iteration ceiling is reached.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::message::{Message, Transcript};
use crate::provider::{GenerationOptions, LlmProvider, Outcome};
use crate::tool::{ToolArguments, ToolCallRequest, ToolCallResult, ToolCatalogue, ToolSession};

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Maximum tool-call rounds per turn before giving up
    pub iteration_ceiling: usize,

    /// Generation options (model, sampling, system prompt)
    pub generation: GenerationOptions,

    /// Upper bound on a single inference call
    pub inference_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            iteration_ceiling: 10,
            generation: GenerationOptions {
                system_prompt: Some(DEFAULT_SYSTEM_PROMPT.into()),
                ..GenerationOptions::default()
            },
            inference_timeout: DEFAULT_INFERENCE_TIMEOUT,
        }
    }
}

const DEFAULT_INFERENCE_TIMEOUT: Duration = Duration::from_secs(180);

/// Category for tools whose names carry no namespace
const GENERAL_CATEGORY: &str = "general";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant with access to tools. \
Use a tool when it helps answer the question, then synthesize the results into a concise answer. \
If a tool fails, explain the failure or try another approach.";

/// Where the loop is in the current turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    AwaitingModel,
    AwaitingTools,
    Done,
    Error,
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoopState::Idle => "idle",
            LoopState::AwaitingModel => "awaiting_model",
            LoopState::AwaitingTools => "awaiting_tools",
            LoopState::Done => "done",
            LoopState::Error => "error",
        };
        f.write_str(s)
    }
}

/// One tool execution made during a turn
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub arguments: ToolArguments,
    pub result: ToolCallResult,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ToolCallRecord {
    /// Whether the tool ran without reporting an error
    pub fn succeeded(&self) -> bool {
        !self.result.is_error
    }
}

/// Result of a completed `chat()` turn
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentResponse {
    /// Final answer text
    pub response: String,

    /// Tool executions in the order they ran
    pub tool_calls_made: Vec<ToolCallRecord>,

    /// Inference calls made this turn
    pub iterations: usize,

    /// Sum of provider-reported token usage
    pub tokens_used: u32,

    pub execution_time_ms: u64,
}

/// Catalogue summary
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInfo {
    pub total_tools: usize,
    pub names: Vec<String>,
    /// Tool names grouped by namespace prefix (`math.add` → `math`)
    pub tools_by_category: BTreeMap<String, Vec<String>>,
}

/// The main agent loop.
///
/// Owns the transcript; borrows the session and provider through `Arc`s so
/// both can outlive it.
pub struct AgentLoop {
    id: Uuid,
    session: Arc<dyn ToolSession>,
    provider: Arc<dyn LlmProvider>,
    config: AgentConfig,
    transcript: RwLock<Transcript>,
    state: Mutex<LoopState>,
    turn: tokio::sync::Mutex<()>,
}

impl AgentLoop {
    /// Create a new agent loop with an empty transcript
    pub fn new(
        session: Arc<dyn ToolSession>,
        provider: Arc<dyn LlmProvider>,
        config: AgentConfig,
    ) -> Self {
        Self::resume(session, provider, config, Transcript::new())
    }

    /// Create with default configuration
    pub fn with_defaults(session: Arc<dyn ToolSession>, provider: Arc<dyn LlmProvider>) -> Self {
        Self::new(session, provider, AgentConfig::default())
    }

    /// Continue a saved conversation
    pub fn resume(
        session: Arc<dyn ToolSession>,
        provider: Arc<dyn LlmProvider>,
        config: AgentConfig,
        transcript: Transcript,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session,
            provider,
            config,
            transcript: RwLock::new(transcript),
            state: Mutex::new(LoopState::Idle),
            turn: tokio::sync::Mutex::new(()),
        }
    }

    /// Run one conversation turn.
    ///
    /// Fails fast with [`AgentError::Busy`] if another turn is in progress.
    /// Every failure leaves the messages appended so far in place.
    pub async fn chat(&self, user_text: impl Into<String>) -> Result<AgentResponse> {
        let _turn = self.turn.try_lock().map_err(|_| AgentError::Busy)?;
        let started = Instant::now();

        self.close_unanswered_calls();
        self.append(Message::user(user_text));

        let mut records = Vec::new();
        let mut tokens_used: u32 = 0;

        for round in 1..=self.config.iteration_ceiling {
            self.set_state(LoopState::AwaitingModel);
            let catalogue = self.session.catalogue();
            let transcript = self.history();

            tracing::debug!(agent = %self.id, round, provider = self.provider.name(), "Requesting inference");
            let completion = match self.infer(&transcript, &catalogue).await {
                Ok(completion) => completion,
                Err(e) => return Err(self.abort(e)),
            };
            tokens_used = tokens_used.saturating_add(completion.usage.map_or(0, |u| u.total_tokens));

            let mut calls = match completion.outcome {
                Outcome::ToolCalls(calls) if !calls.is_empty() => calls,
                Outcome::ToolCalls(_) => return Ok(self.finish(String::new(), records, round, tokens_used, started)),
                Outcome::FinalAnswer(text) => return Ok(self.finish(text, records, round, tokens_used, started)),
            };

            ensure_unique_ids(&mut calls);
            self.append(Message::tool_calls(calls.clone()));
            self.set_state(LoopState::AwaitingTools);

            for call in calls {
                let started_at = Utc::now();
                let call_started = Instant::now();
                let result = match self.execute_call(&call, &catalogue).await {
                    Ok(result) => result,
                    Err(e) => return Err(self.abort(e)),
                };
                self.append(Message::tool_result(result.clone()));
                records.push(ToolCallRecord {
                    id: call.id,
                    name: call.name,
                    arguments: call.arguments,
                    result,
                    started_at,
                    duration_ms: elapsed_ms(call_started),
                });
            }
        }

        tracing::warn!(agent = %self.id, ceiling = self.config.iteration_ceiling, "Tool-call loop limit exceeded");
        self.set_state(LoopState::Error);
        Err(AgentError::LoopLimitExceeded(self.config.iteration_ceiling))
    }

    /// Clear the transcript. The session stays open.
    pub fn reset(&self) -> Result<()> {
        let _turn = self.turn.try_lock().map_err(|_| AgentError::Busy)?;
        self.transcript
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.set_state(LoopState::Idle);
        Ok(())
    }

    /// Snapshot of the transcript
    pub fn history(&self) -> Vec<Message> {
        self.transcript
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .messages()
            .to_vec()
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run a tool without involving the model. The transcript is untouched.
    ///
    /// Failures the tool reports come back in the record; check
    /// [`ToolCallRecord::succeeded`].
    pub async fn execute_tool(&self, name: &str, arguments: ToolArguments) -> Result<ToolCallRecord> {
        let started_at = Utc::now();
        let started = Instant::now();
        let result = self.session.call_tool(name, arguments.clone()).await?;
        let record = ToolCallRecord {
            id: result.id.clone(),
            name: name.to_string(),
            arguments,
            result,
            started_at,
            duration_ms: elapsed_ms(started),
        };
        tracing::debug!(tool = name, success = record.succeeded(), duration_ms = record.duration_ms, "Direct tool execution");
        Ok(record)
    }

    pub fn tool_info(&self) -> ToolInfo {
        let catalogue = self.session.catalogue();
        let names: Vec<String> = catalogue.names().into_iter().map(String::from).collect();
        let mut tools_by_category: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for name in &names {
            tools_by_category
                .entry(tool_category(name).to_string())
                .or_default()
                .push(name.clone());
        }
        ToolInfo {
            total_tools: catalogue.len(),
            names,
            tools_by_category,
        }
    }

    /// Get configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    async fn infer(
        &self,
        transcript: &[Message],
        catalogue: &ToolCatalogue,
    ) -> Result<crate::provider::Completion> {
        let limit = self.config.inference_timeout;
        tokio::time::timeout(limit, self.provider.infer(transcript, catalogue, &self.config.generation))
            .await
            .map_err(|_| AgentError::Timeout(format!("inference exceeded {:?}", limit)))?
    }

    /// Execute a tool call. Unknown tools become error results so the
    /// model can correct itself; anything else that fails aborts the turn.
    async fn execute_call(&self, call: &ToolCallRequest, catalogue: &ToolCatalogue) -> Result<ToolCallResult> {
        if !catalogue.contains(&call.name) {
            tracing::warn!(tool = %call.name, "Model requested a tool that is not in the catalogue");
            return Ok(ToolCallResult::failure(&call.id, format!("Unknown tool: {}", call.name)));
        }

        tracing::debug!(tool = %call.name, id = %call.id, "Executing tool");
        match self.session.call_tool(&call.name, call.arguments.clone()).await {
            Ok(mut result) => {
                result.id = call.id.clone();
                if result.is_error {
                    tracing::debug!(tool = %call.name, "Tool reported an error");
                }
                Ok(result)
            }
            Err(AgentError::UnknownTool(name)) => {
                Ok(ToolCallResult::failure(&call.id, format!("Unknown tool: {}", name)))
            }
            Err(e) => Err(e),
        }
    }

    /// Calls left without results by an aborted turn get an error result so
    /// the next inference sees every request answered.
    fn close_unanswered_calls(&self) {
        let mut transcript = self.transcript.write().unwrap_or_else(PoisonError::into_inner);
        for call in transcript.unanswered_calls() {
            tracing::debug!(tool = %call.name, id = %call.id, "Closing interrupted tool call");
            transcript.push(Message::tool_result(ToolCallResult::failure(
                call.id,
                "Tool call was interrupted before it completed",
            )));
        }
    }

    fn finish(
        &self,
        text: String,
        records: Vec<ToolCallRecord>,
        iterations: usize,
        tokens_used: u32,
        started: Instant,
    ) -> AgentResponse {
        self.append(Message::assistant(text.clone()));
        self.set_state(LoopState::Done);
        AgentResponse {
            response: text,
            tool_calls_made: records,
            iterations,
            tokens_used,
            execution_time_ms: elapsed_ms(started),
        }
    }

    fn abort(&self, error: AgentError) -> AgentError {
        tracing::warn!(agent = %self.id, error = %error, "Turn aborted");
        self.set_state(LoopState::Error);
        error
    }

    fn append(&self, message: Message) {
        self.transcript
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }

    fn set_state(&self, state: LoopState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Give every call in one model turn a distinct, non-empty id. Results are
/// correlated by id, so a blank or repeated one is replaced.
fn ensure_unique_ids(calls: &mut [ToolCallRequest]) {
    let mut seen = HashSet::new();
    for call in calls.iter_mut() {
        if call.id.trim().is_empty() || seen.contains(&call.id) {
            let id = format!("call_{}", Uuid::new_v4().simple());
            tracing::debug!(tool = %call.name, original = %call.id, %id, "Assigned correlation id");
            call.id = id;
        }
        seen.insert(call.id.clone());
    }
}

/// Namespace prefix of a tool name, split at the first `.`, `/` or `:`
fn tool_category(name: &str) -> &str {
    match name.split_once(['.', '/', ':']) {
        Some((prefix, _)) if !prefix.is_empty() => prefix,
        _ => GENERAL_CATEGORY,
    }
}

/// Builder for Agent configuration
pub struct AgentBuilder {
    session: Option<Arc<dyn ToolSession>>,
    provider: Option<Arc<dyn LlmProvider>>,
    transcript: Transcript,
    config: AgentConfig,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self {
            session: None,
            provider: None,
            transcript: Transcript::new(),
            config: AgentConfig::default(),
        }
    }

    pub fn session(mut self, session: Arc<dyn ToolSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn generation(mut self, generation: GenerationOptions) -> Self {
        self.config.generation = generation;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.generation.system_prompt = Some(prompt.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    pub fn iteration_ceiling(mut self, max: usize) -> Self {
        self.config.iteration_ceiling = max;
        self
    }

    pub fn inference_timeout(mut self, limit: Duration) -> Self {
        self.config.inference_timeout = limit;
        self
    }

    pub fn transcript(mut self, transcript: Transcript) -> Self {
        self.transcript = transcript;
        self
    }

    pub fn build(self) -> Result<AgentLoop> {
        let session = self.session
            .ok_or_else(|| AgentError::Config("Session is required".into()))?;
        let provider = self.provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        if self.config.iteration_ceiling == 0 {
            return Err(AgentError::Config("iteration_ceiling must be at least 1".into()));
        }

        Ok(AgentLoop::resume(session, provider, self.config, self.transcript))
    }
}
