//! Conversation controller — the per-session turn state machine.
//!
//! ```text
//! Idle → Submitting → Streaming → (ExecutingTools) → (FollowUpStreaming) → Idle
//!                  ╰──────────── any failure ──→ Error → Idle
//! ```
//!
//! Each accepted submission runs as one spawned task. Within a session at
//! most one turn is in flight; `submit` while executing is a no-op.
//! Sessions run independently and share only the dispatcher, the tool
//! engine and the config provider. The agent configuration is snapshotted
//! inside `submit`, so later changes never reach a turn already accepted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use uuid::Uuid;

use super::config_store::ConfigProvider;
use super::errors::{join_failure_reason, AgentError};
use super::history_policy::{HistoryPolicy, PolicyDecision};
use super::stream_aggregator::{aggregate, StreamOutcome};
use super::tokens::truncate_utf8;
use super::tool_engine::ToolExecutionEngine;
use super::tool_registry::ToolResolver;
use super::types::{AgentConfig, SessionEvent, TurnState};
use crate::inference::dispatcher::ProviderDispatcher;
use crate::inference::types::{
    Attachment, Capability, Credentials, DispatchRequest, Message, Sender, ToolSchema,
};

/// Broadcast buffer per subscriber.
const EVENT_CAPACITY: usize = 256;

// ─── Submission API ─────────────────────────────────────────────────────────

/// Why a submission was ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// A turn is already in flight for this session.
    Busy,
    /// Blank text and no attachment.
    EmptyContent,
    UnknownSession,
    /// The config provider has no configuration for the session's agent.
    UnknownAgent,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Accepted(TurnHandle),
    Rejected(RejectReason),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted(_))
    }

    pub fn into_handle(self) -> Option<TurnHandle> {
        match self {
            SubmitOutcome::Accepted(handle) => Some(handle),
            SubmitOutcome::Rejected(_) => None,
        }
    }
}

/// How a turn ended.
#[derive(Debug)]
pub enum TurnResult {
    Completed,
    /// An error message was appended to the session.
    Failed(AgentError),
    /// The session was removed while the turn was in flight.
    Cancelled,
}

impl TurnResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, TurnResult::Completed)
    }
}

/// Handle to a running turn. Dropping it does not stop the turn.
#[derive(Debug)]
pub struct TurnHandle {
    turn_id: String,
    task: JoinHandle<TurnResult>,
}

impl TurnHandle {
    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    pub async fn wait(self) -> TurnResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => TurnResult::Failed(AgentError::TaskFailed {
                reason: e.to_string(),
            }),
        }
    }
}

// ─── Session State ──────────────────────────────────────────────────────────

struct SessionData {
    messages: Vec<Message>,
    /// The in-progress agent message, if a stream is open.
    draft: Option<Message>,
    state: TurnState,
}

struct SessionSlot {
    instance_id: String,
    data: Mutex<SessionData>,
    cancel: CancellationToken,
}

impl SessionSlot {
    fn lock(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything a turn reads, fixed at submission.
struct TurnContext {
    turn_id: String,
    session_id: String,
    slot: Arc<SessionSlot>,
    config: AgentConfig,
    credentials: Credentials,
    summary_credentials: Credentials,
}

// ─── Controller ─────────────────────────────────────────────────────────────

pub struct ConversationController {
    config: Arc<dyn ConfigProvider>,
    dispatcher: Arc<ProviderDispatcher>,
    tools: ToolExecutionEngine,
    history_policy: HistoryPolicy,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl ConversationController {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        dispatcher: Arc<ProviderDispatcher>,
        tools: Arc<dyn ToolResolver>,
    ) -> Self {
        Self::with_tool_engine(config, dispatcher, ToolExecutionEngine::new(tools))
    }

    pub fn with_tool_engine(
        config: Arc<dyn ConfigProvider>,
        dispatcher: Arc<ProviderDispatcher>,
        tools: ToolExecutionEngine,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            history_policy: HistoryPolicy::new(dispatcher.clone()),
            dispatcher,
            tools,
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Observe session mutations.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // ─── Session lifecycle ───────────────────────────────────────────────

    pub fn create_session(&self, session_id: &str, instance_id: &str) -> Result<(), AgentError> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if sessions.contains_key(session_id) {
            return Err(AgentError::SessionExists {
                session_id: session_id.to_string(),
            });
        }
        sessions.insert(
            session_id.to_string(),
            Arc::new(SessionSlot {
                instance_id: instance_id.to_string(),
                data: Mutex::new(SessionData {
                    messages: Vec::new(),
                    draft: None,
                    state: TurnState::Idle,
                }),
                cancel: CancellationToken::new(),
            }),
        );
        tracing::info!(session_id, instance_id, "session created");
        Ok(())
    }

    /// Destroy a session. An in-flight turn is cancelled and never touches
    /// the session again.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        match removed {
            Some(slot) => {
                slot.cancel.cancel();
                tracing::info!(session_id, "session removed");
                true
            }
            None => false,
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ─── Reads ───────────────────────────────────────────────────────────

    /// Committed messages followed by the live draft, if any.
    pub fn get_session(&self, session_id: &str) -> Option<Vec<Message>> {
        let slot = self.slot(session_id)?;
        let data = slot.lock();
        let mut messages = data.messages.clone();
        messages.extend(data.draft.clone());
        Some(messages)
    }

    /// False for unknown sessions.
    pub fn is_executing(&self, session_id: &str) -> bool {
        self.state(session_id).is_some_and(|s| s.is_executing())
    }

    pub fn state(&self, session_id: &str) -> Option<TurnState> {
        self.slot(session_id).map(|slot| slot.lock().state)
    }

    fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
    }

    // ─── Submit ──────────────────────────────────────────────────────────

    /// Start a turn. Returns immediately; observe progress via
    /// [`subscribe`](Self::subscribe) or await the returned handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(
        self: &Arc<Self>,
        session_id: &str,
        text: &str,
        attachment: Option<Attachment>,
    ) -> SubmitOutcome {
        let Some(slot) = self.slot(session_id) else {
            return SubmitOutcome::Rejected(RejectReason::UnknownSession);
        };

        let config = {
            let mut data = slot.lock();
            if data.state.is_executing() {
                tracing::debug!(session_id, state = ?data.state, "submit ignored: turn in flight");
                return SubmitOutcome::Rejected(RejectReason::Busy);
            }
            if text.trim().is_empty() && attachment.is_none() {
                return SubmitOutcome::Rejected(RejectReason::EmptyContent);
            }
            let config = match self.config.get_agent_config(&slot.instance_id) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "submit ignored: no agent config");
                    return SubmitOutcome::Rejected(RejectReason::UnknownAgent);
                }
            };
            data.state = TurnState::Submitting;
            config
        };

        let ctx = Arc::new(TurnContext {
            turn_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            credentials: self.config.credentials_for(&config.provider_id),
            summary_credentials: self
                .config
                .credentials_for(&config.history_policy.summarization.provider_id),
            slot,
            config,
        });
        self.emit(&ctx, SessionEvent::StateChanged {
            session_id: ctx.session_id.clone(),
            state: TurnState::Submitting,
        });

        tracing::info!(
            session_id,
            turn_id = %ctx.turn_id,
            provider = %ctx.config.provider_id,
            model = %ctx.config.model,
            preview = %truncate_utf8(text, 80),
            has_attachment = attachment.is_some(),
            "turn accepted"
        );

        let turn_id = ctx.turn_id.clone();
        let user_message = Message::user_with_attachment(text, attachment);
        let task = tokio::spawn(Arc::clone(self).run_turn(ctx, user_message));
        SubmitOutcome::Accepted(TurnHandle { turn_id, task })
    }

    // ─── Turn ────────────────────────────────────────────────────────────

    async fn run_turn(self: Arc<Self>, ctx: Arc<TurnContext>, user_message: Message) -> TurnResult {
        let cancel = ctx.slot.cancel.clone();

        // The turn body runs on its own task so a panic anywhere in it still
        // brings the session back to Idle. Dropping the handle aborts it.
        let driver = {
            let controller = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            AbortOnDropHandle::new(tokio::spawn(async move {
                controller.drive_turn(&ctx, user_message).await
            }))
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(
                    session_id = %ctx.session_id,
                    turn_id = %ctx.turn_id,
                    "turn cancelled: session removed"
                );
                TurnResult::Cancelled
            }
            joined = driver => match joined {
                Ok(result) => result,
                Err(e) => {
                    let error = AgentError::TaskFailed {
                        reason: join_failure_reason(e),
                    };
                    self.fail(&ctx, Message::error(format!("Error: {error}")), error)
                }
            },
        }
    }

    async fn drive_turn(&self, ctx: &TurnContext, user_message: Message) -> TurnResult {
        let cfg = &ctx.config;

        // Submitting: size policy, then the user message goes in unconditionally.
        let history = ctx.slot.lock().messages.clone();
        let decision = self
            .history_policy
            .apply(&cfg.history_policy, &ctx.summary_credentials, &history, &user_message)
            .await;
        match decision {
            Ok(PolicyDecision::Keep) => self.commit(ctx, user_message),
            Ok(PolicyDecision::Compact { summary }) => {
                ctx.slot.lock().messages = vec![summary.clone(), user_message.clone()];
                self.emit(ctx, SessionEvent::HistoryCompacted {
                    session_id: ctx.session_id.clone(),
                    summary,
                });
                self.emit(ctx, SessionEvent::MessageAppended {
                    session_id: ctx.session_id.clone(),
                    message: user_message,
                });
            }
            Err(e) => {
                self.commit(ctx, user_message);
                return self.fail(ctx, Message::error(format!("Error: {e}")), e);
            }
        }

        // Streaming
        self.set_state(ctx, TurnState::Streaming);
        let tools = (!cfg.tools.is_empty()).then(|| cfg.tools.clone());
        let history = {
            let data = ctx.slot.lock();
            match tools {
                Some(_) => dispatched_history(&data.messages),
                None => text_only_history(&data.messages),
            }
        };
        let tool_message = match self.stream_phase(ctx, history, tools, true).await {
            StreamOutcome::Text(message) => {
                self.commit(ctx, message);
                self.set_state(ctx, TurnState::Idle);
                return TurnResult::Completed;
            }
            StreamOutcome::Failed { message, error } => return self.fail(ctx, message, error),
            StreamOutcome::ToolCalls(message) => message,
        };

        // ExecutingTools
        self.commit(ctx, tool_message.clone());
        self.set_state(ctx, TurnState::ExecutingTools);
        let calls = tool_message.tool_calls.clone().unwrap_or_default();
        let results = self.tools.execute_batch(&calls, &cfg.tools).await;

        let cleared = {
            let mut data = ctx.slot.lock();
            data.messages.extend(results.iter().cloned());
            data.messages
                .iter_mut()
                .find(|m| m.id == tool_message.id)
                .map(|m| {
                    m.status = None;
                    m.clone()
                })
        };
        for result in &results {
            self.emit(ctx, SessionEvent::MessageAppended {
                session_id: ctx.session_id.clone(),
                message: result.clone(),
            });
        }
        if let Some(message) = cleared {
            self.emit(ctx, SessionEvent::MessageUpdated {
                session_id: ctx.session_id.clone(),
                message,
            });
        }

        if !cfg.declares(Capability::Conversation) {
            tracing::info!(
                session_id = %ctx.session_id,
                "no conversation capability, skipping follow-up"
            );
            self.set_state(ctx, TurnState::Idle);
            return TurnResult::Completed;
        }

        // FollowUpStreaming: tool results go back as context, without tools.
        self.set_state(ctx, TurnState::FollowUpStreaming);
        let history = text_only_history(&ctx.slot.lock().messages);
        match self.stream_phase(ctx, history, None, false).await {
            // Tool calls are refused on follow-up, so only text or failure arrive here.
            StreamOutcome::Text(message) | StreamOutcome::ToolCalls(message) => {
                self.commit(ctx, message);
                self.set_state(ctx, TurnState::Idle);
                TurnResult::Completed
            }
            StreamOutcome::Failed { message, error } => self.fail(ctx, message, error),
        }
    }

    /// One streaming call, mirrored into the session draft.
    async fn stream_phase(
        &self,
        ctx: &TurnContext,
        history: Vec<Message>,
        tools: Option<Vec<ToolSchema>>,
        accept_tool_calls: bool,
    ) -> StreamOutcome {
        let cfg = &ctx.config;
        let request = DispatchRequest {
            model: cfg.model.clone(),
            system_prompt: cfg.system_prompt.clone(),
            history,
            tools,
            output_directive: cfg.output_directive,
        };

        let grounded = cfg.declares(Capability::Grounding)
            && self.dispatcher.supports(&cfg.provider_id, Capability::Grounding);
        let stream = if grounded {
            self.dispatcher
                .stream_with_grounding(&cfg.provider_id, &ctx.credentials, request)
                .await
        } else {
            self.dispatcher
                .stream(&cfg.provider_id, &ctx.credentials, request)
                .await
        };

        let slot = Arc::clone(&ctx.slot);
        let events = self.events.clone();
        let session_id = ctx.session_id.clone();
        let outcome = aggregate(stream, accept_tool_calls, move |draft| {
            if slot.cancel.is_cancelled() {
                return;
            }
            slot.lock().draft = Some(draft.clone());
            let _ = events.send(SessionEvent::DraftUpdated {
                session_id: session_id.clone(),
                draft: draft.clone(),
            });
        })
        .await;

        tracing::info!(
            session_id = %ctx.session_id,
            turn_id = %ctx.turn_id,
            outcome = match &outcome {
                StreamOutcome::Text(_) => "text",
                StreamOutcome::ToolCalls(_) => "tool_calls",
                StreamOutcome::Failed { .. } => "failed",
            },
            chars = outcome.message().text.len(),
            "stream finished"
        );
        outcome
    }

    // ─── Mutation helpers ────────────────────────────────────────────────

    /// Append a message, replacing the draft it came from.
    fn commit(&self, ctx: &TurnContext, message: Message) {
        {
            let mut data = ctx.slot.lock();
            data.draft = None;
            data.messages.push(message.clone());
        }
        self.emit(ctx, SessionEvent::MessageAppended {
            session_id: ctx.session_id.clone(),
            message,
        });
    }

    fn set_state(&self, ctx: &TurnContext, state: TurnState) {
        ctx.slot.lock().state = state;
        tracing::debug!(session_id = %ctx.session_id, state = ?state, "turn state");
        self.emit(ctx, SessionEvent::StateChanged {
            session_id: ctx.session_id.clone(),
            state,
        });
    }

    /// Error → append error message → Idle.
    fn fail(&self, ctx: &TurnContext, message: Message, error: AgentError) -> TurnResult {
        tracing::warn!(
            session_id = %ctx.session_id,
            turn_id = %ctx.turn_id,
            error = %error,
            "turn failed"
        );
        self.set_state(ctx, TurnState::Error);
        self.commit(ctx, message);
        self.set_state(ctx, TurnState::Idle);
        TurnResult::Failed(error)
    }

    fn emit(&self, ctx: &TurnContext, event: SessionEvent) {
        if ctx.slot.cancel.is_cancelled() {
            return;
        }
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

// ─── History projections ────────────────────────────────────────────────────

/// What a call that offers tools sees: everything except error entries.
///
/// Error-flagged tool results stay, since each tool call must be answered.
fn dispatched_history(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter(|m| !m.is_error || m.sender == Sender::ToolResult)
        .cloned()
        .collect()
}

/// What a call without tools sees: every tool exchange flattened to text.
///
/// Tool-call messages keep only their text (dropped when they have none) and
/// each run of tool results becomes one user message listing them. Backends
/// that reject tool blocks without a tool list accept this shape.
pub(crate) fn text_only_history(messages: &[Message]) -> Vec<Message> {
    let mut history = Vec::with_capacity(messages.len());
    let mut results: Vec<&Message> = Vec::new();

    for m in messages {
        if m.sender == Sender::ToolResult {
            results.push(m);
            continue;
        }
        if !results.is_empty() {
            history.push(Message::user(render_tool_context(&results)));
            results.clear();
        }
        if m.is_error {
            continue;
        }
        if m.has_tool_calls() {
            let projected = m.text_only();
            if !projected.text.trim().is_empty() {
                history.push(projected);
            }
        } else {
            history.push(m.clone());
        }
    }
    if !results.is_empty() {
        history.push(Message::user(render_tool_context(&results)));
    }
    history
}

fn render_tool_context(results: &[&Message]) -> String {
    let mut out = String::from("Tool results:");
    for payload in results.iter().filter_map(|m| m.tool_result.as_ref()) {
        let status = if payload.is_error { " (failed)" } else { "" };
        out.push_str(&format!(
            "\n[{} #{}]{status} {}",
            payload.tool_name, payload.tool_call_id, payload.result
        ));
    }
    out
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::config_store::InMemoryConfigStore;
    use crate::agent_core::errors::ToolError;
    use crate::agent_core::tool_registry::{FunctionTool, ToolRegistry};
    use crate::agent_core::types::{HistoryPolicyConfig, SummarizationConfig, Thresholds};
    use crate::inference::errors::DispatchError;
    use crate::inference::types::{Increment, MessageStatus, ToolCall};
    use crate::testing::ScriptedProvider;
    use serde_json::json;
    use tokio::sync::Notify;

    const SESSION: &str = "s1";
    const AGENT: &str = "agent-1";

    struct Harness {
        controller: Arc<ConversationController>,
        provider: Arc<ScriptedProvider>,
        store: Arc<InMemoryConfigStore>,
    }

    fn weather_schema() -> ToolSchema {
        ToolSchema {
            name: "get_weather".into(),
            description: "Current weather for a city".into(),
            parameters: json!({
                "type": "object",
                "properties": { "location": { "type": "string" } },
                "required": ["location"]
            }),
        }
    }

    fn explode_schema() -> ToolSchema {
        ToolSchema {
            name: "explode".into(),
            description: "Always panics".into(),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    fn weather_agent(capabilities: Vec<Capability>) -> AgentConfig {
        let mut cfg = AgentConfig::new("scripted", "model-a");
        cfg.system_prompt = "You report the weather.".into();
        cfg.capabilities = capabilities;
        cfg.tools = vec![weather_schema()];
        cfg
    }

    fn harness(provider: ScriptedProvider, agent: AgentConfig) -> Harness {
        let provider = Arc::new(provider);
        let dispatcher = Arc::new(ProviderDispatcher::new().with_provider(provider.clone()));
        let store = Arc::new(InMemoryConfigStore::new());
        store.set_agent_config(AGENT, agent);

        let weather = FunctionTool::new(weather_schema(), |args| async move {
            match args["location"].as_str() {
                Some("Paris") => Ok(json!({"temperature": "18°C", "condition": "Cloudy"})),
                Some(other) => Err(ToolError::Execution {
                    tool_name: "get_weather".into(),
                    reason: format!("no station for {other}"),
                }),
                None => Err(ToolError::InvalidArguments {
                    tool_name: "get_weather".into(),
                    reason: "location".into(),
                }),
            }
        });
        let explode = FunctionTool::new(explode_schema(), |_| async move {
            let stations: Vec<&str> = Vec::new();
            Ok(json!({ "station": stations[0] }))
        });
        let registry = ToolRegistry::new()
            .with_tool(Arc::new(weather))
            .with_tool(Arc::new(explode));

        let controller = Arc::new(ConversationController::new(
            store.clone(),
            dispatcher,
            Arc::new(registry),
        ));
        controller.create_session(SESSION, AGENT).unwrap();
        Harness {
            controller,
            provider,
            store,
        }
    }

    fn weather_call(location: &str) -> Increment {
        Increment::ToolCalls(vec![tool_call(
            "call_1",
            "get_weather",
            json!({ "location": location }),
        )])
    }

    fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    async fn submit_and_wait(h: &Harness, text: &str) -> TurnResult {
        h.controller
            .submit(SESSION, text, None)
            .into_handle()
            .expect("submission accepted")
            .wait()
            .await
    }

    #[tokio::test]
    async fn test_weather_scenario() {
        let h = harness(
            ScriptedProvider::new("scripted"),
            weather_agent(vec![Capability::Conversation, Capability::ToolUse]),
        );
        h.provider.push_stream(vec![weather_call("Paris"), Increment::Done]);
        h.provider.push_stream(vec![
            Increment::Text("It is 18°C ".into()),
            Increment::Text("and cloudy in Paris.".into()),
            Increment::Done,
        ]);

        let result = submit_and_wait(&h, "What's the weather in Paris?").await;
        assert!(result.is_completed(), "{result:?}");

        let session = h.controller.get_session(SESSION).unwrap();
        let senders: Vec<Sender> = session.iter().map(|m| m.sender).collect();
        assert_eq!(
            senders,
            vec![Sender::User, Sender::Agent, Sender::ToolResult, Sender::Agent]
        );
        assert!(session[1].has_tool_calls());
        assert_eq!(session[1].status, None, "status cleared after execution");
        let payload = session[2].tool_result.as_ref().unwrap();
        assert_eq!(payload.tool_call_id, "call_1");
        assert_eq!(payload.result["temperature"], "18°C");
        assert!(!payload.is_error);
        assert!(session[3].text.contains("18°C"));
        assert!(!h.controller.is_executing(SESSION));

        // Primary call offers tools; follow-up does not and carries results as context.
        let requests = h.provider.stream_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].tools.as_ref().unwrap()[0].name, "get_weather");
        assert!(requests[1].tools.is_none());
        let follow_up = &requests[1].history;
        assert!(follow_up.iter().all(|m| m.sender != Sender::ToolResult));
        assert!(follow_up.iter().all(|m| !m.has_tool_calls()));
        let context = follow_up.last().unwrap();
        assert_eq!(context.sender, Sender::User);
        assert!(context.text.contains("get_weather"));
        assert!(context.text.contains("18°C"));
    }

    #[tokio::test]
    async fn test_follow_up_gating_without_conversation_capability() {
        let h = harness(
            ScriptedProvider::new("scripted"),
            weather_agent(vec![Capability::ToolUse]),
        );
        h.provider.push_stream(vec![weather_call("Paris"), Increment::Done]);

        let result = submit_and_wait(&h, "Weather in Paris?").await;
        assert!(result.is_completed());

        assert_eq!(h.provider.stream_requests().len(), 1, "no follow-up call");
        let session = h.controller.get_session(SESSION).unwrap();
        assert_eq!(session.len(), 3);
        assert_eq!(session[2].sender, Sender::ToolResult);
        assert_eq!(h.controller.state(SESSION), Some(TurnState::Idle));
    }

    #[tokio::test]
    async fn test_tool_failure_still_allows_follow_up() {
        let h = harness(
            ScriptedProvider::new("scripted"),
            weather_agent(vec![Capability::Conversation, Capability::ToolUse]),
        );
        h.provider.push_stream(vec![weather_call("Atlantis"), Increment::Done]);
        h.provider.push_stream(vec![Increment::Text("I could not find that city.".into())]);

        let result = submit_and_wait(&h, "Weather in Atlantis?").await;
        assert!(result.is_completed());

        let session = h.controller.get_session(SESSION).unwrap();
        assert!(session[2].is_error);
        assert_eq!(session[3].text, "I could not find that city.");
        let context = h.provider.stream_requests()[1].history.last().unwrap().clone();
        assert!(context.text.contains("(failed)"));
    }

    #[tokio::test]
    async fn test_submit_while_executing_is_noop() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedProvider::new("scripted").with_gate(gate.clone()),
            AgentConfig::new("scripted", "model-a"),
        );
        h.provider.push_stream(vec![Increment::Text("first".into()), Increment::Done]);

        let handle = h.controller.submit(SESSION, "one", None).into_handle().unwrap();
        assert!(h.controller.is_executing(SESSION));

        let before = h.controller.get_session(SESSION).unwrap();
        let second = h.controller.submit(SESSION, "two", None);
        assert!(matches!(second, SubmitOutcome::Rejected(RejectReason::Busy)));
        assert_eq!(h.controller.get_session(SESSION).unwrap(), before);

        gate.notify_one();
        assert!(handle.wait().await.is_completed());

        let session = h.controller.get_session(SESSION).unwrap();
        assert_eq!(session.len(), 2);
        assert_eq!(session[0].text, "one");
        assert_eq!(h.provider.stream_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_rejections() {
        let h = harness(
            ScriptedProvider::new("scripted"),
            AgentConfig::new("scripted", "model-a"),
        );
        assert!(matches!(
            h.controller.submit(SESSION, "   ", None),
            SubmitOutcome::Rejected(RejectReason::EmptyContent)
        ));
        assert!(matches!(
            h.controller.submit("nope", "hi", None),
            SubmitOutcome::Rejected(RejectReason::UnknownSession)
        ));

        h.controller.create_session("orphan", "no-such-agent").unwrap();
        assert!(matches!(
            h.controller.submit("orphan", "hi", None),
            SubmitOutcome::Rejected(RejectReason::UnknownAgent)
        ));
        assert!(h.controller.get_session(SESSION).unwrap().is_empty());
        assert!(matches!(
            h.controller.create_session(SESSION, AGENT),
            Err(AgentError::SessionExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_attachment_only_submission_accepted() {
        let h = harness(
            ScriptedProvider::new("scripted"),
            AgentConfig::new("scripted", "model-a"),
        );
        h.provider.push_stream(vec![Increment::Text("A cat.".into()), Increment::Done]);
        let attachment = Attachment {
            mime_type: "image/png".into(),
            data: "iVBORw0KGgo=".into(),
            name: Some("cat.png".into()),
        };

        let handle = h
            .controller
            .submit(SESSION, "", Some(attachment.clone()))
            .into_handle()
            .unwrap();
        assert!(handle.wait().await.is_completed());
        let sent = &h.provider.stream_requests()[0].history[0];
        assert_eq!(sent.attachment.as_ref(), Some(&attachment));
    }

    #[tokio::test]
    async fn test_error_increment_appends_error_message() {
        let h = harness(
            ScriptedProvider::new("scripted"),
            AgentConfig::new("scripted", "model-a"),
        );
        h.provider.push_stream(vec![
            Increment::Text("partial".into()),
            Increment::Error(DispatchError::Transport {
                provider_id: "scripted".into(),
                reason: "connection reset".into(),
            }),
        ]);

        let result = submit_and_wait(&h, "hello").await;
        assert!(matches!(result, TurnResult::Failed(AgentError::Dispatch(_))));

        let session = h.controller.get_session(SESSION).unwrap();
        assert_eq!(session.len(), 2);
        assert!(session[1].is_error);
        assert!(!session[1].text.contains("partial"));
        assert_eq!(h.controller.state(SESSION), Some(TurnState::Idle));

        // Error entries are not sent on the next turn.
        h.provider.push_stream(vec![Increment::Text("hi".into())]);
        assert!(submit_and_wait(&h, "again").await.is_completed());
        let second = &h.provider.stream_requests()[1].history;
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|m| !m.is_error));
    }

    #[tokio::test]
    async fn test_missing_credentials_surface_as_error_message() {
        let h = harness(
            ScriptedProvider::new("scripted").requiring_credentials(),
            AgentConfig::new("scripted", "model-a"),
        );
        let result = submit_and_wait(&h, "hello").await;
        match result {
            TurnResult::Failed(AgentError::Dispatch(e)) => assert!(e.is_authentication()),
            other => panic!("expected auth failure, got {other:?}"),
        }
        assert!(h.provider.stream_requests().is_empty());

        h.store
            .set_provider_credentials("scripted", Credentials::api_key("sk-test"));
        h.provider.push_stream(vec![Increment::Text("ok".into())]);
        assert!(submit_and_wait(&h, "hello again").await.is_completed());
    }

    #[tokio::test]
    async fn test_compaction_collapses_history() {
        let provider = ScriptedProvider::new("scripted");
        provider.push_completion(Ok("Paris weather was discussed.".into()));
        let mut agent = weather_agent(vec![Capability::ToolUse]);
        agent.history_policy = HistoryPolicyConfig {
            enabled: true,
            summarization: SummarizationConfig {
                provider_id: "scripted".into(),
                model: "summary-model".into(),
                system_prompt: "Summarize.".into(),
            },
            thresholds: Thresholds {
                message_count: Some(5),
                ..Thresholds::default()
            },
        };
        let h = harness(provider, agent);

        // Turn 1: tool call without follow-up → 3 messages.
        h.provider.push_stream(vec![weather_call("Paris"), Increment::Done]);
        assert!(submit_and_wait(&h, "Weather in Paris?").await.is_completed());
        // Turn 2: plain answer → 5 messages.
        h.provider.push_stream(vec![Increment::Text("Anything else?".into())]);
        assert!(submit_and_wait(&h, "Thanks").await.is_completed());
        assert_eq!(h.controller.get_session(SESSION).unwrap().len(), 5);
        assert!(h.provider.complete_requests().is_empty());

        // Turn 3: 5 prior + new message meets the threshold.
        h.provider.push_stream(vec![Increment::Text("Lyon is sunny.".into())]);
        assert!(submit_and_wait(&h, "And Lyon?").await.is_completed());

        let summary_requests = h.provider.complete_requests();
        assert_eq!(summary_requests.len(), 1);
        assert_eq!(summary_requests[0].model, "summary-model");

        let primary = &h.provider.stream_requests()[2].history;
        assert_eq!(primary.len(), 2, "dispatch sees exactly [summary, trigger]");
        assert!(primary[0].text.contains("Paris weather was discussed."));
        assert_eq!(primary[1].text, "And Lyon?");

        let session = h.controller.get_session(SESSION).unwrap();
        assert_eq!(session.len(), 3);
        assert_eq!(session[0].sender, Sender::Agent);
        assert_eq!(session[1].text, "And Lyon?");
        assert_eq!(session[2].text, "Lyon is sunny.");
    }

    #[tokio::test]
    async fn test_summarization_unavailable_fails_turn() {
        let mut agent = AgentConfig::new("scripted", "model-a");
        agent.history_policy = HistoryPolicyConfig {
            enabled: true,
            summarization: SummarizationConfig {
                provider_id: "not-registered".into(),
                model: "m".into(),
                system_prompt: String::new(),
            },
            thresholds: Thresholds {
                message_count: Some(1),
                ..Thresholds::default()
            },
        };
        let h = harness(ScriptedProvider::new("scripted"), agent);

        let result = submit_and_wait(&h, "hello").await;
        assert!(matches!(
            result,
            TurnResult::Failed(AgentError::SummarizationUnavailable { .. })
        ));
        assert!(h.provider.stream_requests().is_empty(), "primary dispatch never happens");

        let session = h.controller.get_session(SESSION).unwrap();
        assert_eq!(session.len(), 2);
        assert_eq!(session[0].text, "hello");
        assert!(session[1].is_error);
        assert!(!h.controller.is_executing(SESSION));
    }

    #[tokio::test]
    async fn test_config_snapshot_stability() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedProvider::new("scripted").with_gate(gate.clone()),
            weather_agent(vec![Capability::Conversation, Capability::ToolUse]),
        );
        h.provider.push_stream(vec![weather_call("Paris"), Increment::Done]);
        h.provider.push_stream(vec![Increment::Text("18°C".into())]);

        let handle = h.controller.submit(SESSION, "Weather?", None).into_handle().unwrap();

        let mut changed = AgentConfig::new("scripted", "model-b");
        changed.system_prompt = "changed".into();
        h.store.set_agent_config(AGENT, changed);

        // Release the primary call, then the follow-up once it is issued.
        gate.notify_one();
        while h.provider.stream_requests().len() < 2 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();
        assert!(handle.wait().await.is_completed());

        let requests = h.provider.stream_requests();
        assert_eq!(requests.len(), 2, "follow-up still runs under the old capabilities");
        for req in &requests {
            assert_eq!(req.model, "model-a");
            assert_eq!(req.system_prompt, "You report the weather.");
        }
    }

    #[tokio::test]
    async fn test_grounding_falls_back_when_backend_lacks_it() {
        let mut agent = AgentConfig::new("scripted", "model-a");
        agent.capabilities = vec![Capability::Conversation, Capability::Grounding];
        let h = harness(
            ScriptedProvider::new("scripted").with_capabilities(vec![Capability::Conversation]),
            agent,
        );
        h.provider.push_stream(vec![Increment::Text("ungrounded answer".into())]);

        assert!(submit_and_wait(&h, "latest news?").await.is_completed());
        let session = h.controller.get_session(SESSION).unwrap();
        assert_eq!(session[1].text, "ungrounded answer");
        assert!(!session[1].is_error);
    }

    #[tokio::test]
    async fn test_remove_session_cancels_turn() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedProvider::new("scripted").with_gate(gate.clone()),
            AgentConfig::new("scripted", "model-a"),
        );
        h.provider.push_stream(vec![Increment::Text("late".into())]);

        let handle = h.controller.submit(SESSION, "hello", None).into_handle().unwrap();
        tokio::task::yield_now().await;
        assert!(h.controller.remove_session(SESSION));

        assert!(matches!(handle.wait().await, TurnResult::Cancelled));
        assert!(h.controller.get_session(SESSION).is_none());
        assert!(!h.controller.is_executing(SESSION));
        assert!(!h.controller.remove_session(SESSION));
    }

    #[tokio::test]
    async fn test_events_track_draft_and_state() {
        let h = harness(
            ScriptedProvider::new("scripted"),
            AgentConfig::new("scripted", "model-a"),
        );
        h.provider.push_stream(vec![
            Increment::Text("Hel".into()),
            Increment::Text("lo".into()),
            Increment::Done,
        ]);
        let mut rx = h.controller.subscribe();

        assert!(submit_and_wait(&h, "hi").await.is_completed());

        let mut states = Vec::new();
        let mut drafts = Vec::new();
        let mut appended = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.session_id(), SESSION);
            match event {
                SessionEvent::StateChanged { state, .. } => states.push(state),
                SessionEvent::DraftUpdated { draft, .. } => drafts.push(draft),
                SessionEvent::MessageAppended { message, .. } => appended.push(message),
                _ => {}
            }
        }

        assert_eq!(
            states,
            vec![TurnState::Submitting, TurnState::Streaming, TurnState::Idle]
        );
        let texts: Vec<&str> = drafts.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(texts, vec!["Hel", "Hello"]);
        assert_eq!(appended.len(), 2);
        assert_eq!(appended[1].id, drafts[0].id, "draft id survives commit");
        assert_eq!(appended[1].text, "Hello");
    }

    #[tokio::test]
    async fn test_second_tool_turn_follow_up_is_text_only() {
        let h = harness(
            ScriptedProvider::new("scripted"),
            weather_agent(vec![Capability::Conversation, Capability::ToolUse]),
        );
        h.provider.push_stream(vec![weather_call("Paris"), Increment::Done]);
        h.provider.push_stream(vec![Increment::Text("18°C in Paris.".into())]);
        h.provider.push_stream(vec![
            Increment::ToolCalls(vec![tool_call(
                "call_2",
                "get_weather",
                json!({ "location": "Atlantis" }),
            )]),
            Increment::Done,
        ]);
        h.provider.push_stream(vec![Increment::Text("No data for Atlantis.".into())]);

        assert!(submit_and_wait(&h, "Weather in Paris?").await.is_completed());
        assert!(submit_and_wait(&h, "And Atlantis?").await.is_completed());

        let requests = h.provider.stream_requests();
        assert_eq!(requests.len(), 4);

        // The second primary call offers tools, so raw tool exchanges are fine there.
        assert!(requests[2].tools.is_some());
        assert!(requests[2].history.iter().any(|m| m.sender == Sender::ToolResult));

        let follow_up = &requests[3];
        assert!(follow_up.tools.is_none());
        assert!(follow_up.history.iter().all(|m| m.sender != Sender::ToolResult));
        assert!(follow_up.history.iter().all(|m| !m.has_tool_calls()));
        let texts: Vec<&str> = follow_up.history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts.len(), 5, "{texts:?}");
        assert_eq!(texts[0], "Weather in Paris?");
        assert!(texts[1].starts_with("Tool results:") && texts[1].contains("#call_1]"));
        assert_eq!(texts[2], "18°C in Paris.");
        assert_eq!(texts[3], "And Atlantis?");
        assert!(texts[4].contains("#call_2] (failed)"));
        assert_eq!(follow_up.history[4].sender, Sender::User);
    }

    #[tokio::test]
    async fn test_primary_without_tools_sees_text_only_history() {
        let h = harness(
            ScriptedProvider::new("scripted"),
            weather_agent(vec![Capability::Conversation, Capability::ToolUse]),
        );
        h.provider.push_stream(vec![weather_call("Paris"), Increment::Done]);
        h.provider.push_stream(vec![Increment::Text("18°C in Paris.".into())]);
        assert!(submit_and_wait(&h, "Weather in Paris?").await.is_completed());

        h.store.set_agent_config(AGENT, AgentConfig::new("scripted", "model-a"));
        h.provider.push_stream(vec![Increment::Text("You're welcome.".into())]);
        assert!(submit_and_wait(&h, "Thanks").await.is_completed());

        let primary = &h.provider.stream_requests()[2];
        assert!(primary.tools.is_none());
        assert!(primary.history.iter().all(|m| m.sender != Sender::ToolResult));
        assert!(primary.history.iter().all(|m| !m.has_tool_calls()));
        assert_eq!(primary.history.last().unwrap().text, "Thanks");
    }

    #[tokio::test]
    async fn test_panicking_tool_leaves_session_usable() {
        let mut agent = weather_agent(vec![Capability::Conversation, Capability::ToolUse]);
        agent.tools.push(explode_schema());
        let h = harness(ScriptedProvider::new("scripted"), agent);
        h.provider.push_stream(vec![
            Increment::ToolCalls(vec![
                tool_call("a", "get_weather", json!({ "location": "Paris" })),
                tool_call("b", "explode", json!({})),
                tool_call("c", "get_weather", json!({ "location": "Paris" })),
            ]),
            Increment::Done,
        ]);
        h.provider.push_stream(vec![Increment::Text("Partial answer.".into())]);

        assert!(submit_and_wait(&h, "Weather twice?").await.is_completed());

        let session = h.controller.get_session(SESSION).unwrap();
        let flags: Vec<bool> = session
            .iter()
            .filter(|m| m.sender == Sender::ToolResult)
            .map(|m| m.is_error)
            .collect();
        assert_eq!(flags, vec![false, true, false]);
        assert_eq!(session.last().unwrap().text, "Partial answer.");
        assert_eq!(h.controller.state(SESSION), Some(TurnState::Idle));

        h.provider.push_stream(vec![Increment::Text("Still here.".into())]);
        assert!(submit_and_wait(&h, "Hello?").await.is_completed());
    }

    #[tokio::test]
    async fn test_crashing_backend_fails_turn_and_returns_to_idle() {
        let h = harness(
            ScriptedProvider::new("scripted").crashing(),
            AgentConfig::new("scripted", "model-a"),
        );

        let result = submit_and_wait(&h, "hello").await;
        match result {
            TurnResult::Failed(AgentError::TaskFailed { reason }) => {
                assert!(reason.contains("scripted backend crashed"), "{reason}");
            }
            other => panic!("expected task failure, got {other:?}"),
        }

        let session = h.controller.get_session(SESSION).unwrap();
        assert_eq!(session.len(), 2);
        assert!(session[1].is_error);
        assert_eq!(h.controller.state(SESSION), Some(TurnState::Idle));
        assert!(!h.controller.is_executing(SESSION));
    }

    #[tokio::test]
    async fn test_sessions_run_independently() {
        let gate = Arc::new(Notify::new());
        let h = harness(
            ScriptedProvider::new("scripted").with_gate(gate.clone()),
            AgentConfig::new("scripted", "model-a"),
        );
        h.controller.create_session("s2", AGENT).unwrap();
        h.provider.push_stream(vec![Increment::Text("reply".into()), Increment::Done]);
        h.provider.push_stream(vec![Increment::Text("reply".into()), Increment::Done]);

        let first = h.controller.submit(SESSION, "one", None).into_handle().unwrap();
        let second = h.controller.submit("s2", "two", None).into_handle().unwrap();
        assert!(h.controller.is_executing(SESSION));
        assert!(h.controller.is_executing("s2"));

        let before = h.controller.get_session("s2").unwrap();
        assert!(matches!(
            h.controller.submit(SESSION, "again", None),
            SubmitOutcome::Rejected(RejectReason::Busy)
        ));
        assert!(h.controller.is_executing("s2"));
        assert_eq!(h.controller.get_session("s2").unwrap(), before);

        while h.provider.stream_requests().len() < 2 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();
        gate.notify_one();
        assert!(first.wait().await.is_completed());
        assert!(second.wait().await.is_completed());

        let mut sent: Vec<String> = h
            .provider
            .stream_requests()
            .iter()
            .map(|req| {
                assert_eq!(req.history.len(), 1);
                req.history[0].text.clone()
            })
            .collect();
        sent.sort();
        assert_eq!(sent, vec!["one", "two"]);
        for id in [SESSION, "s2"] {
            let session = h.controller.get_session(id).unwrap();
            assert_eq!(session.len(), 2);
            assert_eq!(session[1].text, "reply");
            assert_eq!(h.controller.state(id), Some(TurnState::Idle));
        }
    }

    #[test]
    fn test_history_projections() {
        let user = Message::user("weather?");
        let mut call_msg = Message::agent("Checking.");
        call_msg.tool_calls = Some(vec![tool_call("c1", "get_weather", json!({}))]);
        call_msg.status = Some(MessageStatus::ExecutingTool);
        let result = |id: &str, is_error: bool| {
            Message::tool_result(crate::inference::types::ToolResultPayload {
                tool_call_id: id.into(),
                tool_name: "get_weather".into(),
                result: json!({"temperature": "18°C"}),
                is_error,
            })
        };
        let mut bare_call = Message::agent("");
        bare_call.tool_calls = Some(vec![
            tool_call("c2", "get_weather", json!({})),
            tool_call("c3", "get_weather", json!({})),
        ]);
        let messages = vec![
            Message::error("Error: earlier failure"),
            user.clone(),
            call_msg.clone(),
            result("c1", false),
            Message::agent("18°C."),
            Message::user("again?"),
            bare_call,
            result("c2", false),
            result("c3", true),
        ];

        let tooled = dispatched_history(&messages);
        assert_eq!(tooled.len(), 8, "only the standalone error entry is dropped");
        assert!(tooled[7].is_error);

        let history = text_only_history(&messages);
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts.len(), 6, "{texts:?}");
        assert_eq!(history[0].id, user.id);
        assert_eq!(texts[1], "Checking.");
        assert!(history[1].tool_calls.is_none());
        assert!(texts[2].starts_with("Tool results:") && texts[2].contains("[get_weather #c1]"));
        assert_eq!(texts[3], "18°C.");
        assert_eq!(texts[4], "again?");
        assert!(texts[5].contains("#c2]") && texts[5].contains("[get_weather #c3] (failed)"));
        assert!(history.iter().all(|m| m.sender != Sender::ToolResult));
    }
}
