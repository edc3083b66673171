//! Shared types for the agent core.
//!
//! Agent configuration snapshots, history-policy parameters, the turn state
//! machine and the events observers receive.

use serde::{Deserialize, Serialize};

use crate::inference::types::{Capability, Message, OutputDirective, ToolSchema};

// ─── Agent Configuration ────────────────────────────────────────────────────

/// Resolved configuration of one agent instance.
///
/// Read once per turn and used unchanged until the turn ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub provider_id: String,
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    #[serde(default)]
    pub output_directive: Option<OutputDirective>,
    #[serde(default)]
    pub history_policy: HistoryPolicyConfig,
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::Conversation]
}

impl AgentConfig {
    pub fn new(provider_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            model: model.into(),
            system_prompt: String::new(),
            capabilities: default_capabilities(),
            tools: Vec::new(),
            output_directive: None,
            history_policy: HistoryPolicyConfig::default(),
        }
    }

    pub fn declares(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

// ─── History Policy ─────────────────────────────────────────────────────────

/// When and how to compact a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryPolicyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub summarization: SummarizationConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
}

/// The backend call that produces the summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizationConfig {
    pub provider_id: String,
    pub model: String,
    #[serde(default = "default_summary_prompt")]
    pub system_prompt: String,
}

fn default_summary_prompt() -> String {
    "Summarize the conversation below. Keep names, numbers, decisions and open \
     questions. Write in the third person and stay under 200 words."
        .to_string()
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            provider_id: String::new(),
            model: String::new(),
            system_prompt: default_summary_prompt(),
        }
    }
}

/// Size limits. An unset limit never fires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default)]
    pub token_count: Option<u64>,
    #[serde(default)]
    pub word_count: Option<u64>,
    #[serde(default)]
    pub sentence_count: Option<u64>,
    #[serde(default)]
    pub message_count: Option<u64>,
}

// ─── Turn State ─────────────────────────────────────────────────────────────

/// Per-session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Submitting,
    Streaming,
    ExecutingTools,
    FollowUpStreaming,
    Error,
}

impl TurnState {
    /// True in every state except `Idle` and `Error`.
    pub fn is_executing(&self) -> bool {
        !matches!(self, TurnState::Idle | TurnState::Error)
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Session mutations, broadcast to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        session_id: String,
        state: TurnState,
    },
    /// The in-progress agent message grew or changed shape.
    DraftUpdated {
        session_id: String,
        draft: Message,
    },
    MessageAppended {
        session_id: String,
        message: Message,
    },
    /// A committed message changed (e.g. tool-call status cleared).
    MessageUpdated {
        session_id: String,
        message: Message,
    },
    /// History was replaced by `[summary, triggering message]`.
    HistoryCompacted {
        session_id: String,
        summary: Message,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &str {
        match self {
            SessionEvent::StateChanged { session_id, .. }
            | SessionEvent::DraftUpdated { session_id, .. }
            | SessionEvent::MessageAppended { session_id, .. }
            | SessionEvent::MessageUpdated { session_id, .. }
            | SessionEvent::HistoryCompacted { session_id, .. } => session_id,
        }
    }
}
