//! Agent Core error types.

use thiserror::Error;

use crate::inference::errors::{ConfigError, DispatchError};

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Compaction was due but the summary could not be produced.
    #[error("summarization unavailable via '{provider_id}': {reason}")]
    SummarizationUnavailable { provider_id: String, reason: String },

    /// Stream-level or dispatch failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A follow-up stream produced tool calls; follow-ups are text-only.
    #[error("follow-up response requested {count} tool call(s); tools are not offered on follow-up")]
    UnexpectedToolCalls { count: usize },

    /// No configuration exists for this agent instance.
    #[error("no configuration for agent instance '{instance_id}'")]
    UnknownAgent { instance_id: String },

    /// A session with this id is already registered.
    #[error("session already exists: '{session_id}'")]
    SessionExists { session_id: String },

    /// Configuration loading or validation failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The turn task ended without reporting a result.
    #[error("turn task failed: {reason}")]
    TaskFailed { reason: String },
}

/// Errors scoped to a single tool call. Never fatal to the turn.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    /// The name did not resolve, or the tool is not whitelisted.
    #[error("tool not found: {name}")]
    NotFound { name: String },

    /// Arguments do not match the declared schema.
    #[error("invalid arguments for '{tool_name}': {reason}")]
    InvalidArguments { tool_name: String, reason: String },

    /// The tool ran and failed.
    #[error("tool '{tool_name}' failed: {reason}")]
    Execution { tool_name: String, reason: String },

    /// The tool failed in a way worth retrying (network blip, busy resource).
    #[error("tool '{tool_name}' temporarily unavailable: {reason}")]
    Transient { tool_name: String, reason: String },

    #[error("tool '{tool_name}' timed out after {timeout_ms}ms")]
    Timeout { tool_name: String, timeout_ms: u64 },
}

impl ToolError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, ToolError::Transient { .. })
    }

    /// Stable machine-readable kind, recorded in the error result payload.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::NotFound { .. } => "tool_not_found",
            ToolError::InvalidArguments { .. } => "invalid_arguments",
            ToolError::Execution { .. } => "execution_error",
            ToolError::Transient { .. } => "transient_error",
            ToolError::Timeout { .. } => "timeout",
        }
    }
}

/// Describe why a spawned task ended without a value.
pub(crate) fn join_failure_reason(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());
    match message {
        Some(m) => format!("panicked: {m}"),
        None => "panicked".to_string(),
    }
}
