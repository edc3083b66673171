//! Agent Core — per-session conversation orchestration.
//!
//! Submodules:
//! - `controller`: Turn state machine, session ownership, event fan-out
//! - `stream_aggregator`: Folds an increment stream into one message
//! - `tool_engine`: Validates and runs tool-call batches
//! - `tool_registry`: Tool trait, function tools, name resolution
//! - `history_policy`: Threshold-driven summarization of long sessions
//! - `config_store`: Agent configuration source and `agentflow.yaml` layout
//! - `tokens`: Token, word and sentence estimation
//! - `types`: Shared types across the agent core
//! - `errors`: Agent-level error types

pub mod config_store;
pub mod controller;
pub mod errors;
pub mod history_policy;
pub mod stream_aggregator;
pub mod tokens;
pub mod tool_engine;
pub mod tool_registry;
pub mod types;

// Re-exports for convenience
pub use config_store::{AppConfig, ConfigProvider, InMemoryConfigStore, ProviderCredentials};
pub use controller::{ConversationController, RejectReason, SubmitOutcome, TurnHandle, TurnResult};
pub use errors::{AgentError, ToolError};
pub use history_policy::{HistoryPolicy, PolicyDecision};
pub use stream_aggregator::{StreamAggregator, StreamOutcome};
pub use tool_engine::{ToolEngineConfig, ToolExecutionEngine};
pub use tool_registry::{FunctionTool, Tool, ToolRegistry, ToolResolver};
pub use types::{
    AgentConfig, HistoryPolicyConfig, SessionEvent, SummarizationConfig, Thresholds, TurnState,
};
