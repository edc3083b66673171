//! Inference — the provider dispatch surface.
//!
//! This module owns every interaction with model-serving backends:
//! - The [`Provider`] contract and its capability-gated extensions
//! - The [`ProviderDispatcher`] routing table (provider id → backend)
//! - SSE stream parsing onto the shared [`Increment`] shapes
//! - OpenAI-compatible and Anthropic backends
//! - Provider configuration loading from `agentflow.yaml`
//!
//! Nothing above this boundary knows which backend it is talking to.

pub mod anthropic;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod openai;
pub mod provider;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use config::{build_dispatcher, ProviderConfig, ProviderKind, Timeouts};
pub use dispatcher::ProviderDispatcher;
pub use errors::{ConfigError, DispatchError};
pub use provider::Provider;
pub use types::{
    Attachment, Capability, Credentials, DispatchRequest, Increment, IncrementStream, Message,
    MessageStatus, OutputDirective, Sender, ToolCall, ToolResultPayload, ToolSchema,
};
