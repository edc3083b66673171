//! Dispatch error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the context needed to build
//! meaningful log entries.
//!
//! `DispatchError` is `Clone` because it travels inside [`Increment::Error`]
//! values that observers may copy.
//!
//! [`Increment::Error`]: super::types::Increment::Error

use thiserror::Error;

/// Errors that can occur while dispatching to a model backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// No backend is registered under this provider id.
    #[error("unknown provider: {provider_id}")]
    UnknownProvider {
        provider_id: String,
    },

    /// The backend does not implement the requested extension.
    #[error("provider {provider_id} does not support {capability}")]
    UnsupportedCapability {
        provider_id: String,
        capability: String,
    },

    /// Missing or rejected credentials.
    #[error("authentication failed for {provider_id}: {reason}")]
    Authentication {
        provider_id: String,
        reason: String,
    },

    /// Network, HTTP or decode failure.
    #[error("transport error from {provider_id}: {reason}")]
    Transport {
        provider_id: String,
        reason: String,
    },
}

impl DispatchError {
    /// Build an error from a non-2xx HTTP status.
    ///
    /// 401 and 403 mean the backend rejected the credentials; everything else
    /// is a transport failure.
    pub fn from_status(provider_id: &str, status: u16, body: &str) -> Self {
        if status == 401 || status == 403 {
            DispatchError::Authentication {
                provider_id: provider_id.to_string(),
                reason: format!("HTTP {status}: {body}"),
            }
        } else {
            DispatchError::Transport {
                provider_id: provider_id.to_string(),
                reason: format!("HTTP {status}: {body}"),
            }
        }
    }

    /// Build a transport error from a `reqwest` failure.
    pub fn from_reqwest(provider_id: &str, url: &str, err: &reqwest::Error) -> Self {
        let reason = if err.is_connect() {
            format!("connection to {url} failed: {err}")
        } else if err.is_timeout() {
            format!("request to {url} timed out: {err}")
        } else {
            format!("request to {url} failed: {err}")
        };
        DispatchError::Transport {
            provider_id: provider_id.to_string(),
            reason,
        }
    }

    /// The provider id this error refers to.
    pub fn provider_id(&self) -> &str {
        match self {
            DispatchError::UnknownProvider { provider_id }
            | DispatchError::UnsupportedCapability { provider_id, .. }
            | DispatchError::Authentication { provider_id, .. }
            | DispatchError::Transport { provider_id, .. } => provider_id,
        }
    }

    /// Whether this is an authentication failure.
    pub fn is_authentication(&self) -> bool {
        matches!(self, DispatchError::Authentication { .. })
    }
}

/// Configuration loading or validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no config file found (searched: {})", searched.join(", "))]
    NotFound {
        searched: Vec<String>,
    },

    #[error("failed to read {path}: {reason}")]
    Read {
        path: String,
        reason: String,
    },

    #[error("failed to parse config: {reason}")]
    Parse {
        reason: String,
    },

    #[error("invalid config: {reason}")]
    Invalid {
        reason: String,
    },
}
