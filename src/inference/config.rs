//! Provider configuration loading.
//!
//! Reads the `providers:` section of the config file, resolves environment
//! variables and builds the dispatcher's routing table. The file lookup and
//! interpolation helpers are shared with the agent configuration loader.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::anthropic::AnthropicProvider;
use super::dispatcher::ProviderDispatcher;
use super::errors::{ConfigError, DispatchError};
use super::openai::OpenAiProvider;
use super::provider::Provider;
use super::types::{Capability, Credentials};

/// Env var that points directly at a config file.
pub const CONFIG_ENV_VAR: &str = "AGENTFLOW_CONFIG";

/// File name searched for upward from the working directory.
pub const CONFIG_FILE_NAME: &str = "agentflow.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Which wire protocol a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OpenAI Chat Completions (OpenAI, OpenRouter, Ollama, vLLM, …).
    OpenaiCompatible,
    /// Anthropic Messages API.
    Anthropic,
}

impl ProviderKind {
    fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenaiCompatible => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
        }
    }
}

/// HTTP timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// TCP connection timeout.
    pub connect_secs: u64,
    /// Total timeout for non-streaming calls.
    pub request_secs: u64,
    /// Total timeout for streaming calls. Large contexts can take a long time
    /// to produce the first token.
    pub stream_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
            stream_secs: 180,
        }
    }
}

/// One backend entry under `providers:`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Local runtimes (Ollama, LM Studio) set this to `false`.
    #[serde(default = "default_true")]
    pub requires_api_key: bool,
    #[serde(default)]
    pub capabilities: Option<Vec<Capability>>,
    /// Anthropic only: `max_tokens` sent with every request.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_true() -> bool {
    true
}

impl ProviderConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            api_key: self.api_key.clone(),
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.capabilities.clone().unwrap_or_else(|| {
            vec![
                Capability::Conversation,
                Capability::ToolUse,
                Capability::Vision,
            ]
        })
    }

    /// Instantiate the backend for this entry.
    pub fn build(&self, id: &str) -> Result<Arc<dyn Provider>, DispatchError> {
        let provider: Arc<dyn Provider> = match self.kind {
            ProviderKind::OpenaiCompatible => Arc::new(OpenAiProvider::new(
                id,
                self.base_url(),
                self.capabilities(),
                self.requires_api_key,
                &self.timeouts,
            )?),
            ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(
                id,
                self.base_url(),
                self.capabilities(),
                self.max_tokens,
                &self.timeouts,
            )?),
        };
        Ok(provider)
    }
}

/// Build the routing table from every enabled provider entry.
pub fn build_dispatcher(
    providers: &HashMap<String, ProviderConfig>,
) -> Result<ProviderDispatcher, DispatchError> {
    let mut ids: Vec<&String> = providers.keys().collect();
    ids.sort();

    let mut dispatcher = ProviderDispatcher::new();
    for id in ids {
        let cfg = &providers[id];
        if !cfg.enabled {
            tracing::debug!(provider = %id, "provider disabled, skipping");
            continue;
        }
        dispatcher.register(cfg.build(id)?);
    }

    tracing::info!(providers = ?dispatcher.provider_ids(), "provider routing table built");
    Ok(dispatcher)
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Order: `AGENTFLOW_CONFIG`, then `agentflow.yaml` searched upward from
/// `start`, then `<config_dir>/agentflow/config.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    let mut searched = Vec::new();

    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        searched.push(candidate.display().to_string());
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }
    searched.push(format!("{CONFIG_FILE_NAME} above {}", start.display()));

    // 3. Platform config dir
    if let Some(config_dir) = dirs::config_dir() {
        let candidate = config_dir.join("agentflow").join("config.yaml");
        if candidate.exists() {
            return Ok(candidate);
        }
        searched.push(candidate.display().to_string());
    }

    Err(ConfigError::NotFound { searched })
}

/// Read a YAML file, interpolate `${VAR}` / `${VAR:-default}` and deserialize.
pub fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
        reason: format!("{}: {e}", path.display()),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
pub(crate) fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
