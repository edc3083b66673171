//! Agent configuration source.
//!
//! The controller reads configuration only through [`ConfigProvider`], which
//! is injected at construction. [`InMemoryConfigStore`] is the bundled
//! implementation, loadable from the `agents:` and `providers:` sections of
//! `agentflow.yaml`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::Deserialize;

use super::errors::AgentError;
use super::types::AgentConfig;
use crate::inference::config::{load_yaml, ProviderConfig};
use crate::inference::errors::ConfigError;
use crate::inference::types::Credentials;

/// An enabled backend and the credentials to call it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub provider_id: String,
    pub credentials: Credentials,
}

/// Read-only configuration access.
pub trait ConfigProvider: Send + Sync {
    /// Snapshot of the resolved configuration for an agent instance.
    fn get_agent_config(&self, instance_id: &str) -> Result<AgentConfig, AgentError>;

    fn list_enabled_providers(&self) -> Vec<ProviderCredentials>;

    /// Credentials for one provider; empty when it is not enabled.
    fn credentials_for(&self, provider_id: &str) -> Credentials {
        self.list_enabled_providers()
            .into_iter()
            .find(|p| p.provider_id == provider_id)
            .map(|p| p.credentials)
            .unwrap_or_default()
    }
}

// ─── Config File ────────────────────────────────────────────────────────────

/// Top-level layout of `agentflow.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    /// Agent instance id → configuration.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: AppConfig = load_yaml(path)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            providers = config.providers.len(),
            agents = config.agents.len(),
            "loaded config"
        );
        Ok(config)
    }

    /// Every agent must reference a configured provider, including its
    /// summarization provider when the history policy is enabled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, agent) in &self.agents {
            if !self.providers.contains_key(&agent.provider_id) {
                return Err(ConfigError::Invalid {
                    reason: format!("agent '{name}' uses unknown provider '{}'", agent.provider_id),
                });
            }
            let policy = &agent.history_policy;
            if policy.enabled && !self.providers.contains_key(&policy.summarization.provider_id) {
                return Err(ConfigError::Invalid {
                    reason: format!(
                        "agent '{name}' summarizes with unknown provider '{}'",
                        policy.summarization.provider_id
                    ),
                });
            }
        }
        Ok(())
    }
}

// ─── In-memory store ────────────────────────────────────────────────────────

/// Mutable store; every read hands out a cloned snapshot.
#[derive(Default)]
pub struct InMemoryConfigStore {
    agents: RwLock<HashMap<String, AgentConfig>>,
    providers: RwLock<Vec<ProviderCredentials>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        let store = Self::new();
        for (id, agent) in &config.agents {
            store.set_agent_config(id, agent.clone());
        }
        let mut ids: Vec<&String> = config.providers.keys().collect();
        ids.sort();
        for id in ids {
            let provider = &config.providers[id];
            if provider.enabled {
                store.set_provider_credentials(id, provider.credentials());
            }
        }
        store
    }

    pub fn set_agent_config(&self, instance_id: &str, config: AgentConfig) {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        agents.insert(instance_id.to_string(), config);
    }

    pub fn remove_agent_config(&self, instance_id: &str) -> Option<AgentConfig> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        agents.remove(instance_id)
    }

    /// Enable a provider (or replace its credentials).
    pub fn set_provider_credentials(&self, provider_id: &str, credentials: Credentials) {
        let mut providers = self.providers.write().unwrap_or_else(|e| e.into_inner());
        match providers.iter_mut().find(|p| p.provider_id == provider_id) {
            Some(entry) => entry.credentials = credentials,
            None => providers.push(ProviderCredentials {
                provider_id: provider_id.to_string(),
                credentials,
            }),
        }
    }
}

impl ConfigProvider for InMemoryConfigStore {
    fn get_agent_config(&self, instance_id: &str) -> Result<AgentConfig, AgentError> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        agents
            .get(instance_id)
            .cloned()
            .ok_or_else(|| AgentError::UnknownAgent {
                instance_id: instance_id.to_string(),
            })
    }

    fn list_enabled_providers(&self) -> Vec<ProviderCredentials> {
        self.providers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
