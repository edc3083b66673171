//! History policy — bounded conversation size via summarization.
//!
//! Before each turn the session is measured (tokens, words, sentences,
//! messages) including the incoming message. If the policy is enabled and any
//! configured threshold is met, the prior transcript is summarized with a
//! non-streaming call and the session collapses to `[summary, trigger]`.
//! A due compaction that cannot run fails the turn.

use std::sync::Arc;

use super::errors::AgentError;
use super::tokens::{count_sentences, count_words, estimate_message_tokens, truncate_utf8};
use super::types::{HistoryPolicyConfig, Thresholds};
use crate::inference::dispatcher::ProviderDispatcher;
use crate::inference::types::{Credentials, DispatchRequest, Message};

/// Marks an agent message as a compaction summary.
pub const SUMMARY_PREFIX: &str = "[Summary of earlier conversation]";

/// Size of `history + new message`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryMetrics {
    pub tokens: u64,
    pub words: u64,
    pub sentences: u64,
    pub messages: u64,
}

impl HistoryMetrics {
    pub fn measure(history: &[Message], new_message: &Message) -> Self {
        history
            .iter()
            .chain(std::iter::once(new_message))
            .fold(Self::default(), |acc, m| Self {
                tokens: acc.tokens + estimate_message_tokens(m),
                words: acc.words + count_words(&m.text),
                sentences: acc.sentences + count_sentences(&m.text),
                messages: acc.messages + 1,
            })
    }
}

impl Thresholds {
    /// Name of the first counter that meets its threshold, if any.
    pub fn exceeded_by(&self, metrics: &HistoryMetrics) -> Option<&'static str> {
        let checks = [
            ("token_count", self.token_count, metrics.tokens),
            ("word_count", self.word_count, metrics.words),
            ("sentence_count", self.sentence_count, metrics.sentences),
            ("message_count", self.message_count, metrics.messages),
        ];
        checks
            .into_iter()
            .find(|(_, limit, value)| limit.is_some_and(|l| *value >= l))
            .map(|(name, _, _)| name)
    }
}

/// What the policy decided for this turn.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyDecision {
    /// History stays as it is.
    Keep,
    /// History must become `[summary, new message]`.
    Compact { summary: Message },
}

pub struct HistoryPolicy {
    dispatcher: Arc<ProviderDispatcher>,
}

impl HistoryPolicy {
    pub fn new(dispatcher: Arc<ProviderDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Which threshold, if any, makes compaction due.
    pub fn compaction_due(
        config: &HistoryPolicyConfig,
        history: &[Message],
        new_message: &Message,
    ) -> Option<&'static str> {
        if !config.enabled {
            return None;
        }
        config
            .thresholds
            .exceeded_by(&HistoryMetrics::measure(history, new_message))
    }

    /// Decide and, when due, produce the summary.
    ///
    /// `credentials` are those of the summarization provider.
    pub async fn apply(
        &self,
        config: &HistoryPolicyConfig,
        credentials: &Credentials,
        history: &[Message],
        new_message: &Message,
    ) -> Result<PolicyDecision, AgentError> {
        let Some(trigger) = Self::compaction_due(config, history, new_message) else {
            return Ok(PolicyDecision::Keep);
        };

        let summarizer = &config.summarization;
        tracing::info!(
            trigger,
            message_count = history.len() + 1,
            provider = %summarizer.provider_id,
            model = %summarizer.model,
            "history threshold reached, compacting"
        );

        if !self.dispatcher.has_provider(&summarizer.provider_id) {
            return Err(AgentError::SummarizationUnavailable {
                provider_id: summarizer.provider_id.clone(),
                reason: "provider is not registered".into(),
            });
        }

        let request = DispatchRequest {
            model: summarizer.model.clone(),
            system_prompt: summarizer.system_prompt.clone(),
            history: vec![Message::user(render_transcript(history))],
            tools: None,
            output_directive: None,
        };

        let summary_text = self
            .dispatcher
            .complete(&summarizer.provider_id, credentials, request)
            .await
            .map_err(|e| AgentError::SummarizationUnavailable {
                provider_id: summarizer.provider_id.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            summary_chars = summary_text.len(),
            preview = %truncate_utf8(&summary_text, 80),
            "history compacted"
        );

        Ok(PolicyDecision::Compact {
            summary: Message::agent(format!("{SUMMARY_PREFIX}\n{}", summary_text.trim())),
        })
    }
}

/// Render messages as `sender: text` lines.
///
/// Error entries are left out; tool-call messages list the calls.
pub fn render_transcript(history: &[Message]) -> String {
    let mut lines = Vec::with_capacity(history.len());
    for msg in history.iter().filter(|m| !m.is_error) {
        let mut text = msg.text.clone();
        if let Some(calls) = msg.tool_calls.as_ref().filter(|c| !c.is_empty()) {
            let names: Vec<String> = calls
                .iter()
                .map(|c| format!("{}({})", c.name, c.arguments))
                .collect();
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&format!("[called {}]", names.join(", ")));
        }
        lines.push(format!("{}: {}", msg.sender.as_str(), text));
    }
    lines.join("\n")
}
