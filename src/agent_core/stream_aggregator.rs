//! Stream aggregation — one increment stream in, one message out.
//!
//! The aggregator owns the single in-progress agent message (the draft).
//! Text increments append to it; the first tool-call, error or done
//! increment ends it. The draft keeps its id from creation to commit.

use futures::StreamExt;

use super::errors::AgentError;
use crate::inference::types::{Increment, IncrementStream, Message, MessageStatus};

/// How a stream ended.
#[derive(Debug)]
pub enum StreamOutcome {
    /// Plain text answer.
    Text(Message),
    /// The model requested tools; the message carries the calls and
    /// `executing_tool` status.
    ToolCalls(Message),
    /// The stream failed; the message is the error entry to commit.
    Failed { message: Message, error: AgentError },
}

impl StreamOutcome {
    pub fn message(&self) -> &Message {
        match self {
            StreamOutcome::Text(m) | StreamOutcome::ToolCalls(m) => m,
            StreamOutcome::Failed { message, .. } => message,
        }
    }
}

enum Phase {
    Streaming,
    Finished(StreamOutcome),
}

pub struct StreamAggregator {
    draft: Message,
    accept_tool_calls: bool,
    phase: Phase,
}

impl StreamAggregator {
    /// `accept_tool_calls = false` turns a tool-call increment into a failure.
    pub fn new(accept_tool_calls: bool) -> Self {
        Self {
            draft: Message::agent(""),
            accept_tool_calls,
            phase: Phase::Streaming,
        }
    }

    /// The current materialization of the in-progress message.
    pub fn draft(&self) -> &Message {
        match &self.phase {
            Phase::Streaming => &self.draft,
            Phase::Finished(outcome) => outcome.message(),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, Phase::Finished(_))
    }

    /// Apply one increment. Returns `true` when the draft changed.
    ///
    /// Increments after the stream finished are ignored.
    pub fn apply(&mut self, increment: Increment) -> bool {
        if self.is_finished() {
            return false;
        }

        match increment {
            Increment::Text(text) => {
                if text.is_empty() {
                    return false;
                }
                self.draft.text.push_str(&text);
                true
            }
            Increment::ToolCalls(calls) if !self.accept_tool_calls => {
                let error = AgentError::UnexpectedToolCalls { count: calls.len() };
                self.fail(error);
                true
            }
            Increment::ToolCalls(calls) => {
                // Any preamble text stays with the tool-call message.
                let mut msg = self.take_draft();
                msg.tool_calls = Some(calls);
                msg.status = Some(MessageStatus::ExecutingTool);
                self.phase = Phase::Finished(StreamOutcome::ToolCalls(msg));
                true
            }
            Increment::Error(e) => {
                self.fail(AgentError::Dispatch(e));
                true
            }
            Increment::Done => {
                let msg = self.take_draft();
                self.phase = Phase::Finished(StreamOutcome::Text(msg));
                false
            }
        }
    }

    /// Finish the aggregation. A stream that ended without a terminal
    /// increment is treated as done.
    pub fn into_outcome(self) -> StreamOutcome {
        match self.phase {
            Phase::Finished(outcome) => outcome,
            Phase::Streaming => StreamOutcome::Text(self.draft),
        }
    }

    fn take_draft(&mut self) -> Message {
        std::mem::replace(&mut self.draft, Message::agent(""))
    }

    /// Partial text is discarded; the error entry reuses the draft id.
    fn fail(&mut self, error: AgentError) {
        let mut msg = Message::error(format!("Error: {error}"));
        msg.id = self.draft.id.clone();
        self.phase = Phase::Finished(StreamOutcome::Failed {
            message: msg,
            error,
        });
    }
}

/// Drain a stream through a fresh aggregator, reporting every draft change.
pub async fn aggregate<F>(
    mut stream: IncrementStream,
    accept_tool_calls: bool,
    mut on_draft: F,
) -> StreamOutcome
where
    F: FnMut(&Message) + Send,
{
    let mut aggregator = StreamAggregator::new(accept_tool_calls);
    while let Some(increment) = stream.next().await {
        if aggregator.apply(increment) {
            on_draft(aggregator.draft());
        }
        if aggregator.is_finished() {
            break;
        }
    }
    aggregator.into_outcome()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::errors::DispatchError;
    use crate::inference::types::ToolCall;
    use futures::stream;

    fn boxed(increments: Vec<Increment>) -> IncrementStream {
        Box::pin(stream::iter(increments))
    }

    fn weather_call() -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            arguments: serde_json::json!({"location": "Paris"}),
        }
    }

    #[tokio::test]
    async fn test_text_is_monotonic_concatenation() {
        let mut seen: Vec<String> = Vec::new();
        let outcome = aggregate(
            boxed(vec![
                Increment::Text("It is ".into()),
                Increment::Text("".into()),
                Increment::Text("18°C ".into()),
                Increment::Text("in Paris.".into()),
                Increment::Done,
            ]),
            true,
            |draft| seen.push(draft.text.clone()),
        )
        .await;

        for pair in seen.windows(2) {
            assert!(pair[1].len() >= pair[0].len());
            assert!(pair[1].starts_with(&pair[0]));
        }
        match outcome {
            StreamOutcome::Text(msg) => assert_eq!(msg.text, "It is 18°C in Paris."),
            other => panic!("expected text, got {other:?}"),
        }
        assert_eq!(seen.len(), 3, "empty increments do not notify");
    }

    #[tokio::test]
    async fn test_tool_calls_end_the_stream() {
        let mut last_draft = None;
        let outcome = aggregate(
            boxed(vec![
                Increment::Text("Let me check.".into()),
                Increment::ToolCalls(vec![weather_call()]),
                Increment::Text("ignored".into()),
                Increment::Done,
            ]),
            true,
            |draft| last_draft = Some(draft.clone()),
        )
        .await;

        match outcome {
            StreamOutcome::ToolCalls(msg) => {
                assert_eq!(msg.text, "Let me check.");
                assert_eq!(msg.status, Some(MessageStatus::ExecutingTool));
                assert_eq!(msg.tool_calls.as_ref().unwrap()[0].name, "get_weather");
                assert_eq!(last_draft.unwrap().id, msg.id);
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_discards_partial_text() {
        let mut agg = StreamAggregator::new(true);
        let draft_id = agg.draft().id.clone();
        agg.apply(Increment::Text("partial answer".into()));
        agg.apply(Increment::Error(DispatchError::Transport {
            provider_id: "p".into(),
            reason: "connection reset".into(),
        }));
        assert!(agg.is_finished());
        assert!(!agg.apply(Increment::Text("more".into())));

        match agg.into_outcome() {
            StreamOutcome::Failed { message, error } => {
                assert!(message.is_error);
                assert_eq!(message.id, draft_id);
                assert!(!message.text.contains("partial answer"));
                assert!(message.text.contains("connection reset"));
                assert!(matches!(error, AgentError::Dispatch(_)));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_calls_rejected_when_not_accepted() {
        let outcome = aggregate(
            boxed(vec![Increment::ToolCalls(vec![weather_call()])]),
            false,
            |_| {},
        )
        .await;
        assert!(matches!(
            outcome,
            StreamOutcome::Failed {
                error: AgentError::UnexpectedToolCalls { count: 1 },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_stream_ending_without_terminal_is_done() {
        let outcome = aggregate(boxed(vec![Increment::Text("abc".into())]), true, |_| {}).await;
        assert!(matches!(outcome, StreamOutcome::Text(m) if m.text == "abc"));
    }
}
