//! SSE streaming response parsing.
//!
//! [`parse_sse_stream`] reads an HTTP body as a byte stream, splits it on SSE
//! boundaries (`…\n\n`) and hands each event to a backend-specific
//! [`SseEventHandler`], which maps it onto [`Increment`]s. The OpenAI
//! handler lives here; the Anthropic one lives next to its request mapping.

use std::collections::VecDeque;
use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use super::errors::DispatchError;
use super::types::{ChatCompletionChunk, Increment, IncrementStream, ToolCall};

// ─── SSE framing ─────────────────────────────────────────────────────────────

/// Backend-specific mapping from SSE events to increments.
pub(crate) trait SseEventHandler: Send + 'static {
    /// Handle one complete SSE event (may contain several lines).
    fn on_event(&mut self, event: &str) -> Result<Vec<Increment>, DispatchError>;

    /// The byte stream ended. Flush anything still pending.
    fn on_end(&mut self) -> Result<Vec<Increment>, DispatchError>;
}

struct SseState<S, H> {
    bytes: std::pin::Pin<Box<S>>,
    handler: H,
    buffer: Vec<u8>,
    pending: VecDeque<Increment>,
    finished: bool,
    provider_id: String,
}

impl<S, H: SseEventHandler> SseState<S, H> {
    /// Queue handler output, stopping after the first terminal increment.
    fn enqueue(&mut self, produced: Result<Vec<Increment>, DispatchError>) {
        let increments = match produced {
            Ok(incs) => incs,
            Err(e) => vec![Increment::Error(e)],
        };
        for inc in increments {
            if self.finished {
                break;
            }
            self.finished = inc.is_terminal();
            self.pending.push_back(inc);
        }
    }

    fn next_event(&mut self) -> Option<String> {
        let end = self.buffer.windows(2).position(|w| w == b"\n\n")?;
        let event = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
        self.buffer.drain(..end + 2);
        Some(event)
    }
}

/// Turn a raw SSE byte stream into an [`IncrementStream`].
///
/// The buffer is kept as bytes so multi-byte characters split across network
/// chunks decode correctly. `\r` is dropped so `\r\n\r\n` boundaries work.
pub(crate) fn parse_sse_stream<S, B, E, H>(
    byte_stream: S,
    handler: H,
    provider_id: &str,
) -> IncrementStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Display,
    H: SseEventHandler,
{
    let state = SseState {
        bytes: Box::pin(byte_stream),
        handler,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        provider_id: provider_id.to_string(),
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(inc) = state.pending.pop_front() {
                return Some((inc, state));
            }
            if state.finished {
                return None;
            }

            // Drain any complete event already buffered
            if let Some(event) = state.next_event() {
                let produced = state.handler.on_event(&event);
                state.enqueue(produced);
                continue;
            }

            match state.bytes.next().await {
                Some(Ok(bytes)) => {
                    state
                        .buffer
                        .extend(bytes.as_ref().iter().copied().filter(|b| *b != b'\r'));
                }
                Some(Err(e)) => {
                    let err = DispatchError::Transport {
                        provider_id: state.provider_id.clone(),
                        reason: format!("stream read error: {e}"),
                    };
                    state.enqueue(Err(err));
                }
                None => {
                    let rest = String::from_utf8_lossy(&state.buffer).trim().to_string();
                    state.buffer.clear();
                    if !rest.is_empty() {
                        let produced = state.handler.on_event(&rest);
                        state.enqueue(produced);
                    }
                    let produced = state.handler.on_end();
                    state.enqueue(produced);
                    // Backend-agnostic guarantee: the stream always terminates.
                    if !state.finished {
                        state.enqueue(Ok(vec![Increment::Done]));
                    }
                }
            }
        }
    }))
}

/// Concatenate the `data:` lines of an SSE event.
pub(crate) fn event_data(event: &str) -> String {
    let mut data = String::new();
    for line in event.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            data.push_str(rest.trim());
        }
        // Ignore comments, `event:` and `id:` lines
    }
    data
}

/// Build a `ToolCall` from accumulated fragments.
///
/// Empty argument buffers mean "no arguments". A missing id is generated.
pub(crate) fn finalize_tool_call(
    provider_id: &str,
    id: Option<&str>,
    name: &str,
    args_json: &str,
) -> Result<ToolCall, DispatchError> {
    if name.trim().is_empty() {
        return Err(DispatchError::Transport {
            provider_id: provider_id.to_string(),
            reason: "tool call without a function name".into(),
        });
    }

    let arguments = if args_json.trim().is_empty() {
        serde_json::json!({})
    } else {
        serde_json::from_str(args_json).map_err(|e| DispatchError::Transport {
            provider_id: provider_id.to_string(),
            reason: format!("invalid JSON in tool call arguments for {name}: {e}"),
        })?
    };

    Ok(ToolCall {
        id: id
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
        name: name.to_string(),
        arguments,
    })
}

// ─── OpenAI Stream State ─────────────────────────────────────────────────────

/// Accumulates OpenAI tool-call fragments across SSE events.
pub(crate) struct OpenAiStreamState {
    provider_id: String,
    /// In-progress tool calls: `(index, id, name, arguments_buffer)`.
    pending_tool_calls: Vec<(u32, Option<String>, String, String)>,
}

impl OpenAiStreamState {
    pub(crate) fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            pending_tool_calls: Vec::new(),
        }
    }

    fn process_chunk(&mut self, chunk: ChatCompletionChunk) -> Result<Vec<Increment>, DispatchError> {
        if let Some(error) = chunk.error {
            let reason = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(DispatchError::Transport {
                provider_id: self.provider_id.clone(),
                reason,
            });
        }

        let choice = match chunk.choices.into_iter().next() {
            Some(c) => c,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                out.push(Increment::Text(content));
            }
        }

        if let Some(tool_calls) = choice.delta.tool_calls {
            for tc in tool_calls {
                let index = tc.index.unwrap_or(0);
                let (name_frag, args_frag) = match tc.function {
                    Some(f) => (f.name.unwrap_or_default(), f.arguments.unwrap_or_default()),
                    None => (String::new(), String::new()),
                };

                match self
                    .pending_tool_calls
                    .iter_mut()
                    .find(|(idx, _, _, _)| *idx == index)
                {
                    Some((_, id, name, args)) => {
                        name.push_str(&name_frag);
                        args.push_str(&args_frag);
                        if tc.id.is_some() {
                            *id = tc.id;
                        }
                    }
                    None => self
                        .pending_tool_calls
                        .push((index, tc.id, name_frag, args_frag)),
                }
            }
        }

        if choice.finish_reason.as_deref() == Some("tool_calls") {
            out.extend(self.flush_tool_calls()?);
        }

        Ok(out)
    }

    fn flush_tool_calls(&mut self) -> Result<Option<Increment>, DispatchError> {
        if self.pending_tool_calls.is_empty() {
            return Ok(None);
        }
        let mut pending = std::mem::take(&mut self.pending_tool_calls);
        pending.sort_by_key(|(index, _, _, _)| *index);

        let mut calls = Vec::with_capacity(pending.len());
        for (_index, id, name, args) in pending {
            calls.push(finalize_tool_call(
                &self.provider_id,
                id.as_deref(),
                &name,
                &args,
            )?);
        }
        Ok(Some(Increment::ToolCalls(calls)))
    }
}

impl SseEventHandler for OpenAiStreamState {
    fn on_event(&mut self, event: &str) -> Result<Vec<Increment>, DispatchError> {
        let data = event_data(event);
        if data.is_empty() {
            return Ok(Vec::new()); // keep-alive or comment
        }
        if data == "[DONE]" {
            let mut out: Vec<Increment> = self.flush_tool_calls()?.into_iter().collect();
            out.push(Increment::Done);
            return Ok(out);
        }

        let chunk: ChatCompletionChunk =
            serde_json::from_str(&data).map_err(|e| DispatchError::Transport {
                provider_id: self.provider_id.clone(),
                reason: format!("failed to parse SSE chunk: {e} (data: {data})"),
            })?;
        self.process_chunk(chunk)
    }

    fn on_end(&mut self) -> Result<Vec<Increment>, DispatchError> {
        Ok(self.flush_tool_calls()?.into_iter().collect())
    }
}

// ─── Non-streaming ───────────────────────────────────────────────────────────

/// Extract the assistant text from a non-streaming chat completion body.
pub(crate) fn parse_completion_text(provider_id: &str, body: &str) -> Result<String, DispatchError> {
    #[derive(Deserialize)]
    struct CompletionResponse {
        choices: Vec<CompletionChoice>,
    }

    #[derive(Deserialize)]
    struct CompletionChoice {
        message: CompletionMessage,
    }

    #[derive(Deserialize)]
    struct CompletionMessage {
        content: Option<String>,
    }

    let resp: CompletionResponse =
        serde_json::from_str(body).map_err(|e| DispatchError::Transport {
            provider_id: provider_id.to_string(),
            reason: format!("failed to parse completion response: {e}"),
        })?;

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| DispatchError::Transport {
            provider_id: provider_id.to_string(),
            reason: "empty choices array".into(),
        })?;

    Ok(choice.message.content.unwrap_or_default())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
