//! Anthropic Messages API backend.
//!
//! Maps the shared request onto `/v1/messages` content blocks and the SSE
//! event sequence (`content_block_start` / `content_block_delta` /
//! `message_stop`) back onto increments.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;
use serde_json::{json, Value};

use super::config::Timeouts;
use super::errors::DispatchError;
use super::provider::Provider;
use super::streaming::{event_data, finalize_tool_call, parse_sse_stream, SseEventHandler};
use super::types::{
    Capability, Credentials, DispatchRequest, Increment, IncrementStream, Message, Sender,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const SUMMARY_HEADER: &str = "## Previous conversation summary:";

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    capabilities: Vec<Capability>,
    max_tokens: u32,
    http: HttpClient,
    http_stream: HttpClient,
}

impl AnthropicProvider {
    pub fn new(
        id: &str,
        base_url: &str,
        capabilities: Vec<Capability>,
        max_tokens: Option<u32>,
        timeouts: &Timeouts,
    ) -> Result<Self, DispatchError> {
        let build = |total: u64| {
            HttpClient::builder()
                .connect_timeout(Duration::from_secs(timeouts.connect_secs))
                .timeout(Duration::from_secs(total))
                .build()
                .map_err(|e| DispatchError::Transport {
                    provider_id: id.to_string(),
                    reason: format!("failed to build HTTP client: {e}"),
                })
        };

        Ok(Self {
            id: id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            capabilities,
            max_tokens: max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            http: build(timeouts.request_secs)?,
            http_stream: build(timeouts.stream_secs)?,
        })
    }

    fn build_body(&self, request: &DispatchRequest, stream: bool) -> Value {
        let (system, messages) = to_anthropic_messages(request);
        let mut body = json!({
            "model": request.model,
            "max_tokens": self.max_tokens,
            "messages": messages,
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = Value::String(system);
        }
        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }
        body
    }

    async fn post(
        &self,
        client: &HttpClient,
        credentials: &Credentials,
        body: &Value,
    ) -> Result<reqwest::Response, DispatchError> {
        let url = format!("{}/messages", self.base_url);
        let response = client
            .post(&url)
            .header("x-api-key", credentials.key().unwrap_or_default())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| DispatchError::from_reqwest(&self.id, &url, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(DispatchError::from_status(&self.id, status.as_u16(), &body_text));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn stream(
        &self,
        credentials: &Credentials,
        request: DispatchRequest,
    ) -> Result<IncrementStream, DispatchError> {
        let body = self.build_body(&request, true);
        tracing::info!(
            provider = %self.id,
            model = %request.model,
            message_count = body["messages"].as_array().map(|m| m.len()).unwrap_or(0),
            has_tools = body.get("tools").is_some(),
            "=== LLM REQUEST ==="
        );

        let response = self.post(&self.http_stream, credentials, &body).await?;
        Ok(parse_sse_stream(
            response.bytes_stream(),
            AnthropicStreamState::new(&self.id),
            &self.id,
        ))
    }

    async fn complete(
        &self,
        credentials: &Credentials,
        request: DispatchRequest,
    ) -> Result<String, DispatchError> {
        #[derive(Deserialize)]
        struct MessagesResponse {
            content: Vec<ResponseBlock>,
        }

        #[derive(Deserialize)]
        struct ResponseBlock {
            #[serde(rename = "type")]
            kind: String,
            #[serde(default)]
            text: Option<String>,
        }

        let body = self.build_body(&request, false);
        let response = self.post(&self.http, credentials, &body).await?;
        let parsed: MessagesResponse = response.json().await.map_err(|e| DispatchError::Transport {
            provider_id: self.id.clone(),
            reason: format!("failed to parse messages response: {e}"),
        })?;

        Ok(parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join(""))
    }
}

// ─── Message mapping ─────────────────────────────────────────────────────────

/// Build `(system, messages)` for the Messages API.
///
/// The API requires the conversation to open with a user turn and to
/// alternate roles, so leading agent messages (a compaction summary) are
/// folded into the system prompt and consecutive same-role blocks are merged.
fn to_anthropic_messages(request: &DispatchRequest) -> (String, Vec<Value>) {
    let mut system = request.system_prompt.clone();
    if let Some(directive) = request.output_directive {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(directive.system_instruction());
    }

    let leading = request
        .history
        .iter()
        .take_while(|m| m.sender == Sender::Agent)
        .count();
    if leading > 0 {
        let summary: Vec<&str> = request.history[..leading]
            .iter()
            .map(|m| m.text.as_str())
            .collect();
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(SUMMARY_HEADER);
        system.push('\n');
        system.push_str(&summary.join("\n"));
    }

    let mut messages: Vec<Value> = Vec::new();
    for msg in &request.history[leading..] {
        let (role, blocks) = to_blocks(msg);
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(content) = last["content"].as_array_mut() {
                    content.extend(blocks);
                }
            }
            _ => messages.push(json!({ "role": role, "content": blocks })),
        }
    }

    (system, messages)
}

fn to_blocks(msg: &Message) -> (&'static str, Vec<Value>) {
    match msg.sender {
        Sender::User => {
            let mut blocks = Vec::new();
            if let Some(att) = msg.attachment.as_ref().filter(|a| a.is_image()) {
                blocks.push(json!({
                    "type": "image",
                    "source": { "type": "base64", "media_type": att.mime_type, "data": att.data },
                }));
            }
            if !msg.text.is_empty() {
                blocks.push(json!({ "type": "text", "text": msg.text }));
            }
            ("user", blocks)
        }
        Sender::Agent => {
            let mut blocks = Vec::new();
            if !msg.text.is_empty() {
                blocks.push(json!({ "type": "text", "text": msg.text }));
            }
            for call in msg.tool_calls.iter().flatten() {
                blocks.push(json!({
                    "type": "tool_use",
                    "id": call.id,
                    "name": call.name,
                    "input": call.arguments,
                }));
            }
            ("assistant", blocks)
        }
        Sender::ToolResult => {
            let blocks = match &msg.tool_result {
                Some(payload) => vec![json!({
                    "type": "tool_result",
                    "tool_use_id": payload.tool_call_id,
                    "content": payload.result.to_string(),
                    "is_error": payload.is_error,
                })],
                None => Vec::new(),
            };
            ("user", blocks)
        }
    }
}

// ─── Stream State ────────────────────────────────────────────────────────────

/// Maps Messages API SSE events onto increments.
struct AnthropicStreamState {
    provider_id: String,
    /// In-progress `tool_use` blocks: `(index, id, name, json_buffer)`.
    pending_tools: Vec<(u64, String, String, String)>,
}

impl AnthropicStreamState {
    fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            pending_tools: Vec::new(),
        }
    }

    fn flush_tools(&mut self) -> Result<Option<Increment>, DispatchError> {
        if self.pending_tools.is_empty() {
            return Ok(None);
        }
        let pending = std::mem::take(&mut self.pending_tools);
        let mut calls = Vec::with_capacity(pending.len());
        for (_index, id, name, json_buf) in pending {
            calls.push(finalize_tool_call(&self.provider_id, Some(&id), &name, &json_buf)?);
        }
        Ok(Some(Increment::ToolCalls(calls)))
    }
}

impl SseEventHandler for AnthropicStreamState {
    fn on_event(&mut self, event: &str) -> Result<Vec<Increment>, DispatchError> {
        let data = event_data(event);
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(&data).map_err(|e| DispatchError::Transport {
            provider_id: self.provider_id.clone(),
            reason: format!("failed to parse SSE event: {e} (data: {data})"),
        })?;

        match value["type"].as_str().unwrap_or_default() {
            "content_block_start" => {
                let block = &value["content_block"];
                if block["type"] == "tool_use" {
                    self.pending_tools.push((
                        value["index"].as_u64().unwrap_or(0),
                        block["id"].as_str().unwrap_or_default().to_string(),
                        block["name"].as_str().unwrap_or_default().to_string(),
                        String::new(),
                    ));
                }
                Ok(Vec::new())
            }
            "content_block_delta" => {
                let delta = &value["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if text.is_empty() {
                            Ok(Vec::new())
                        } else {
                            Ok(vec![Increment::Text(text.to_string())])
                        }
                    }
                    "input_json_delta" => {
                        let index = value["index"].as_u64().unwrap_or(0);
                        let partial = delta["partial_json"].as_str().unwrap_or_default();
                        if let Some((_, _, _, buf)) =
                            self.pending_tools.iter_mut().find(|(i, _, _, _)| *i == index)
                        {
                            buf.push_str(partial);
                        }
                        Ok(Vec::new())
                    }
                    _ => Ok(Vec::new()),
                }
            }
            "message_delta" => {
                if value["delta"]["stop_reason"] == "tool_use" {
                    Ok(self.flush_tools()?.into_iter().collect())
                } else {
                    Ok(Vec::new())
                }
            }
            "message_stop" => {
                let mut out: Vec<Increment> = self.flush_tools()?.into_iter().collect();
                out.push(Increment::Done);
                Ok(out)
            }
            "error" => {
                let kind = value["error"]["type"].as_str().unwrap_or_default();
                let reason = value["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error")
                    .to_string();
                let provider_id = self.provider_id.clone();
                if kind == "authentication_error" || kind == "permission_error" {
                    Err(DispatchError::Authentication { provider_id, reason })
                } else {
                    Err(DispatchError::Transport { provider_id, reason })
                }
            }
            // message_start, content_block_stop, ping
            _ => Ok(Vec::new()),
        }
    }

    fn on_end(&mut self) -> Result<Vec<Increment>, DispatchError> {
        Ok(self.flush_tools()?.into_iter().collect())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
