//! Shared types for the dispatch surface.
//!
//! The first half is the provider-neutral vocabulary every backend maps onto
//! (messages, tool calls, increments). The second half mirrors the OpenAI Chat
//! Completions wire format used by the OpenAI-compatible backend.

use std::fmt;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DispatchError;

// ─── Capabilities ────────────────────────────────────────────────────────────

/// A named optional feature an agent declares and a backend may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Base conversational capability; gates the follow-up call after tools.
    Conversation,
    ToolUse,
    Grounding,
    ImageGeneration,
    VideoGeneration,
    Vision,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Conversation => "conversation",
            Capability::ToolUse => "tool_use",
            Capability::Grounding => "grounding",
            Capability::ImageGeneration => "image_generation",
            Capability::VideoGeneration => "video_generation",
            Capability::Vision => "vision",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Agent,
    ToolResult,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Agent => "agent",
            Sender::ToolResult => "tool_result",
        }
    }
}

/// Inline file attached to a user message. `data` is base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime_type: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Execution status of an agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    ExecutingTool,
}

/// A tool invocation issued by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this tool call (generated if the backend doesn't provide one).
    pub id: String,
    pub name: String,
    /// Structured JSON arguments.
    pub arguments: serde_json::Value,
}

/// Payload of a `tool_result` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_call_id: String,
    pub tool_name: String,
    pub result: serde_json::Value,
    pub is_error: bool,
}

/// Declared tool schema (JSON Schema for the parameters object).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub parameters: serde_json::Value,
}

fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// One entry of a session transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolResultPayload>,
    #[serde(default)]
    pub is_error: bool,
    /// RFC 3339 creation time.
    pub timestamp: String,
}

impl Message {
    fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender,
            text: text.into(),
            attachment: None,
            tool_calls: None,
            status: None,
            tool_result: None,
            is_error: false,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text)
    }

    pub fn user_with_attachment(text: impl Into<String>, attachment: Option<Attachment>) -> Self {
        let mut msg = Self::new(Sender::User, text);
        msg.attachment = attachment;
        msg
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self::new(Sender::Agent, text)
    }

    /// A user-visible error entry attributed to the agent.
    pub fn error(text: impl Into<String>) -> Self {
        let mut msg = Self::new(Sender::Agent, text);
        msg.is_error = true;
        msg
    }

    pub fn tool_result(payload: ToolResultPayload) -> Self {
        let text = serde_json::to_string(&payload.result).unwrap_or_default();
        let mut msg = Self::new(Sender::ToolResult, text);
        msg.is_error = payload.is_error;
        msg.tool_result = Some(payload);
        msg
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|calls| !calls.is_empty())
    }

    /// Copy of this message without tool calls or status, keeping the text.
    pub fn text_only(&self) -> Self {
        let mut msg = self.clone();
        msg.tool_calls = None;
        msg.status = None;
        msg
    }
}

// ─── Dispatch Requests ───────────────────────────────────────────────────────

/// How the model should format its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputDirective {
    Plain,
    Markdown,
    Json,
}

impl OutputDirective {
    /// Instruction appended to the system prompt by backends without a native
    /// structured-output switch.
    pub fn system_instruction(&self) -> &'static str {
        match self {
            OutputDirective::Plain => "Respond in plain text without Markdown formatting.",
            OutputDirective::Markdown => "Format the response as Markdown.",
            OutputDirective::Json => "Respond with a single valid JSON object and nothing else.",
        }
    }
}

/// API credentials for one backend.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
        }
    }

    /// A non-blank API key, if any.
    pub fn key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.key().map(|_| "<redacted>"))
            .finish()
    }
}

/// One chat-style call against a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRequest {
    pub model: String,
    pub system_prompt: String,
    pub history: Vec<Message>,
    pub tools: Option<Vec<ToolSchema>>,
    pub output_directive: Option<OutputDirective>,
}

/// Image generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default = "default_image_count")]
    pub count: u32,
}

fn default_image_count() -> u32 {
    1
}

/// One generated image, either inline (base64) or by URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Video generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
}

/// A long-running video generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoOperation {
    pub id: String,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
}

// ─── Increments ──────────────────────────────────────────────────────────────

/// One unit of a streamed backend response.
#[derive(Debug, Clone, PartialEq)]
pub enum Increment {
    /// A text fragment to append to the in-progress message.
    Text(String),
    /// The complete tool-call batch for this response.
    ToolCalls(Vec<ToolCall>),
    /// Terminal failure.
    Error(DispatchError),
    /// Terminal success marker.
    Done,
}

impl Increment {
    /// `Error` and `Done` end a stream; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Increment::Error(_) | Increment::Done)
    }
}

/// The stream every backend returns.
pub type IncrementStream = Pin<Box<dyn Stream<Item = Increment> + Send>>;

// ─── OpenAI Wire Types ───────────────────────────────────────────────────────

/// A single message in an OpenAI-style conversation.
///
/// `content` is serialized as `""` (not `null`) for assistant messages with
/// tool calls; several OpenAI-compatible runtimes reject `null` content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(serialize_with = "serialize_content")]
    pub content: Option<ChatContent>,
    /// Tool call results are sent back as `tool` role messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Assistant messages may contain tool calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallResponse>>,
}

/// Plain text or multimodal content parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One multimodal content part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

fn serialize_content<S>(value: &Option<ChatContent>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match value {
        Some(content) => content.serialize(serializer),
        None => serializer.serialize_str(""),
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Tool definition sent in the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

impl From<&ToolSchema> for ToolDefinition {
    fn from(schema: &ToolSchema) -> Self {
        Self {
            r#type: "function".to_string(),
            function: FunctionDefinition {
                name: schema.name.clone(),
                description: schema.description.clone(),
                parameters: schema.parameters.clone(),
            },
        }
    }
}

/// Function definition within a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Structured output format hint for the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    /// Currently only `"json_object"` is emitted.
    pub r#type: String,
}

/// Request body for `POST /chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

/// Tool call as sent back in an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCallResponse,
}

/// Function call details in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub name: String,
    pub arguments: String,
}

/// Raw SSE chunk from the OpenAI API.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// Some runtimes report mid-stream failures as an `error` object.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// A single choice within a streaming chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

/// The delta (incremental update) within a chunk choice.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ChunkToolCall>>,
}

/// A tool call fragment within a streaming delta.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkToolCall {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub function: Option<ChunkFunction>,
}

/// A function call fragment within a streaming tool call.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkFunction {
    pub name: Option<String>,
    pub arguments: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
