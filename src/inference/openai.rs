//! OpenAI-compatible backend.
//!
//! Speaks the Chat Completions API, which makes OpenAI, OpenRouter, Ollama,
//! LM Studio and vLLM interchangeable via `base_url`. Also serves image
//! generation through `POST /images/generations`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use serde::Deserialize;

use super::config::Timeouts;
use super::errors::DispatchError;
use super::provider::{unsupported, Provider};
use super::streaming::{parse_completion_text, parse_sse_stream, OpenAiStreamState};
use super::types::{
    Capability, ChatCompletionRequest, ChatContent, ChatMessage, ContentPart, Credentials,
    DispatchRequest, FunctionCallResponse, GeneratedImage, ImageRequest, ImageUrl,
    IncrementStream, Message, OutputDirective, ResponseFormat, Role, Sender, ToolCallResponse,
    ToolDefinition,
};

pub struct OpenAiProvider {
    id: String,
    base_url: String,
    capabilities: Vec<Capability>,
    requires_api_key: bool,
    /// Non-streaming requests.
    http: HttpClient,
    /// Streaming requests (longer total timeout).
    http_stream: HttpClient,
}

impl OpenAiProvider {
    pub fn new(
        id: &str,
        base_url: &str,
        capabilities: Vec<Capability>,
        requires_api_key: bool,
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
            requires_api_key,
            http: build(timeouts.request_secs)?,
            http_stream: build(timeouts.stream_secs)?,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(&self, request: &DispatchRequest, stream: bool) -> ChatCompletionRequest {
        let tools: Option<Vec<ToolDefinition>> = request
            .tools
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| t.iter().map(ToolDefinition::from).collect());

        let response_format = match request.output_directive {
            Some(OutputDirective::Json) => Some(ResponseFormat {
                r#type: "json_object".to_string(),
            }),
            _ => None,
        };

        ChatCompletionRequest {
            model: request.model.clone(),
            messages: to_chat_messages(request),
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            stream,
            response_format,
        }
    }

    async fn post(
        &self,
        client: &HttpClient,
        url: &str,
        credentials: &Credentials,
        body: &impl serde::Serialize,
        event_stream: bool,
    ) -> Result<reqwest::Response, DispatchError> {
        let mut req = client.post(url).json(body);
        if let Some(key) = credentials.key() {
            req = req.bearer_auth(key);
        }
        if event_stream {
            req = req.header("Accept", "text/event-stream");
        }

        let response = req
            .send()
            .await
            .map_err(|e| DispatchError::from_reqwest(&self.id, url, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(DispatchError::from_status(&self.id, status.as_u16(), &body_text));
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn requires_credentials(&self) -> bool {
        self.requires_api_key
    }

    async fn stream(
        &self,
        credentials: &Credentials,
        request: DispatchRequest,
    ) -> Result<IncrementStream, DispatchError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&request, true);

        // Log the request metadata (not the full body, it can be huge)
        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            has_tools = body.tools.is_some(),
            stream = body.stream,
            "=== LLM REQUEST ==="
        );

        let response = self
            .post(&self.http_stream, &url, credentials, &body, true)
            .await?;
        Ok(parse_sse_stream(
            response.bytes_stream(),
            OpenAiStreamState::new(&self.id),
            &self.id,
        ))
    }

    async fn complete(
        &self,
        credentials: &Credentials,
        request: DispatchRequest,
    ) -> Result<String, DispatchError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_body(&request, false);
        let response = self.post(&self.http, &url, credentials, &body, false).await?;
        let text = response
            .text()
            .await
            .map_err(|e| DispatchError::from_reqwest(&self.id, &url, &e))?;
        parse_completion_text(&self.id, &text)
    }

    async fn generate_image(
        &self,
        credentials: &Credentials,
        request: ImageRequest,
    ) -> Result<Vec<GeneratedImage>, DispatchError> {
        if !self.supports(Capability::ImageGeneration) {
            return Err(unsupported(&self.id, Capability::ImageGeneration));
        }

        #[derive(Deserialize)]
        struct ImagesResponse {
            data: Vec<ImageDatum>,
        }

        #[derive(Deserialize)]
        struct ImageDatum {
            b64_json: Option<String>,
            url: Option<String>,
        }

        let url = format!("{}/images/generations", self.base_url);
        let mut body = serde_json::json!({
            "model": request.model,
            "prompt": request.prompt,
            "n": request.count.max(1),
            "response_format": "b64_json",
        });
        if let Some(size) = &request.size {
            body["size"] = serde_json::Value::String(size.clone());
        }

        tracing::info!(url = %url, model = %request.model, n = request.count, "image generation request");

        let response = self.post(&self.http, &url, credentials, &body, false).await?;
        let parsed: ImagesResponse = response.json().await.map_err(|e| DispatchError::Transport {
            provider_id: self.id.clone(),
            reason: format!("failed to parse image response: {e}"),
        })?;

        Ok(parsed
            .data
            .into_iter()
            .map(|d| GeneratedImage {
                mime_type: "image/png".to_string(),
                data: d.b64_json,
                url: d.url,
            })
            .collect())
    }
}

// ─── Message mapping ─────────────────────────────────────────────────────────

/// Map the provider-neutral request onto OpenAI chat messages.
fn to_chat_messages(request: &DispatchRequest) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(request.history.len() + 1);

    let mut system = request.system_prompt.clone();
    if let Some(directive) = request.output_directive {
        if directive != OutputDirective::Json {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(directive.system_instruction());
        }
    }
    if !system.is_empty() {
        out.push(ChatMessage {
            role: Role::System,
            content: Some(ChatContent::Text(system)),
            tool_call_id: None,
            tool_calls: None,
        });
    }

    for msg in &request.history {
        out.push(to_chat_message(msg));
    }
    out
}

fn to_chat_message(msg: &Message) -> ChatMessage {
    match msg.sender {
        Sender::User => ChatMessage {
            role: Role::User,
            content: Some(user_content(msg)),
            tool_call_id: None,
            tool_calls: None,
        },
        Sender::Agent => {
            let tool_calls = msg.tool_calls.as_ref().filter(|c| !c.is_empty()).map(|calls| {
                calls
                    .iter()
                    .map(|c| ToolCallResponse {
                        id: c.id.clone(),
                        r#type: "function".to_string(),
                        function: FunctionCallResponse {
                            name: c.name.clone(),
                            arguments: c.arguments.to_string(),
                        },
                    })
                    .collect()
            });
            ChatMessage {
                role: Role::Assistant,
                content: (!msg.text.is_empty()).then(|| ChatContent::Text(msg.text.clone())),
                tool_call_id: None,
                tool_calls,
            }
        }
        Sender::ToolResult => {
            let (id, content) = match &msg.tool_result {
                Some(payload) => (payload.tool_call_id.clone(), payload.result.to_string()),
                None => (String::new(), msg.text.clone()),
            };
            ChatMessage {
                role: Role::Tool,
                content: Some(ChatContent::Text(content)),
                tool_call_id: Some(id),
                tool_calls: None,
            }
        }
    }
}

fn user_content(msg: &Message) -> ChatContent {
    match &msg.attachment {
        Some(att) if att.is_image() => {
            let mut parts = Vec::with_capacity(2);
            if !msg.text.is_empty() {
                parts.push(ContentPart::Text {
                    text: msg.text.clone(),
                });
            }
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{}", att.mime_type, att.data),
                },
            });
            ChatContent::Parts(parts)
        }
        Some(att) => {
            let label = att.name.as_deref().unwrap_or("file");
            ChatContent::Text(format!("{}\n\n[attachment: {label} ({})]", msg.text, att.mime_type))
        }
        None => ChatContent::Text(msg.text.clone()),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
