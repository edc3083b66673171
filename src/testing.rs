//! In-crate test doubles.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::Notify;

use crate::inference::errors::DispatchError;
use crate::inference::provider::Provider;
use crate::inference::types::{Capability, Credentials, DispatchRequest, Increment, IncrementStream};

/// A backend that replays queued scripts and records every request.
pub(crate) struct ScriptedProvider {
    id: String,
    capabilities: Vec<Capability>,
    requires_credentials: bool,
    streams: Mutex<VecDeque<Vec<Increment>>>,
    completions: Mutex<VecDeque<Result<String, DispatchError>>>,
    stream_requests: Mutex<Vec<DispatchRequest>>,
    complete_requests: Mutex<Vec<DispatchRequest>>,
    gate: Option<Arc<Notify>>,
    crash_on_stream: bool,
}

impl ScriptedProvider {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            capabilities: vec![Capability::Conversation, Capability::ToolUse],
            requires_credentials: false,
            streams: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            stream_requests: Mutex::new(Vec::new()),
            complete_requests: Mutex::new(Vec::new()),
            gate: None,
            crash_on_stream: false,
        }
    }

    pub(crate) fn requiring_credentials(mut self) -> Self {
        self.requires_credentials = true;
        self
    }

    pub(crate) fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Every `stream` call waits for one `notify_one` on the gate after
    /// recording its request.
    pub(crate) fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// `stream` panics after recording its request.
    pub(crate) fn crashing(mut self) -> Self {
        self.crash_on_stream = true;
        self
    }

    pub(crate) fn push_stream(&self, increments: Vec<Increment>) {
        self.streams.lock().unwrap().push_back(increments);
    }

    pub(crate) fn push_completion(&self, result: Result<String, DispatchError>) {
        self.completions.lock().unwrap().push_back(result);
    }

    pub(crate) fn stream_requests(&self) -> Vec<DispatchRequest> {
        self.stream_requests.lock().unwrap().clone()
    }

    pub(crate) fn complete_requests(&self) -> Vec<DispatchRequest> {
        self.complete_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    fn requires_credentials(&self) -> bool {
        self.requires_credentials
    }

    async fn stream(
        &self,
        _credentials: &Credentials,
        request: DispatchRequest,
    ) -> Result<IncrementStream, DispatchError> {
        self.stream_requests.lock().unwrap().push(request);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.crash_on_stream {
            panic!("scripted backend crashed");
        }
        let script = self.streams.lock().unwrap().pop_front();
        match script {
            Some(increments) => Ok(Box::pin(stream::iter(increments))),
            None => Err(DispatchError::Transport {
                provider_id: self.id.clone(),
                reason: "no scripted stream left".into(),
            }),
        }
    }

    async fn stream_with_grounding(
        &self,
        credentials: &Credentials,
        request: DispatchRequest,
    ) -> Result<IncrementStream, DispatchError> {
        self.stream(credentials, request).await
    }

    async fn complete(
        &self,
        _credentials: &Credentials,
        request: DispatchRequest,
    ) -> Result<String, DispatchError> {
        self.complete_requests.lock().unwrap().push(request);
        let next = self.completions.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            Err(DispatchError::Transport {
                provider_id: self.id.clone(),
                reason: "no scripted completion left".into(),
            })
        })
    }
}
