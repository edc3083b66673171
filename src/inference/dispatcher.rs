//! Provider dispatcher — the single call surface above all backends.
//!
//! Selection is a pure id lookup in the routing table. The dispatcher owns
//! three guarantees callers rely on:
//! - credentials are checked before any backend is touched,
//! - streaming calls never fail outside the stream (every failure becomes one
//!   terminal `Increment::Error`),
//! - every stream ends with exactly one terminal increment and yields nothing
//!   after it.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};

use super::errors::DispatchError;
use super::provider::{unsupported, Provider};
use super::types::{
    Capability, Credentials, DispatchRequest, GeneratedImage, ImageRequest, Increment,
    IncrementStream, VideoOperation, VideoRequest,
};

/// Routing table from provider id to backend.
#[derive(Default, Clone)]
pub struct ProviderDispatcher {
    routes: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own id, replacing any previous entry.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let id = provider.id().to_string();
        tracing::debug!(
            provider = %id,
            capabilities = ?provider.capabilities(),
            "registered provider"
        );
        self.routes.insert(id, provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    pub fn has_provider(&self, provider_id: &str) -> bool {
        self.routes.contains_key(provider_id)
    }

    /// Registered ids, sorted.
    pub fn provider_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Check a capability before calling. Unknown providers support nothing.
    pub fn supports(&self, provider_id: &str, capability: Capability) -> bool {
        self.routes
            .get(provider_id)
            .is_some_and(|p| p.supports(capability))
    }

    // ─── Streaming ───────────────────────────────────────────────────────

    pub async fn stream(
        &self,
        provider_id: &str,
        credentials: &Credentials,
        request: DispatchRequest,
    ) -> IncrementStream {
        self.open_stream(provider_id, credentials, request, false)
            .await
    }

    /// Streaming call with search grounding. Backends without it yield a
    /// single `UnsupportedCapability` error increment.
    pub async fn stream_with_grounding(
        &self,
        provider_id: &str,
        credentials: &Credentials,
        request: DispatchRequest,
    ) -> IncrementStream {
        self.open_stream(provider_id, credentials, request, true)
            .await
    }

    async fn open_stream(
        &self,
        provider_id: &str,
        credentials: &Credentials,
        request: DispatchRequest,
        grounded: bool,
    ) -> IncrementStream {
        let provider = match self.prepare(provider_id, credentials) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(provider = %provider_id, error = %e, "dispatch rejected");
                return error_stream(e);
            }
        };

        tracing::info!(
            provider = %provider_id,
            model = %request.model,
            message_count = request.history.len(),
            tool_count = request.tools.as_ref().map(|t| t.len()).unwrap_or(0),
            grounded,
            "dispatching stream"
        );

        let opened = if grounded {
            if !provider.supports(Capability::Grounding) {
                Err(unsupported(provider_id, Capability::Grounding))
            } else {
                provider.stream_with_grounding(credentials, request).await
            }
        } else {
            provider.stream(credentials, request).await
        };

        match opened {
            Ok(inner) => seal(inner),
            Err(e) => {
                tracing::warn!(provider = %provider_id, error = %e, "stream failed to open");
                error_stream(e)
            }
        }
    }

    // ─── Non-streaming ───────────────────────────────────────────────────

    pub async fn complete(
        &self,
        provider_id: &str,
        credentials: &Credentials,
        request: DispatchRequest,
    ) -> Result<String, DispatchError> {
        let provider = self.prepare(provider_id, credentials)?;
        tracing::info!(
            provider = %provider_id,
            model = %request.model,
            message_count = request.history.len(),
            "dispatching completion"
        );
        provider.complete(credentials, request).await
    }

    pub async fn generate_image(
        &self,
        provider_id: &str,
        credentials: &Credentials,
        request: ImageRequest,
    ) -> Result<Vec<GeneratedImage>, DispatchError> {
        let provider = self.prepare_for(provider_id, credentials, Capability::ImageGeneration)?;
        provider.generate_image(credentials, request).await
    }

    pub async fn generate_video(
        &self,
        provider_id: &str,
        credentials: &Credentials,
        request: VideoRequest,
    ) -> Result<VideoOperation, DispatchError> {
        let provider = self.prepare_for(provider_id, credentials, Capability::VideoGeneration)?;
        provider.generate_video(credentials, request).await
    }

    pub async fn poll_video_operation(
        &self,
        provider_id: &str,
        credentials: &Credentials,
        operation_id: &str,
    ) -> Result<VideoOperation, DispatchError> {
        let provider = self.prepare_for(provider_id, credentials, Capability::VideoGeneration)?;
        provider
            .poll_video_operation(credentials, operation_id)
            .await
    }

    // ─── Helpers ─────────────────────────────────────────────────────────

    /// Resolve the backend and check credentials, without any network I/O.
    fn prepare(
        &self,
        provider_id: &str,
        credentials: &Credentials,
    ) -> Result<&Arc<dyn Provider>, DispatchError> {
        let provider =
            self.routes
                .get(provider_id)
                .ok_or_else(|| DispatchError::UnknownProvider {
                    provider_id: provider_id.to_string(),
                })?;

        if provider.requires_credentials() && credentials.key().is_none() {
            return Err(DispatchError::Authentication {
                provider_id: provider_id.to_string(),
                reason: "no API key configured".into(),
            });
        }

        Ok(provider)
    }

    fn prepare_for(
        &self,
        provider_id: &str,
        credentials: &Credentials,
        capability: Capability,
    ) -> Result<&Arc<dyn Provider>, DispatchError> {
        let provider = self.prepare(provider_id, credentials)?;
        if !provider.supports(capability) {
            return Err(unsupported(provider_id, capability));
        }
        Ok(provider)
    }
}

/// A stream consisting of a single terminal error.
pub fn error_stream(error: DispatchError) -> IncrementStream {
    Box::pin(stream::iter(vec![Increment::Error(error)]))
}

/// Cut the stream after its first terminal increment, and append `Done` if
/// the backend ends without one.
fn seal(inner: IncrementStream) -> IncrementStream {
    Box::pin(stream::unfold(
        (inner, false),
        |(mut inner, finished)| async move {
            if finished {
                return None;
            }
            match inner.next().await {
                Some(increment) => {
                    let terminal = increment.is_terminal();
                    Some((increment, (inner, terminal)))
                }
                None => Some((Increment::Done, (inner, true))),
            }
        },
    ))
}
