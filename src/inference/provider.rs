//! The backend contract.
//!
//! Every model-serving backend implements [`Provider`]. The base surface is
//! `stream` + `complete`; the extensions have default implementations that
//! return [`DispatchError::UnsupportedCapability`], so a backend only
//! overrides what it actually serves.

use async_trait::async_trait;

use super::errors::DispatchError;
use super::types::{
    Capability, Credentials, DispatchRequest, GeneratedImage, ImageRequest, IncrementStream,
    VideoOperation, VideoRequest,
};

/// Build the error a backend returns for an extension it lacks.
pub fn unsupported(provider_id: &str, capability: Capability) -> DispatchError {
    DispatchError::UnsupportedCapability {
        provider_id: provider_id.to_string(),
        capability: capability.to_string(),
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Routing-table key.
    fn id(&self) -> &str;

    /// Capabilities this backend serves.
    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Whether calls without an API key must be refused before any network I/O.
    fn requires_credentials(&self) -> bool {
        true
    }

    /// Start a streaming chat call.
    ///
    /// An `Err` here means the call never started; mid-stream failures are
    /// reported as a terminal `Increment::Error` inside the stream.
    async fn stream(
        &self,
        credentials: &Credentials,
        request: DispatchRequest,
    ) -> Result<IncrementStream, DispatchError>;

    /// Non-streaming chat call returning the final text.
    async fn complete(
        &self,
        credentials: &Credentials,
        request: DispatchRequest,
    ) -> Result<String, DispatchError>;

    async fn stream_with_grounding(
        &self,
        _credentials: &Credentials,
        _request: DispatchRequest,
    ) -> Result<IncrementStream, DispatchError> {
        Err(unsupported(self.id(), Capability::Grounding))
    }

    async fn generate_image(
        &self,
        _credentials: &Credentials,
        _request: ImageRequest,
    ) -> Result<Vec<GeneratedImage>, DispatchError> {
        Err(unsupported(self.id(), Capability::ImageGeneration))
    }

    async fn generate_video(
        &self,
        _credentials: &Credentials,
        _request: VideoRequest,
    ) -> Result<VideoOperation, DispatchError> {
        Err(unsupported(self.id(), Capability::VideoGeneration))
    }

    async fn poll_video_operation(
        &self,
        _credentials: &Credentials,
        _operation_id: &str,
    ) -> Result<VideoOperation, DispatchError> {
        Err(unsupported(self.id(), Capability::VideoGeneration))
    }
}
