//! The inference engine seam.
//!
//! The conversation loop only ever talks to an [`Engine`]. How an engine comes to exist (probing
//! the GPU, reading weights, reporting progress) is the job of an [`EngineBackend`].

use crate::core::conversation::ChatMessage;
use crate::core::error::Result;
use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;

/// One element of a streamed completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    pub delta: Option<String>,
}

impl Chunk {
    pub fn text(fragment: impl Into<String>) -> Self {
        Self {
            delta: Some(fragment.into()),
        }
    }

    pub fn empty() -> Self {
        Self { delta: None }
    }

    /// The fragment this chunk contributes, if any.
    pub fn fragment(&self) -> Option<&str> {
        self.delta.as_deref().filter(|delta| !delta.is_empty())
    }
}

/// Ordered, lazily produced completion chunks. An `Err` item is terminal.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatOptions {
    pub temperature: f32,
    pub stream: bool,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            stream: true,
        }
    }
}

/// What the compute probe found.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterInfo {
    pub description: String,
}

/// Receives human-readable progress while an engine is being initialized.
pub trait ProgressHandler: Send + Sync {
    fn on_progress(&self, text: &str);
}

/// Discards every report.
pub struct NoProgress;

impl ProgressHandler for NoProgress {
    fn on_progress(&self, _text: &str) {}
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Identifier of the loaded model.
    fn model_id(&self) -> &str;

    /// Starts a streaming chat completion over `messages`.
    ///
    /// Returns `Err` if the request could not be started at all; failures during generation are
    /// delivered as an `Err` item on the stream instead.
    async fn stream_chat(&self, messages: Vec<ChatMessage>, options: ChatOptions)
    -> Result<ChunkStream>;
}

#[async_trait]
pub trait EngineBackend: Send + Sync {
    /// Checks that the host exposes GPU compute and at least one adapter.
    ///
    /// Returns `ChatError::CapabilityMissing` otherwise.
    async fn probe(&self) -> Result<AdapterInfo>;

    /// Lists the model identifiers this backend could load.
    async fn available_models(&self) -> Vec<String>;

    /// Builds an engine for `model_id`, reporting progress along the way.
    ///
    /// `progress` is never called after this returns.
    async fn initialize(
        &self,
        model_id: &str,
        progress: &dyn ProgressHandler,
    ) -> Result<Arc<dyn Engine>>;
}
