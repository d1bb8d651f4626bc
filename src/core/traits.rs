//! DI "Interfaces"

use crate::core::conversation::ChatMessage;
use crate::core::error::Result;
use crate::infrastructure::engine_host::EngineStatus;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

/// UI updates produced while a reply is generated.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// An empty assistant bubble was added.
    Placeholder,
    /// The full reply text so far.
    Reply(String),
    Ready,
    Error(String),
}

/// Updates produced while a model is loaded.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    Progress(String),
    Loaded { model: String, text: String },
    Failed(String),
}

#[async_trait]
pub trait ChatService: Send + Sync {
    /// Sends a user message in the given session and starts generating the reply.
    ///
    /// Returns `Ok(None)` when there is nothing to do: the text is blank or no engine is loaded.
    /// Returns `Err` if the session already has a reply in flight or the temperature is invalid.
    async fn send_message(
        &self,
        session_id: Uuid,
        text: String,
        temperature: Option<f32>,
    ) -> Result<Option<mpsc::UnboundedReceiver<ChatEvent>>>;

    /// Lists the committed turns of a session.
    ///
    /// Returns `Err` while a reply is being generated.
    async fn history(&self, session_id: Uuid) -> Result<Vec<ChatMessage>>;

    /// Forgets a session and its conversation.
    async fn end_session(&self, session_id: Uuid) -> bool;
}

#[async_trait]
pub trait ModelService: Send + Sync {
    async fn status(&self) -> EngineStatus;

    /// Lists the models that can be loaded, and the one loaded by default.
    async fn list_models(&self) -> (Vec<String>, String);

    /// Starts loading `model` (or the default model).
    ///
    /// Returns `Err` if GPU compute is unavailable or a load is already running; in that case no
    /// initialization is attempted.
    async fn load_model(&self, model: Option<String>) -> Result<mpsc::UnboundedReceiver<LoadEvent>>;
}
