//! Implementations for the service the app needs.
//!

use crate::core::conversation::{
    ChatMessage, ChatView, ConversationLoop, ReplyStatus, normalize_prompt,
};
use crate::core::engine::ProgressHandler;
use crate::core::error::{ChatError, Result};
use crate::core::traits::{ChatEvent, ChatService, LoadEvent, ModelService};
use crate::infrastructure::engine_host::{EngineHost, EngineStatus};
use crate::infrastructure::settings::{Settings, validate_temperature};
use crate::infrastructure::traits::SessionRepository;
use async_trait::async_trait;
use di::{Ref, injectable};
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Forwards view updates to whoever is listening on the other end of the channel.
///
/// A closed channel means the page went away; the reply is still generated and committed.
pub struct ChannelView {
    events: mpsc::UnboundedSender<ChatEvent>,
}

impl ChannelView {
    pub fn new(events: mpsc::UnboundedSender<ChatEvent>) -> Self {
        Self { events }
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }
}

impl ChatView for ChannelView {
    fn append_placeholder(&mut self) {
        self.emit(ChatEvent::Placeholder);
    }

    fn update_reply(&mut self, text: &str) {
        self.emit(ChatEvent::Reply(text.to_owned()));
    }

    fn set_status(&mut self, status: ReplyStatus) {
        self.emit(match status {
            ReplyStatus::Ready => ChatEvent::Ready,
            ReplyStatus::Error(message) => ChatEvent::Error(message),
        });
    }
}

pub struct ChannelProgress {
    events: mpsc::UnboundedSender<LoadEvent>,
}

impl ProgressHandler for ChannelProgress {
    fn on_progress(&self, text: &str) {
        let _ = self.events.send(LoadEvent::Progress(text.to_owned()));
    }
}

#[injectable(ChatService)]
pub struct MyChatService {
    engine: Ref<EngineHost>,
    sessions: Ref<dyn SessionRepository>,
    settings: Ref<Settings>,
}

#[async_trait]
impl ChatService for MyChatService {
    async fn send_message(
        &self,
        session_id: Uuid,
        text: String,
        temperature: Option<f32>,
    ) -> Result<Option<mpsc::UnboundedReceiver<ChatEvent>>> {
        let Some(text) = normalize_prompt(&text).map(str::to_owned) else {
            return Ok(None);
        };
        let Some(engine) = self.engine.engine().await else {
            debug!("Ignoring message for session {session_id}: no model is loaded");
            return Ok(None);
        };
        let temperature = validate_temperature(temperature.unwrap_or(self.settings.temperature))
            .map_err(ChatError::InvalidRequest)?;

        let session = self.sessions.open(session_id).await;
        let mut conversation = session
            .conversation
            .clone()
            .try_lock_owned()
            .map_err(|_| ChatError::Busy("a reply is already being generated".to_owned()))?;

        let chat_loop = ConversationLoop::new(self.settings.system_prompt.clone())
            .with_temperature(temperature)
            .with_policy(self.settings.failed_reply_policy);
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut view = ChannelView::new(sender);
            chat_loop
                .send(&mut conversation, Some(engine.as_ref()), &text, &mut view)
                .await;
            // Unlock before the event stream closes.
            drop(conversation);
        });

        Ok(Some(receiver))
    }

    async fn history(&self, session_id: Uuid) -> Result<Vec<ChatMessage>> {
        let Some(session) = self.sessions.find(session_id).await else {
            return Ok(Vec::new());
        };

        let conversation = session
            .conversation
            .try_lock()
            .map_err(|_| ChatError::Busy("a reply is being generated".to_owned()))?;
        Ok(conversation.turns().to_vec())
    }

    async fn end_session(&self, session_id: Uuid) -> bool {
        self.sessions.remove(session_id).await
    }
}

#[injectable(ModelService)]
pub struct MyModelService {
    engine: Ref<EngineHost>,
    settings: Ref<Settings>,
}

#[async_trait]
impl ModelService for MyModelService {
    async fn status(&self) -> EngineStatus {
        self.engine.status().await
    }

    async fn list_models(&self) -> (Vec<String>, String) {
        (
            self.engine.available_models().await,
            self.settings.default_model.clone(),
        )
    }

    async fn load_model(&self, model: Option<String>) -> Result<mpsc::UnboundedReceiver<LoadEvent>> {
        let model = model
            .map(|model| model.trim().to_owned())
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| self.settings.default_model.clone());

        self.engine.reserve(&model).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let engine = self.engine.clone();

        tokio::spawn(async move {
            let progress = ChannelProgress {
                events: sender.clone(),
            };
            let event = match engine.complete(&model, &progress).await {
                Ok(_) => LoadEvent::Loaded {
                    text: format!("{model} loaded successfully!"),
                    model,
                },
                Err(err) => LoadEvent::Failed(format!("Failed to load model: {err}")),
            };
            let _ = sender.send(event);
        });

        Ok(receiver)
    }
}
