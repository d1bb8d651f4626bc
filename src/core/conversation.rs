//! Conversation history and the streaming send loop.
//!

use crate::core::engine::{ChatOptions, Engine};
use crate::core::error::ChatError;
use futures_util::StreamExt;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single turn of the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Committed turns, in the order they are sent to the model.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ChatMessage] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// The full request context: the system turn followed by every committed turn.
    pub fn request_messages(&self, system_prompt: &str) -> Vec<ChatMessage> {
        std::iter::once(ChatMessage::system(system_prompt))
            .chain(self.turns.iter().cloned())
            .collect()
    }

    fn push(&mut self, message: ChatMessage) {
        self.turns.push(message);
    }

    fn pop_trailing_user_turn(&mut self) -> Option<ChatMessage> {
        match self.turns.last() {
            Some(last) if last.role == Role::User => self.turns.pop(),
            _ => None,
        }
    }
}

/// What happens to the user's turn when the reply to it fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailedReplyPolicy {
    /// The user turn stays committed and is part of the next request's context.
    #[default]
    KeepUserTurn,
    /// The user turn is removed again, leaving the conversation as it was before the send.
    RollBackUserTurn,
}

impl FromStr for FailedReplyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "keep" => Ok(FailedReplyPolicy::KeepUserTurn),
            "rollback" => Ok(FailedReplyPolicy::RollBackUserTurn),
            other => Err(format!("unknown failed reply policy `{other}`")),
        }
    }
}

impl Display for FailedReplyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailedReplyPolicy::KeepUserTurn => write!(f, "keep"),
            FailedReplyPolicy::RollBackUserTurn => write!(f, "rollback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    Ready,
    Error(String),
}

/// Where a send makes its reply visible.
pub trait ChatView: Send {
    /// Adds the empty assistant bubble the reply streams into.
    fn append_placeholder(&mut self);

    /// Replaces the text of the assistant bubble.
    fn update_reply(&mut self, text: &str);

    fn set_status(&mut self, status: ReplyStatus);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Nothing to send, or no engine to send it to. Nothing was changed.
    Ignored,
    Completed { reply: String },
    Failed { error: ChatError },
}

/// Returns the text to send, or `None` if the submission is blank.
pub fn normalize_prompt(text: &str) -> Option<&str> {
    let text = text.trim();
    (!text.is_empty()).then_some(text)
}

#[derive(Debug, Clone)]
pub struct ConversationLoop {
    system_prompt: String,
    options: ChatOptions,
    policy: FailedReplyPolicy,
}

impl ConversationLoop {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            options: ChatOptions::default(),
            policy: FailedReplyPolicy::default(),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = temperature;
        self
    }

    pub fn with_policy(mut self, policy: FailedReplyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sends `user_text` and streams the reply into `view`.
    ///
    /// On success both turns are committed to `conversation`. On failure no assistant turn is
    /// committed, the user turn is kept or rolled back according to the policy, and the reply
    /// text is replaced by the error.
    pub async fn send(
        &self,
        conversation: &mut Conversation,
        engine: Option<&dyn Engine>,
        user_text: &str,
        view: &mut dyn ChatView,
    ) -> SendOutcome {
        let (Some(engine), Some(text)) = (engine, normalize_prompt(user_text)) else {
            return SendOutcome::Ignored;
        };

        conversation.push(ChatMessage::user(text));
        let messages = conversation.request_messages(&self.system_prompt);
        debug!(
            "Sending {} messages to {} (temperature {})",
            messages.len(),
            engine.model_id(),
            self.options.temperature
        );

        view.append_placeholder();

        match self.stream_reply(engine, messages, view).await {
            Ok(reply) => {
                conversation.push(ChatMessage::assistant(reply.clone()));
                view.set_status(ReplyStatus::Ready);
                SendOutcome::Completed { reply }
            }
            Err(err) => {
                error!("Reply generation failed: {err:?}");
                if self.policy == FailedReplyPolicy::RollBackUserTurn {
                    conversation.pop_trailing_user_turn();
                }
                let message = err.to_string();
                view.update_reply(&format!("Error: {message}"));
                view.set_status(ReplyStatus::Error(message));
                SendOutcome::Failed { error: err }
            }
        }
    }

    async fn stream_reply(
        &self,
        engine: &dyn Engine,
        messages: Vec<ChatMessage>,
        view: &mut dyn ChatView,
    ) -> Result<String, ChatError> {
        let mut chunks = engine.stream_chat(messages, self.options).await?;
        let mut reply = String::new();

        while let Some(chunk) = chunks.next().await {
            if let Some(fragment) = chunk?.fragment() {
                reply.push_str(fragment);
                view.update_reply(&reply);
            }
        }

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::{Chunk, ChunkStream};
    use async_trait::async_trait;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

    enum Script {
        Reply(Vec<Option<&'static str>>),
        FailAfter(Vec<&'static str>, &'static str),
        Reject(&'static str),
    }

    struct ScriptedEngine {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<(Vec<ChatMessage>, ChatOptions)>>,
    }

    impl ScriptedEngine {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<(Vec<ChatMessage>, ChatOptions)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        fn model_id(&self) -> &str {
            "scripted"
        }

        async fn stream_chat(
            &self,
            messages: Vec<ChatMessage>,
            options: ChatOptions,
        ) -> Result<ChunkStream, ChatError> {
            self.requests.lock().unwrap().push((messages, options));
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .expect("no scripted reply left");

            let items: Vec<Result<Chunk, ChatError>> = match script {
                Script::Reply(deltas) => deltas
                    .into_iter()
                    .map(|delta| {
                        Ok(Chunk {
                            delta: delta.map(str::to_owned),
                        })
                    })
                    .collect(),
                Script::FailAfter(fragments, message) => fragments
                    .into_iter()
                    .map(|fragment| Ok(Chunk::text(fragment)))
                    .chain(std::iter::once(Err(ChatError::StreamFailure(
                        message.to_owned(),
                    ))))
                    .collect(),
                Script::Reject(message) => {
                    return Err(ChatError::StreamFailure(message.to_owned()));
                }
            };

            Ok(Box::pin(stream::iter(items)))
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum ViewEvent {
        Placeholder,
        Reply(String),
        Status(ReplyStatus),
    }

    #[derive(Default)]
    struct RecordingView {
        events: Vec<ViewEvent>,
    }

    impl RecordingView {
        fn replies(&self) -> Vec<String> {
            self.events
                .iter()
                .filter_map(|event| match event {
                    ViewEvent::Reply(text) => Some(text.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl ChatView for RecordingView {
        fn append_placeholder(&mut self) {
            self.events.push(ViewEvent::Placeholder);
        }

        fn update_reply(&mut self, text: &str) {
            self.events.push(ViewEvent::Reply(text.to_owned()));
        }

        fn set_status(&mut self, status: ReplyStatus) {
            self.events.push(ViewEvent::Status(status));
        }
    }

    #[tokio::test]
    async fn test_hello_scenario_commits_both_turns() {
        let engine = ScriptedEngine::new(vec![Script::Reply(vec![
            Some("Hi"),
            Some(" there"),
            Some("!"),
        ])]);
        let mut conversation = Conversation::new();
        let mut view = RecordingView::default();

        let outcome = ConversationLoop::new(SYSTEM_PROMPT)
            .send(&mut conversation, Some(&engine), "Hello", &mut view)
            .await;

        assert_eq!(
            outcome,
            SendOutcome::Completed {
                reply: "Hi there!".to_owned()
            }
        );
        assert_eq!(
            conversation.turns(),
            &[ChatMessage::user("Hello"), ChatMessage::assistant("Hi there!")]
        );
        assert_eq!(
            view.events,
            vec![
                ViewEvent::Placeholder,
                ViewEvent::Reply("Hi".to_owned()),
                ViewEvent::Reply("Hi there".to_owned()),
                ViewEvent::Reply("Hi there!".to_owned()),
                ViewEvent::Status(ReplyStatus::Ready),
            ]
        );
    }

    #[tokio::test]
    async fn test_each_request_carries_system_turn_and_full_history() {
        let engine = ScriptedEngine::new(vec![
            Script::Reply(vec![Some("one")]),
            Script::Reply(vec![Some("two")]),
            Script::Reply(vec![Some("three")]),
        ]);
        let chat_loop = ConversationLoop::new(SYSTEM_PROMPT);
        let mut conversation = Conversation::new();

        for prompt in ["a", "b", "c"] {
            let mut view = RecordingView::default();
            chat_loop
                .send(&mut conversation, Some(&engine), prompt, &mut view)
                .await;
        }

        assert_eq!(conversation.len(), 6);
        for (i, turn) in conversation.turns().iter().enumerate() {
            let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
            assert_eq!(turn.role, expected);
        }

        let requests = engine.requests();
        assert_eq!(requests.len(), 3);
        for (k, (messages, options)) in requests.iter().enumerate() {
            assert_eq!(messages.len(), 2 * k + 2);
            assert_eq!(messages[0], ChatMessage::system(SYSTEM_PROMPT));
            assert_eq!(&messages[1..=2 * k], &conversation.turns()[..2 * k]);
            assert_eq!(messages.last().unwrap().role, Role::User);
            assert!(options.stream);
            assert_eq!(options.temperature, 0.7);
        }
        assert_eq!(requests[2].0.last().unwrap().content, "c");
    }

    #[tokio::test]
    async fn test_blank_submission_is_ignored() {
        let engine = ScriptedEngine::new(vec![]);
        let chat_loop = ConversationLoop::new(SYSTEM_PROMPT);
        let mut conversation = Conversation::new();

        for text in ["", "   ", "\n\t "] {
            let mut view = RecordingView::default();
            let outcome = chat_loop
                .send(&mut conversation, Some(&engine), text, &mut view)
                .await;

            assert_eq!(outcome, SendOutcome::Ignored);
            assert!(view.events.is_empty());
        }

        assert!(conversation.is_empty());
        assert!(engine.requests().is_empty());
    }

    #[tokio::test]
    async fn test_send_without_engine_is_ignored() {
        let mut conversation = Conversation::new();
        let mut view = RecordingView::default();

        let outcome = ConversationLoop::new(SYSTEM_PROMPT)
            .send(&mut conversation, None, "Hello", &mut view)
            .await;

        assert_eq!(outcome, SendOutcome::Ignored);
        assert!(conversation.is_empty());
        assert!(view.events.is_empty());
    }

    #[tokio::test]
    async fn test_prompt_is_trimmed_before_commit() {
        let engine = ScriptedEngine::new(vec![Script::Reply(vec![Some("ok")])]);
        let mut conversation = Conversation::new();
        let mut view = RecordingView::default();

        ConversationLoop::new(SYSTEM_PROMPT)
            .send(&mut conversation, Some(&engine), "  Hello \n", &mut view)
            .await;

        assert_eq!(conversation.turns()[0], ChatMessage::user("Hello"));
    }

    #[tokio::test]
    async fn test_visible_text_grows_by_prefix_and_skips_empty_deltas() {
        let engine = ScriptedEngine::new(vec![Script::Reply(vec![
            None,
            Some("The"),
            Some(""),
            Some(" quick"),
            None,
            Some(" fox"),
        ])]);
        let mut conversation = Conversation::new();
        let mut view = RecordingView::default();

        ConversationLoop::new(SYSTEM_PROMPT)
            .send(&mut conversation, Some(&engine), "Go", &mut view)
            .await;

        assert_eq!(
            view.replies(),
            vec!["The", "The quick", "The quick fox"]
        );
        let replies = view.replies();
        for pair in replies.windows(2) {
            assert!(pair[1].starts_with(&pair[0]));
        }
    }

    #[tokio::test]
    async fn test_empty_stream_commits_empty_reply() {
        let engine = ScriptedEngine::new(vec![Script::Reply(vec![])]);
        let mut conversation = Conversation::new();
        let mut view = RecordingView::default();

        let outcome = ConversationLoop::new(SYSTEM_PROMPT)
            .send(&mut conversation, Some(&engine), "Hello", &mut view)
            .await;

        assert_eq!(
            outcome,
            SendOutcome::Completed {
                reply: String::new()
            }
        );
        assert_eq!(conversation.turns()[1], ChatMessage::assistant(""));
        assert_eq!(
            view.events,
            vec![
                ViewEvent::Placeholder,
                ViewEvent::Status(ReplyStatus::Ready)
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_stream_keeps_user_turn_and_shows_error() {
        let engine = ScriptedEngine::new(vec![Script::FailAfter(
            vec!["Partial", " answer"],
            "device lost",
        )]);
        let mut conversation = Conversation::new();
        let mut view = RecordingView::default();

        let outcome = ConversationLoop::new(SYSTEM_PROMPT)
            .send(&mut conversation, Some(&engine), "Hello", &mut view)
            .await;

        assert_eq!(
            outcome,
            SendOutcome::Failed {
                error: ChatError::StreamFailure("device lost".to_owned())
            }
        );
        assert_eq!(conversation.turns(), &[ChatMessage::user("Hello")]);
        assert_eq!(
            view.events.last(),
            Some(&ViewEvent::Status(ReplyStatus::Error(
                "device lost".to_owned()
            )))
        );
        assert_eq!(
            view.replies().last().map(String::as_str),
            Some("Error: device lost")
        );
    }

    #[tokio::test]
    async fn test_kept_user_turn_is_sent_again_as_context() {
        let engine = ScriptedEngine::new(vec![
            Script::Reject("worker stopped"),
            Script::Reply(vec![Some("Hi")]),
        ]);
        let chat_loop = ConversationLoop::new(SYSTEM_PROMPT);
        let mut conversation = Conversation::new();

        let mut view = RecordingView::default();
        chat_loop
            .send(&mut conversation, Some(&engine), "Hello", &mut view)
            .await;
        let mut view = RecordingView::default();
        chat_loop
            .send(&mut conversation, Some(&engine), "Hello?", &mut view)
            .await;

        let second = &engine.requests()[1].0;
        assert_eq!(
            second,
            &vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user("Hello"),
                ChatMessage::user("Hello?"),
            ]
        );
        assert_eq!(conversation.len(), 3);
    }

    #[tokio::test]
    async fn test_rollback_policy_restores_conversation() {
        let engine = ScriptedEngine::new(vec![
            Script::Reply(vec![Some("Hi")]),
            Script::FailAfter(vec!["x"], "out of memory"),
        ]);
        let chat_loop =
            ConversationLoop::new(SYSTEM_PROMPT).with_policy(FailedReplyPolicy::RollBackUserTurn);
        let mut conversation = Conversation::new();

        let mut view = RecordingView::default();
        chat_loop
            .send(&mut conversation, Some(&engine), "Hello", &mut view)
            .await;
        let mut view = RecordingView::default();
        let outcome = chat_loop
            .send(&mut conversation, Some(&engine), "Again", &mut view)
            .await;

        assert!(matches!(outcome, SendOutcome::Failed { .. }));
        assert_eq!(
            conversation.turns(),
            &[ChatMessage::user("Hello"), ChatMessage::assistant("Hi")]
        );
        assert_eq!(
            view.replies().last().map(String::as_str),
            Some("Error: out of memory")
        );
    }

    #[tokio::test]
    async fn test_temperature_is_forwarded() {
        let engine = ScriptedEngine::new(vec![Script::Reply(vec![Some("ok")])]);
        let mut conversation = Conversation::new();
        let mut view = RecordingView::default();

        ConversationLoop::new(SYSTEM_PROMPT)
            .with_temperature(1.3)
            .send(&mut conversation, Some(&engine), "Hello", &mut view)
            .await;

        assert_eq!(engine.requests()[0].1.temperature, 1.3);
    }

    #[test]
    fn test_failed_reply_policy_from_str() {
        assert_eq!(
            "keep".parse::<FailedReplyPolicy>(),
            Ok(FailedReplyPolicy::KeepUserTurn)
        );
        assert_eq!(
            " Rollback ".parse::<FailedReplyPolicy>(),
            Ok(FailedReplyPolicy::RollBackUserTurn)
        );
        assert!("drop".parse::<FailedReplyPolicy>().is_err());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::assistant("Hi")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"Hi"}"#);
    }
}
