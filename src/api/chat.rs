//! Chat endpoints

use crate::api::chat::schemas::{CreateMessage, MessagesList};
use crate::api::{ExtractSession, error_response};
use crate::core::traits::{ChatEvent, ChatService};
use async_stream::stream;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use di_axum::Inject;

pub fn router() -> Router {
    Router::new()
        .route("/", post(post_message))
        .route("/history", get(history))
        .route("/session", delete(end_session))
}

async fn post_message(
    Inject(chat_service): Inject<dyn ChatService>,
    ExtractSession(session_id): ExtractSession,
    Json(message): Json<CreateMessage>,
) -> Response {
    match chat_service
        .send_message(session_id, message.text, message.temperature)
        .await
    {
        Ok(Some(mut events)) => {
            let stream = stream! {
                while let Some(event) = events.recv().await {
                    yield sse_event(event);
                }
            };

            Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(err),
    }
}

async fn history(
    Inject(chat_service): Inject<dyn ChatService>,
    ExtractSession(session_id): ExtractSession,
) -> Response {
    match chat_service.history(session_id).await {
        Ok(messages) => Json(MessagesList { messages }).into_response(),
        Err(err) => error_response(err),
    }
}

async fn end_session(
    Inject(chat_service): Inject<dyn ChatService>,
    ExtractSession(session_id): ExtractSession,
) -> StatusCode {
    chat_service.end_session(session_id).await;
    StatusCode::NO_CONTENT
}

fn sse_event(event: ChatEvent) -> Result<Event, axum::Error> {
    let (name, text) = match event {
        ChatEvent::Placeholder => ("assistant_placeholder", String::new()),
        ChatEvent::Reply(text) => ("reply", text),
        ChatEvent::Ready => ("ready", "Ready".to_owned()),
        ChatEvent::Error(message) => ("error", format!("Error: {message}")),
    };

    Event::default()
        .event(name)
        .json_data(schemas::MessageText { text })
}

pub mod schemas {
    use crate::core::conversation::ChatMessage;
    use serde::{Deserialize, Serialize};

    #[derive(Deserialize, Debug)]
    pub struct CreateMessage {
        pub text: String,
        #[serde(default)]
        pub temperature: Option<f32>,
    }

    #[derive(Serialize, Debug, Default)]
    pub struct MessagesList {
        pub messages: Vec<ChatMessage>,
    }

    #[derive(Serialize, Debug)]
    pub struct MessageText {
        pub text: String,
    }
}
