//! Model loading endpoints

use crate::api::engine::schemas::{EngineState, LoadModel, ModelList};
use crate::api::error_response;
use crate::core::traits::{LoadEvent, ModelService};
use async_stream::stream;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use di_axum::Inject;

pub fn router() -> Router {
    Router::new()
        .route("/engine", get(engine_status))
        .route("/engine/load", post(load_model))
        .route("/models", get(list_models))
}

async fn engine_status(Inject(model_service): Inject<dyn ModelService>) -> Json<EngineState> {
    Json(model_service.status().await.into())
}

async fn list_models(Inject(model_service): Inject<dyn ModelService>) -> Json<ModelList> {
    let (models, default_model) = model_service.list_models().await;

    Json(ModelList {
        models,
        default_model,
    })
}

async fn load_model(
    Inject(model_service): Inject<dyn ModelService>,
    body: Option<Json<LoadModel>>,
) -> Response {
    let model = body.and_then(|Json(body)| body.model);

    match model_service.load_model(model).await {
        Ok(mut events) => {
            let stream = stream! {
                while let Some(event) = events.recv().await {
                    yield sse_event(event);
                }
            };

            Sse::new(stream)
                .keep_alive(KeepAlive::default())
                .into_response()
        }
        Err(err) => error_response(err),
    }
}

fn sse_event(event: LoadEvent) -> Result<Event, axum::Error> {
    match event {
        LoadEvent::Progress(text) => Event::default()
            .event("progress")
            .json_data(schemas::LoadText { model: None, text }),
        LoadEvent::Loaded { model, text } => Event::default().event("loaded").json_data(
            schemas::LoadText {
                model: Some(model),
                text,
            },
        ),
        LoadEvent::Failed(text) => Event::default()
            .event("failed")
            .json_data(schemas::LoadText { model: None, text }),
    }
}

pub mod schemas {
    use crate::core::error::ChatError;
    use crate::infrastructure::engine_host::EngineStatus;
    use serde::{Deserialize, Serialize};

    #[derive(Deserialize, Debug, Default)]
    pub struct LoadModel {
        #[serde(default)]
        pub model: Option<String>,
    }

    #[derive(Serialize, Debug)]
    pub struct LoadText {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub model: Option<String>,
        pub text: String,
    }

    #[derive(Serialize, Debug)]
    pub struct ModelList {
        pub models: Vec<String>,
        pub default_model: String,
    }

    #[derive(Serialize, Debug)]
    pub struct EngineState {
        pub state: &'static str,
        pub model: Option<String>,
        pub message: String,
    }

    impl From<EngineStatus> for EngineState {
        fn from(status: EngineStatus) -> Self {
            let (state, model, message) = match status {
                EngineStatus::Unprobed => ("unprobed", None, "Checking GPU support...".to_owned()),
                EngineStatus::Unsupported { reason } => (
                    "unsupported",
                    None,
                    ChatError::CapabilityMissing(reason).to_string(),
                ),
                EngineStatus::Idle { .. } => (
                    "idle",
                    None,
                    "GPU available. Select a model and click Load.".to_owned(),
                ),
                EngineStatus::Loading { model } => {
                    let message = format!("Loading {model}...");
                    ("loading", Some(model), message)
                }
                EngineStatus::Ready { model } => {
                    let message = format!("{model} loaded successfully!");
                    ("ready", Some(model), message)
                }
                EngineStatus::Failed { model, message } => (
                    "failed",
                    Some(model),
                    format!("Failed to load model: {message}"),
                ),
            };

            EngineState {
                state,
                model,
                message,
            }
        }
    }
}
