//! HTTP API
//!

use crate::core::error::ChatError;
use crate::infrastructure::settings::Settings;
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use di::ServiceProvider;
use di_axum::RouterServiceProviderExtensions;
use log::warn;
use serde::Serialize;
use std::str::FromStr;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use uuid::Uuid;

pub mod chat;
pub mod engine;

const X_SESSION_ID: &str = "X-Session-ID";

/// The chat session of the calling page, from the `X-Session-ID` header.
#[derive(Debug)]
pub struct ExtractSession(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for ExtractSession
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, (StatusCode, &'static str)> {
        if let Some(session_id) = parts.headers.get(X_SESSION_ID) {
            let session_id = session_id
                .to_str()
                .map_err(|_| (StatusCode::BAD_REQUEST, "invalid session id"))?;
            let session_id = Uuid::from_str(session_id)
                .map_err(|_| (StatusCode::BAD_REQUEST, "invalid session id"))?;
            Ok(ExtractSession(session_id))
        } else {
            Err((StatusCode::BAD_REQUEST, "`X-Session-ID` header is missing"))
        }
    }
}

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub error: String,
}

pub fn error_response(err: ChatError) -> Response {
    let status = match &err {
        ChatError::CapabilityMissing(_) | ChatError::Busy(_) => StatusCode::CONFLICT,
        ChatError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        ChatError::InitFailure(_) | ChatError::StreamFailure(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// Builds the whole application on top of the given service provider.
pub fn app(provider: ServiceProvider) -> Router {
    let settings = provider.get_required::<Settings>();
    let origins: Vec<HeaderValue> = settings
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(origin) => Some(origin),
            Err(_) => {
                warn!("Ignoring invalid CORS origin `{origin}`");
                None
            }
        })
        .collect();

    Router::new()
        .route("/", get(index))
        .nest_service(
            "/static",
            ServiceBuilder::new().service(ServeDir::new("static")),
        )
        .merge(engine::router())
        .nest("/chat", chat::router())
        .layer(
            CorsLayer::new()
                .allow_headers(Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_origin(AllowOrigin::list(origins)),
        )
        .with_provider(provider)
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../../static/index.html"))
}
