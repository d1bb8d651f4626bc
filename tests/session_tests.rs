//! Session header handling on the chat routes

use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, StatusCode},
};
use local_llm_chat::api;
use tower::ServiceExt;
use uuid::Uuid;

fn create_app() -> Router {
    let provider = local_llm_chat::services().build_provider().unwrap();
    api::app(provider)
}

fn session_request(method: Method, uri: &str, session_id: HeaderValue) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    request.headers_mut().insert("X-Session-ID", session_id);
    request
}

async fn status_of(app: &Router, request: Request<Body>) -> StatusCode {
    app.clone().oneshot(request).await.unwrap().status()
}

#[tokio::test]
async fn test_malformed_session_id_is_rejected_on_every_session_route() {
    let app = create_app();

    for (method, uri) in [
        (Method::GET, "/chat/history"),
        (Method::DELETE, "/chat/session"),
    ] {
        for session_id in [
            HeaderValue::from_static("not-a-uuid"),
            HeaderValue::from_static(""),
            HeaderValue::from_bytes(&[0xFF, 0xFE]).unwrap(),
        ] {
            let request = session_request(method.clone(), uri, session_id);
            assert_eq!(
                status_of(&app, request).await,
                StatusCode::BAD_REQUEST,
                "{method} {uri}"
            );
        }
    }
}

#[tokio::test]
async fn test_history_of_unknown_session_is_empty() {
    let app = create_app();
    let session_id = HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap();

    let response = app
        .oneshot(session_request(Method::GET, "/chat/history", session_id))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["messages"], serde_json::json!([]));
}

#[tokio::test]
async fn test_ending_unknown_session_succeeds() {
    let app = create_app();
    let session_id = HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap();

    let request = session_request(Method::DELETE, "/chat/session", session_id);

    assert_eq!(status_of(&app, request).await, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_ending_session_twice_is_harmless() {
    let app = create_app();
    let session_id = HeaderValue::from_str(&Uuid::new_v4().to_string()).unwrap();

    for _ in 0..2 {
        let request = session_request(Method::DELETE, "/chat/session", session_id.clone());
        assert_eq!(status_of(&app, request).await, StatusCode::NO_CONTENT);
    }
}
