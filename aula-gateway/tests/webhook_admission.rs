#![allow(clippy::unwrap_used)]

mod common;

use aula_gateway::zoom::webhook;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt as _;
use tower::ServiceExt as _;

async fn post_webhook(
    state: aula_gateway::AppState,
    body: &str,
    headers: &[(&str, String)],
) -> (StatusCode, serde_json::Value) {
    let router = aula_gateway::api::make_router::<()>(state);

    let mut request = Request::builder().method("POST").uri("/webhook");
    for (name, value) in headers {
        request = request.header(*name, value);
    }

    let response = router
        .oneshot(request.body(Body::from(body.to_owned())).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap();

    (status, value)
}

fn signed_headers(body: &str, timestamp: &str) -> Vec<(&'static str, String)> {
    vec![
        ("x-timestamp", timestamp.to_owned()),
        (
            "x-signature",
            webhook::compute_signature(common::WEBHOOK_SECRET, timestamp, body.as_bytes()),
        ),
    ]
}

#[tokio::test]
async fn url_validation_handshake_echoes_the_hmac_token() {
    let harness = common::harness().await;

    let body = r#"{"event": "endpoint.url_validation", "payload": {"plainToken": "abc"}}"#;
    let (status, response) = post_webhook(harness.state.clone(), body, &[]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["plainToken"], "abc");
    assert_eq!(
        response["encryptedToken"],
        webhook::encrypt_token(common::WEBHOOK_SECRET, "abc").as_str()
    );
}

#[tokio::test]
async fn invalid_signature_is_reported_in_the_body_with_http_200() {
    let harness = common::harness().await;

    let body = r#"{"event": "recording.completed", "payload": {}}"#;
    let headers = vec![
        ("x-timestamp", "1724000000".to_owned()),
        ("x-signature", "v0=0000000000000000000000000000000000000000000000000000000000000000".to_owned()),
    ];

    let (status, response) = post_webhook(harness.state.clone(), body, &headers).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "invalid-signature");
}

#[tokio::test]
async fn missing_signature_headers_are_rejected() {
    let harness = common::harness().await;

    let body = r#"{"event": "recording.completed", "payload": {}}"#;
    let (status, response) = post_webhook(harness.state.clone(), body, &[]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "invalid-signature");
}

#[tokio::test]
async fn unknown_events_are_ignored_successfully() {
    let harness = common::harness().await;

    let body = r#"{"event": "meeting.started", "payload": {}}"#;
    let headers = signed_headers(body, "1724000000");

    let (status, response) = post_webhook(harness.state.clone(), body, &headers).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "ignored");
}

#[tokio::test]
async fn garbage_bodies_never_produce_an_error_status() {
    let harness = common::harness().await;

    let (status, response) = post_webhook(harness.state.clone(), "not json at all", &[]).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "ignored");
}

#[tokio::test]
async fn recording_completed_without_mp4_is_ignored_with_a_reason() {
    let harness = common::harness().await;

    // Valid signature, recognized event, but only a transcript file inside.
    let body = r#"{
        "event": "recording.completed",
        "payload": {"object": {"id": "94881330838", "topic": "Matemáticas Básicas", "recording_files": [
            {"id": "t1", "file_type": "TRANSCRIPT", "status": "completed"}
        ]}}
    }"#;
    let headers = signed_headers(body, "1724000000");

    let (status, response) = post_webhook(harness.state.clone(), body, &headers).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "ignored");
    assert_eq!(response["reason"], "no-drive-url-found");
}
