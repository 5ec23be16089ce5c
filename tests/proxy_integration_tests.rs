//! End-to-end proxy behavior against a scripted mock upstream.

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use grok_proxy::database::SessionFilter;
use grok_proxy::database::entities::sessions::SessionStatus;
use grok_proxy::grok::{Outcome, UpstreamUsage};
use grok_proxy::test_utils::{
    MockAttempt, MockGrokUpstream, TestServerBuilder, create_test_session,
};
use std::sync::Arc;
use tower::ServiceExt;

fn chat_request_body(stream: bool) -> String {
    serde_json::json!({
        "model": "grok-3",
        "messages": [{"role": "user", "content": "hello"}],
        "stream": stream,
    })
    .to_string()
}

fn chat_request(stream: bool) -> Request<Body> {
    Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("Authorization", "Bearer test-key")
        .header("Content-Type", "application/json")
        .body(Body::from(chat_request_body(stream)))
        .unwrap()
}

async fn response_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_happy_path_returns_content_and_usage() {
    let upstream = Arc::new(MockGrokUpstream::always(MockAttempt::success(
        "hi",
        UpstreamUsage {
            prompt_tokens: 5,
            completion_tokens: 2,
            total_tokens: 7,
            ..UpstreamUsage::default()
        },
    )));
    let server = TestServerBuilder::new()
        .with_upstream(upstream.clone())
        .build()
        .await;
    create_test_session(&server, "sso=s1").await;
    create_test_session(&server, "sso=s2").await;

    let response = server.create_app().oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body = response_json(response).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "hi");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["prompt_tokens"], 5);
    assert_eq!(body["usage"]["completion_tokens"], 2);
    assert_eq!(body["usage"]["total_tokens"], 7);

    // Exactly one attempt, against exactly one of the two sessions
    assert_eq!(upstream.call_count(), 1);
    let sessions = server
        .session_pool
        .list_sessions(&SessionFilter::default())
        .await
        .unwrap();
    let used: Vec<_> = sessions.iter().filter(|s| s.usage_count > 0).collect();
    assert_eq!(used.len(), 1);
    assert_eq!(used[0].usage_count, 1);
    assert_eq!(used[0].success_count, 1);
    assert_eq!(used[0].failure_count, 0);

    // One generation row with the upstream status
    let generation = server
        .database
        .generations()
        .get_by_request_id(body["id"].as_str().unwrap().trim_start_matches("chatcmpl-"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(generation.status, 200);
    assert_eq!(generation.response_text.as_deref(), Some("hi"));
    assert!(generation.latency_ms >= 0);

    // Token usage row for the successful generation
    let usage = server
        .database
        .token_usage()
        .get_by_generation_id(&generation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(usage.total_tokens, 7);
    assert_eq!(usage.prompt_total_tokens, 5);
    assert_eq!(usage.completion_total_tokens, 2);
}

#[tokio::test]
async fn test_rotation_on_rate_limit() {
    let upstream = Arc::new(MockGrokUpstream::scripted(vec![
        MockAttempt::failure(Outcome::RateLimit, Some(429)),
        MockAttempt::success("ok", UpstreamUsage::default()),
    ]));
    let server = TestServerBuilder::new()
        .with_upstream(upstream.clone())
        .build()
        .await;
    create_test_session(&server, "sso=s1").await;
    create_test_session(&server, "sso=s2").await;

    let response = server.create_app().oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "ok");

    // Two attempts on two different sessions
    assert_eq!(upstream.call_count(), 2);
    let used = upstream.sessions_used();
    assert_ne!(used[0], used[1]);

    let rate_limited = server
        .session_pool
        .get_session(&used[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rate_limited.failure_count, 1);
    assert_eq!(rate_limited.status, SessionStatus::Healthy);

    let succeeded = server
        .session_pool
        .get_session(&used[1])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(succeeded.success_count, 1);
}

#[tokio::test]
async fn test_repeated_auth_failures_quarantine_sole_session() {
    let upstream = Arc::new(MockGrokUpstream::scripted(vec![
        MockAttempt::failure(Outcome::AuthFailure, Some(401)),
        MockAttempt::failure(Outcome::AuthFailure, Some(401)),
        MockAttempt::failure(Outcome::AuthFailure, Some(401)),
    ]));
    let server = TestServerBuilder::new()
        .with_upstream(upstream.clone())
        .build()
        .await;
    let session = create_test_session(&server, "sso=only").await;

    // Three inbound requests, each re-selecting the sole candidate once
    for _ in 0..3 {
        let response = server.create_app().oneshot(chat_request(false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
    assert_eq!(upstream.call_count(), 3);

    let stored = server
        .session_pool
        .get_session(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SessionStatus::Quarantined);

    // Fourth request finds no healthy session and never reaches upstream
    let response = server.create_app().oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "no_healthy_sessions");
    assert_eq!(upstream.call_count(), 3);
}

#[tokio::test]
async fn test_circuit_opens_after_consecutive_exhaustions() {
    let mut config = TestServerBuilder::test_config();
    config.resilience.max_attempts = 1;
    config.resilience.circuit_failure_threshold = 5;
    let upstream = Arc::new(MockGrokUpstream::always(MockAttempt::failure(
        Outcome::Upstream5xx,
        Some(503),
    )));
    let server = TestServerBuilder::new()
        .with_config(config)
        .with_upstream(upstream.clone())
        .build()
        .await;
    create_test_session(&server, "sso=s1").await;

    for _ in 0..5 {
        let response = server.create_app().oneshot(chat_request(false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
    assert_eq!(upstream.call_count(), 5);

    // Sixth request short-circuits without acquiring a session
    let response = server.create_app().oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "service_unavailable");
    assert_eq!(upstream.call_count(), 5);

    let session = server
        .session_pool
        .list_sessions(&SessionFilter::default())
        .await
        .unwrap()
        .remove(0);
    assert_eq!(session.usage_count, 5);
}

#[tokio::test]
async fn test_graceful_retirement_at_rotation_threshold() {
    let upstream = Arc::new(MockGrokUpstream::always(MockAttempt::success(
        "fine",
        UpstreamUsage::default(),
    )));
    let server = TestServerBuilder::new()
        .with_upstream(upstream.clone())
        .build()
        .await;
    let session = create_test_session(&server, "sso=worn").await;

    // Age the session to one request shy of retirement
    for _ in 0..499 {
        server
            .database
            .sessions()
            .increment_usage(&session.id, true)
            .await
            .unwrap();
    }
    server.session_pool.reload().await.unwrap();

    // The 500th use still succeeds
    let response = server.create_app().oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = server
        .session_pool
        .get_session(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.usage_count, 500);

    // The next classifier pass retires it
    server.session_pool.run_health_check().await.unwrap();
    let stored = server
        .session_pool
        .get_session(&session.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SessionStatus::Expired);

    let response = server.create_app().oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(upstream.call_count(), 1);
}

#[tokio::test]
async fn test_streaming_response_replays_buffered_completion() {
    let upstream = Arc::new(MockGrokUpstream::always(MockAttempt::success(
        "streamed answer",
        UpstreamUsage::default(),
    )));
    let server = TestServerBuilder::new()
        .with_upstream(upstream)
        .build()
        .await;
    create_test_session(&server, "sso=s1").await;

    let response = server.create_app().oneshot(chat_request(true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    let mut data_lines = text
        .split("\n\n")
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| chunk.trim_start_matches("data: "));

    let first: serde_json::Value = serde_json::from_str(data_lines.next().unwrap()).unwrap();
    assert_eq!(first["object"], "chat.completion.chunk");
    assert_eq!(first["choices"][0]["delta"]["content"], "streamed answer");

    let second: serde_json::Value = serde_json::from_str(data_lines.next().unwrap()).unwrap();
    assert_eq!(second["choices"][0]["finish_reason"], "stop");

    assert_eq!(data_lines.next().unwrap(), "[DONE]");
}

#[tokio::test]
async fn test_client_error_surfaces_without_retry() {
    let upstream = Arc::new(MockGrokUpstream::always(
        MockAttempt::failure(Outcome::ClientError, Some(422)).with_snippet("unsupported payload"),
    ));
    let server = TestServerBuilder::new()
        .with_upstream(upstream.clone())
        .build()
        .await;
    create_test_session(&server, "sso=s1").await;
    create_test_session(&server, "sso=s2").await;

    let response = server.create_app().oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "upstream_rejected");
    assert_eq!(upstream.call_count(), 1);
}

#[tokio::test]
async fn test_validation_error_shape() {
    let server = TestServerBuilder::new().build().await;

    let request = Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("Authorization", "Bearer test-key")
        .header("Content-Type", "application/json")
        .body(Body::from(
            serde_json::json!({"model": "grok-3", "messages": []}).to_string(),
        ))
        .unwrap();

    let response = server.create_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "validation_error");
    assert!(body["error"]["request_id"].is_string());
}

#[tokio::test]
async fn test_invalid_json_is_rejected() {
    let server = TestServerBuilder::new().build().await;

    let request = Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("Authorization", "Bearer test-key")
        .header("Content-Type", "application/json")
        .body(Body::from("not json"))
        .unwrap();

    let response = server.create_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_invalid_api_key_rejected() {
    let server = TestServerBuilder::new().build().await;

    let request = Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("Authorization", "Bearer wrong-key")
        .header("Content-Type", "application/json")
        .body(Body::from(chat_request_body(false)))
        .unwrap();

    let response = server.create_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "authentication_required");
}

#[tokio::test]
async fn test_models_endpoint() {
    let server = TestServerBuilder::new().build().await;

    let request = Request::builder()
        .uri("/v1/models")
        .header("Authorization", "Bearer test-key")
        .body(Body::empty())
        .unwrap();

    let response = server.create_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"grok-3"));
}

#[tokio::test]
async fn test_health_reports_components() {
    let server = TestServerBuilder::new().build().await;
    create_test_session(&server, "sso=s1").await;

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = server.create_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["service"], "grok-proxy");
    assert!(body["checks"]["database"].is_object());
    assert!(body["checks"]["session_pool"].is_object());
    assert_eq!(body["checks"]["session_pool"]["details"]["healthy"], 1);
}

#[tokio::test]
async fn test_health_unhealthy_when_pool_has_no_healthy_sessions() {
    let server = TestServerBuilder::new().build().await;
    let session = create_test_session(&server, "sso=s1").await;
    server.session_pool.quarantine(&session.id, "test").await.unwrap();

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = server.create_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = response_json(response).await;
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_empty_pool_is_degraded_not_unhealthy() {
    let server = TestServerBuilder::new().build().await;

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = server.create_app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response_json(response).await;
    assert_eq!(body["status"], "degraded");
}

#[tokio::test]
async fn test_exhausted_request_persists_single_generation_row() {
    let mut config = TestServerBuilder::test_config();
    config.resilience.max_attempts = 3;
    let upstream = Arc::new(MockGrokUpstream::always(MockAttempt::failure(
        Outcome::Upstream5xx,
        Some(502),
    )));
    let server = TestServerBuilder::new()
        .with_config(config)
        .with_upstream(upstream.clone())
        .build()
        .await;
    create_test_session(&server, "sso=a").await;
    create_test_session(&server, "sso=b").await;
    create_test_session(&server, "sso=c").await;

    let response = server.create_app().oneshot(chat_request(false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(upstream.call_count(), 3);

    let body = response_json(response).await;
    let request_id = body["error"]["request_id"].as_str().unwrap();

    // One terminal row for the whole request, not one per attempt
    let generation = server
        .database
        .generations()
        .get_by_request_id(request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(generation.status, 502);
    assert!(generation
        .error_message
        .as_deref()
        .unwrap()
        .contains("exhausted 3 attempts"));
}
