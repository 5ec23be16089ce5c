use crate::error::AppError;
use crate::metrics;
use crate::openai::transform;
use crate::openai::{ChatCompletionRequest, validate_chat_request};
use crate::server::Server;
use axum::{
    Json, Router,
    body::Body,
    extract::{State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

pub fn create_chat_routes() -> Router<Server> {
    Router::new().route("/chat/completions", post(chat_completions))
}

/// Handle POST /v1/chat/completions.
///
/// The coordinator runs in a spawned task watching a cancellation channel
/// whose sender lives in this handler: when the caller disconnects, axum
/// drops this future, the sender goes with it, and the coordinator abandons
/// the in-flight attempt.
pub async fn chat_completions(
    State(server): State<Server>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let Json(request) = match payload {
        Ok(json) => json,
        Err(rejection) => {
            metrics::record_error("validation_error", "/v1/chat/completions");
            return AppError::Validation(format!("invalid request body: {}", rejection))
                .into_response_with_id(&request_id);
        }
    };

    if let Err(e) = validate_chat_request(&request) {
        metrics::record_error("validation_error", "/v1/chat/completions");
        return e.into_response_with_id(&request_id);
    }

    info!(
        request_id = %request_id,
        model = %request.model,
        stream = request.stream,
        messages = request.messages.len(),
        "Chat completion request"
    );

    let stream = request.stream;
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = {
        let service = server.chat_service.clone();
        let request_id = request_id.clone();
        tokio::spawn(async move { service.handle(&request_id, &request, cancel_rx).await })
    };

    let result = match task.await {
        Ok(result) => result,
        Err(e) => Err(AppError::Internal(format!("request task failed: {}", e))),
    };
    drop(cancel_tx);

    match result {
        Ok(completed) => {
            if stream {
                let frames = transform::stream_frames(
                    &request_id,
                    &completed.model,
                    &completed.content,
                    &completed.finish_reason,
                );
                let mut response =
                    (StatusCode::OK, Body::from(frames.concat())).into_response();
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/event-stream"),
                );
                headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
                if let Ok(value) = HeaderValue::from_str(&request_id) {
                    headers.insert("x-request-id", value);
                }
                response
            } else {
                let body = transform::completion_response(
                    &request_id,
                    &completed.model,
                    &completed.content,
                    completed.reasoning_content.as_deref(),
                    &completed.finish_reason,
                    &completed.usage,
                );
                let mut response = (StatusCode::OK, Json(body)).into_response();
                if let Ok(value) = HeaderValue::from_str(&request_id) {
                    response.headers_mut().insert("x-request-id", value);
                }
                response
            }
        }
        Err(e) => e.into_response_with_id(&request_id),
    }
}
