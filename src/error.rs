use crate::database::DatabaseError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Application error taxonomy, mapped onto HTTP responses with the
/// `{error: {type, message, request_id}}` body shape.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    AuthenticationRequired(String),
    #[error("no healthy sessions available")]
    NoHealthySessions,
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("upstream request timed out")]
    UpstreamTimeout,
    #[error("upstream rejected the request: {message}")]
    UpstreamRejected { status: u16, message: String },
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable error type for the response body.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Config(_) => "internal_error",
            AppError::Database(DatabaseError::NotFound) => "not_found",
            AppError::Database(DatabaseError::Duplicate(_)) => "duplicate_session",
            AppError::Database(DatabaseError::InvalidTransition { .. }) => "invalid_transition",
            AppError::Database(DatabaseError::Unavailable(_)) => "persistence_unavailable",
            AppError::Database(_) => "internal_error",
            AppError::Validation(_) => "validation_error",
            AppError::AuthenticationRequired(_) => "authentication_required",
            AppError::NoHealthySessions => "no_healthy_sessions",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::UpstreamTimeout => "upstream_timeout",
            AppError::UpstreamRejected { .. } => "upstream_rejected",
            AppError::PersistenceUnavailable(_) => "persistence_unavailable",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Database(DatabaseError::NotFound) => StatusCode::NOT_FOUND,
            AppError::Database(DatabaseError::Duplicate(_)) => StatusCode::CONFLICT,
            AppError::Database(DatabaseError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            AppError::Database(DatabaseError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::AuthenticationRequired(_) => StatusCode::UNAUTHORIZED,
            AppError::NoHealthySessions => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::UpstreamRejected { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::PersistenceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Response body carrying the request id of the failed request.
    pub fn body(&self, request_id: &str) -> serde_json::Value {
        json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        })
    }

    /// Build a full HTTP response tied to a known request id.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        (self.status_code(), Json(self.body(request_id))).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        self.into_response_with_id(&request_id)
    }
}
