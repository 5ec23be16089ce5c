//! Admin surface: session CRUD and pool statistics, thin wrappers over the
//! session pool operations.

use crate::database::SessionFilter;
use crate::database::entities::sessions::{self, SessionStatus};
use crate::error::AppError;
use crate::pool::PoolStats;
use crate::server::Server;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub fn create_admin_routes() -> Router<Server> {
    Router::new()
        .route("/sessions", get(list_sessions).post(create_session))
        .route("/sessions/{id}/quarantine", patch(quarantine_session))
        .route("/sessions/{id}/revoke", patch(revoke_session))
        .route("/sessions/{id}/activate", patch(activate_session))
        .route("/stats", get(get_stats))
}

/// Session view without cookie material; the hash is truncated to a hint.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub id: String,
    pub cookie_hash: String,
    pub provider: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub failure_rate: f64,
}

impl From<&sessions::Model> for SessionResponse {
    fn from(session: &sessions::Model) -> Self {
        Self {
            id: session.id.clone(),
            cookie_hash: format!("{:.16}...", session.cookie_hash),
            provider: session.provider.clone(),
            status: session.status,
            created_at: session.created_at,
            last_used_at: session.last_used_at,
            expires_at: session.expires_at,
            usage_count: session.usage_count,
            success_count: session.success_count,
            failure_count: session.failure_count,
            failure_rate: session.failure_rate(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub total: usize,
    pub sessions: Vec<SessionResponse>,
}

#[derive(Debug, Deserialize)]
pub struct ListSessionsQuery {
    pub status: Option<SessionStatus>,
    pub provider: Option<String>,
}

pub async fn list_sessions(
    State(server): State<Server>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<SessionListResponse>, AppError> {
    let filter = SessionFilter {
        status: query.status,
        provider: query.provider,
    };
    let sessions = server.session_pool.list_sessions(&filter).await?;
    let responses: Vec<SessionResponse> = sessions.iter().map(SessionResponse::from).collect();
    Ok(Json(SessionListResponse {
        total: responses.len(),
        sessions: responses,
    }))
}

fn default_provider() -> String {
    "grok".to_string()
}

fn default_metadata() -> serde_json::Value {
    serde_json::json!({})
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub cookie_text: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

pub async fn create_session(
    State(server): State<Server>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Response, AppError> {
    if request.cookie_text.trim().is_empty() {
        return Err(AppError::Validation(
            "cookie_text cannot be empty".to_string(),
        ));
    }

    let session = server
        .session_pool
        .create_session(
            request.cookie_text.trim(),
            &request.provider,
            request.expires_at,
            request.metadata,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "session_id": session.id,
            "message": "Session created successfully",
        })),
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct ReasonQuery {
    pub reason: Option<String>,
}

pub async fn quarantine_session(
    State(server): State<Server>,
    Path(id): Path<String>,
    Query(query): Query<ReasonQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let reason = query.reason.as_deref().unwrap_or("manual quarantine");
    server.session_pool.quarantine(&id, reason).await?;
    Ok(Json(serde_json::json!({
        "session_id": id,
        "message": format!("Session quarantined: {}", reason),
    })))
}

pub async fn revoke_session(
    State(server): State<Server>,
    Path(id): Path<String>,
    Query(query): Query<ReasonQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let reason = query.reason.as_deref().unwrap_or("manual revocation");
    server.session_pool.revoke(&id, reason).await?;
    Ok(Json(serde_json::json!({
        "session_id": id,
        "message": "Session revoked",
    })))
}

/// Re-promote a quarantined session. The only path back to healthy.
pub async fn activate_session(
    State(server): State<Server>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    server.session_pool.activate(&id).await?;
    Ok(Json(serde_json::json!({
        "session_id": id,
        "message": "Session activated",
    })))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub pool: PoolStats,
    pub circuit_state: &'static str,
}

pub async fn get_stats(State(server): State<Server>) -> Json<StatsResponse> {
    let pool = server.session_pool.stats().await;
    let circuit_state = server.chat_service.circuit_state().as_str();
    Json(StatsResponse {
        pool,
        circuit_state,
    })
}
