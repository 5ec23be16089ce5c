use crate::openai::ModelList;
use crate::openai::transform::available_models;
use crate::server::Server;
use axum::{Json, Router, routing::get};

pub fn create_model_routes() -> Router<Server> {
    Router::new().route("/models", get(list_models))
}

/// Handle GET /v1/models
pub async fn list_models() -> Json<ModelList> {
    Json(available_models())
}
