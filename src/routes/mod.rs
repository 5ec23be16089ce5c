pub mod admin;
pub mod chat;
pub mod health;
pub mod models;

pub use admin::create_admin_routes;
pub use chat::create_chat_routes;
pub use health::create_health_routes;
pub use models::create_model_routes;

use crate::Server;
use axum::Router;

/// The OpenAI-compatible surface mounted under `/v1`.
pub fn create_openai_routes() -> Router<Server> {
    Router::new()
        .merge(create_chat_routes())
        .merge(create_model_routes())
}
