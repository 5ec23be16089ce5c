use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Append-only per-generation token accounting, aggregatable for billing.
/// Costs are integer micro-USD to avoid floating error.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "token_usage")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub generation_id: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub prompt_text_tokens: i32,
    pub prompt_audio_tokens: i32,
    pub prompt_image_tokens: i32,
    pub prompt_cached_tokens: i32,
    pub prompt_total_tokens: i32,
    pub completion_reasoning_tokens: i32,
    pub completion_audio_tokens: i32,
    pub completion_text_tokens: i32,
    pub completion_accepted_prediction_tokens: i32,
    pub completion_rejected_prediction_tokens: i32,
    pub completion_total_tokens: i32,
    pub total_tokens: i32,
    pub prompt_cost_micro_usd: i64,
    pub completion_cost_micro_usd: i64,
    pub total_cost_micro_usd: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
