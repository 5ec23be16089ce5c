use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Terminal record of one inbound chat request.
///
/// Exactly one row per inbound request regardless of attempt count; the
/// per-attempt detail lives in telemetry events. Token fields default to 0
/// when the upstream did not report them.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "generations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub request_id: String,
    pub session_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub prompt_tokens: i32,
    #[sea_orm(column_type = "Text", nullable)]
    pub response_text: Option<String>,
    pub response_tokens: i32,
    pub response_raw: Option<Json>,
    pub status: i32,
    pub latency_ms: i32,
    pub error_message: Option<String>,
    pub reasoning_tokens: i32,
    pub audio_tokens: i32,
    pub image_tokens: i32,
    pub cached_tokens: i32,
    pub accepted_prediction_tokens: i32,
    pub rejected_prediction_tokens: i32,
    pub num_sources_used: i32,
    pub response_id: Option<String>,
    pub previous_response_id: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_output_tokens: Option<i32>,
    pub parallel_tool_calls: bool,
    pub tool_choice: Option<String>,
    pub finish_reason: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub reasoning_content: Option<String>,
    pub incomplete_details: Option<String>,
    pub annotations: Option<Json>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
