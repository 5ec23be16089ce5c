//! Inbound OpenAI-compatible API types.

pub mod transform;

use crate::error::AppError;
use serde::{Deserialize, Serialize};

fn default_parallel_tool_calls() -> bool {
    true
}

/// OpenAI-compatible chat completion request; only the fields the proxy
/// consumes are modeled, everything else is rejected-by-ignore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default = "default_parallel_tool_calls")]
    pub parallel_tool_calls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

/// Message content: either a bare string or a sequence of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// `auto`, `none`, or an explicit tool selection object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(String),
    Named(serde_json::Value),
}

impl ToolChoice {
    /// Flat string form for persistence.
    pub fn as_persisted(&self) -> String {
        match self {
            ToolChoice::Mode(mode) => mode.clone(),
            ToolChoice::Named(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

const VALID_ROLES: &[&str] = &["system", "user", "assistant"];

/// Validate the parts of the request the proxy depends on. Anything else
/// passes through untouched.
pub fn validate_chat_request(request: &ChatCompletionRequest) -> Result<(), AppError> {
    if request.model.trim().is_empty() {
        return Err(AppError::Validation("model is required".to_string()));
    }
    if request.messages.is_empty() {
        return Err(AppError::Validation(
            "messages list cannot be empty".to_string(),
        ));
    }
    for message in &request.messages {
        if !VALID_ROLES.contains(&message.role.as_str()) {
            return Err(AppError::Validation(format!(
                "invalid message role: {}",
                message.role
            )));
        }
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(AppError::Validation(
                "temperature must be between 0 and 2".to_string(),
            ));
        }
    }
    if let Some(top_p) = request.top_p {
        if !(0.0..=1.0).contains(&top_p) {
            return Err(AppError::Validation(
                "top_p must be between 0 and 1".to_string(),
            ));
        }
    }
    if let Some(ToolChoice::Mode(mode)) = &request.tool_choice {
        if mode != "auto" && mode != "none" {
            return Err(AppError::Validation(format!(
                "invalid tool_choice: {}",
                mode
            )));
        }
    }
    Ok(())
}
