//! Transforms between the OpenAI surface and the upstream conversation API.

use crate::grok::UpstreamUsage;
use crate::openai::{
    ChatCompletionChunk, ChatCompletionResponse, ChatMessage, Choice, ChunkChoice, ChunkDelta,
    ContentPart, MessageContent, ModelInfo, ModelList, ResponseMessage, Usage,
};
use chrono::Utc;

/// Aliases accepted on the inbound surface.
pub fn map_model(model: &str) -> String {
    match model {
        "grok-latest" => "grok-3".to_string(),
        other => other.to_string(),
    }
}

/// Flatten the OpenAI message sequence into the single conversation prompt
/// the upstream accepts. Roles are kept as transcript prefixes so multi-turn
/// context survives; image parts are referenced by URL.
pub fn canonical_prompt(messages: &[ChatMessage]) -> String {
    let mut lines = Vec::with_capacity(messages.len());
    for message in messages {
        let text = match &message.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => text.clone(),
                    ContentPart::ImageUrl { image_url } => format!("[image: {}]", image_url.url),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        };
        if messages.len() == 1 && message.role == "user" {
            return text;
        }
        lines.push(format!("{}: {}", message.role, text));
    }
    lines.join("\n")
}

pub fn completion_response(
    request_id: &str,
    model: &str,
    content: &str,
    reasoning_content: Option<&str>,
    finish_reason: &str,
    usage: &UpstreamUsage,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: format!("chatcmpl-{}", request_id),
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: content.to_string(),
                reasoning_content: reasoning_content.map(str::to_string),
            },
            finish_reason: finish_reason.to_string(),
        }],
        usage: Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        },
    }
}

fn frame(chunk: &ChatCompletionChunk) -> String {
    format!(
        "data: {}\n\n",
        serde_json::to_string(chunk).unwrap_or_default()
    )
}

/// Replay a buffered completion as `chat.completion.chunk` SSE events: one
/// content delta, one finish delta, then the `[DONE]` sentinel.
pub fn stream_frames(request_id: &str, model: &str, content: &str, finish_reason: &str) -> Vec<String> {
    let id = format!("chatcmpl-{}", request_id);
    let created = Utc::now().timestamp();

    let content_chunk = ChatCompletionChunk {
        id: id.clone(),
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: Some("assistant".to_string()),
                content: Some(content.to_string()),
            },
            finish_reason: None,
        }],
    };

    let finish_chunk = ChatCompletionChunk {
        id,
        object: "chat.completion.chunk".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            finish_reason: Some(finish_reason.to_string()),
        }],
    };

    vec![
        frame(&content_chunk),
        frame(&finish_chunk),
        "data: [DONE]\n\n".to_string(),
    ]
}

pub fn available_models() -> ModelList {
    let created = Utc::now().timestamp();
    let model = |id: &str| ModelInfo {
        id: id.to_string(),
        object: "model".to_string(),
        created,
        owned_by: "xai".to_string(),
    };
    ModelList {
        object: "list".to_string(),
        data: vec![model("grok-latest"), model("grok-3"), model("grok-2")],
    }
}
