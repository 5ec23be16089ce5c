use serde_json::{Value, json};

/// Default conversation payload sent to the upstream chat endpoint. Field
/// set mirrors what the Grok web client sends; only `modelName`, `message`
/// and `isReasoning` vary per request.
pub fn default_chat_payload() -> Value {
    json!({
        "temporary": false,
        "modelName": "grok-3",
        "message": "",
        "fileAttachments": [],
        "imageAttachments": [],
        "disableSearch": false,
        "enableImageGeneration": true,
        "returnImageBytes": false,
        "returnRawGrokInXaiRequest": false,
        "enableImageStreaming": true,
        "imageGenerationCount": 2,
        "forceConcise": false,
        "toolOverrides": {
            "imageGen": true,
            "webSearch": false,
            "xSearch": false,
            "xMediaSearch": false,
            "trendsSearch": false,
            "xPostAnalyze": false,
        },
        "enableSideBySide": true,
        "isPreset": false,
        "sendFinalMetadata": true,
        "customInstructions": "",
        "deepsearchPreset": "",
        "isReasoning": false,
    })
}

pub fn build_chat_payload(model: &str, message: &str, is_reasoning: bool) -> Value {
    let mut payload = default_chat_payload();
    payload["modelName"] = json!(model);
    payload["message"] = json!(message);
    payload["isReasoning"] = json!(is_reasoning);
    payload
}

/// Detailed token counts extracted from the final upstream metadata.
/// Everything defaults to 0 when the upstream does not report it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpstreamUsage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
    pub reasoning_tokens: i32,
    pub audio_tokens: i32,
    pub image_tokens: i32,
    pub cached_tokens: i32,
    pub accepted_prediction_tokens: i32,
    pub rejected_prediction_tokens: i32,
    pub num_sources_used: i32,
}

impl UpstreamUsage {
    fn from_json(usage: &Value) -> Self {
        let field = |key: &str| usage.get(key).and_then(Value::as_i64).unwrap_or(0) as i32;
        let mut parsed = Self {
            prompt_tokens: field("promptTokens"),
            completion_tokens: field("completionTokens"),
            total_tokens: field("totalTokens"),
            reasoning_tokens: field("reasoningTokens"),
            audio_tokens: field("audioTokens"),
            image_tokens: field("imageTokens"),
            cached_tokens: field("cachedTokens"),
            accepted_prediction_tokens: field("acceptedPredictionTokens"),
            rejected_prediction_tokens: field("rejectedPredictionTokens"),
            num_sources_used: field("numSourcesUsed"),
        };
        if parsed.total_tokens == 0 {
            parsed.total_tokens = parsed.prompt_tokens + parsed.completion_tokens;
        }
        parsed
    }
}

/// Normalized result of one completed upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub text: String,
    pub reasoning_content: Option<String>,
    pub finish_reason: String,
    pub usage: UpstreamUsage,
    pub raw: Option<Value>,
    pub response_id: Option<String>,
}

/// Incremental parser for the upstream's newline-delimited JSON stream.
///
/// Chunks are split on line boundaries as they arrive; only the current
/// partial line is buffered, so memory stays proportional to one event plus
/// the accumulated answer text.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    partial: String,
    text: String,
    reasoning: String,
    model_response: Option<Value>,
    error: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one network chunk. Returns the upstream error message if an
    /// error event was observed, at which point the caller should stop
    /// reading the stream.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Option<String> {
        self.partial.push_str(&String::from_utf8_lossy(chunk));

        while let Some(newline) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=newline).collect();
            self.process_line(line.trim());
            if self.error.is_some() {
                return self.error.clone();
            }
        }
        None
    }

    fn process_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }
        let event: Value = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(_) => {
                tracing::debug!("Skipping non-JSON upstream chunk: {:.100}", line);
                return;
            }
        };

        if let Some(error) = event.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown upstream error")
                .to_string();
            self.error = Some(message);
            return;
        }

        let response = &event["result"]["response"];

        if let Some(token) = response.get("token").and_then(Value::as_str) {
            self.text.push_str(token);
        }
        if let Some(thinking) = response.get("thinkingTrace").and_then(Value::as_str) {
            self.reasoning.push_str(thinking);
        }

        // Generated images arrive as asset paths; surface them inline as
        // markdown the way the web client renders them.
        let images = response
            .get("generatedImageUrls")
            .or_else(|| response["modelResponse"].get("generatedImageUrls"))
            .and_then(Value::as_array);
        if let Some(images) = images {
            for image in images.iter().filter_map(Value::as_str) {
                self.text
                    .push_str(&format!("\n\n![Generated Image](https://assets.grok.com/{})\n", image));
            }
        }

        if response.get("modelResponse").is_some() {
            self.model_response = Some(response["modelResponse"].clone());
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Finalize the stream into a normalized reply. A trailing line without
    /// a newline terminator is processed here.
    pub fn finish(mut self) -> UpstreamReply {
        let remainder = std::mem::take(&mut self.partial);
        self.process_line(remainder.trim());

        let mut text = self.text;
        let mut response_id = None;
        let mut usage = UpstreamUsage::default();

        if let Some(ref model_response) = self.model_response {
            if text.is_empty() {
                if let Some(message) = model_response.get("message").and_then(Value::as_str) {
                    text = message.to_string();
                }
            }
            response_id = model_response
                .get("responseId")
                .and_then(Value::as_str)
                .map(str::to_string);
            if let Some(raw_usage) = model_response.get("usage") {
                usage = UpstreamUsage::from_json(raw_usage);
            }
        }

        UpstreamReply {
            text,
            reasoning_content: if self.reasoning.is_empty() {
                None
            } else {
                Some(self.reasoning)
            },
            finish_reason: "stop".to_string(),
            usage,
            raw: self.model_response,
            response_id,
        }
    }
}
