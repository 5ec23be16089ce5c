use crate::config::UpstreamConfig;
use crate::database::entities::sessions;
use crate::error::AppError;
use crate::grok::outcome::{Outcome, classify_status};
use crate::grok::wire::{StreamAccumulator, UpstreamReply, build_chat_payload};
use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use futures_util::StreamExt;
use rand::seq::IndexedRandom;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum number of error-body bytes retained for classification and
/// telemetry snippets.
const ERROR_BODY_LIMIT: usize = 2048;

/// One upstream conversation request.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub model: String,
    pub message: String,
    pub is_reasoning: bool,
}

/// Result of a single attempt against the upstream with one leased session.
#[derive(Debug)]
pub struct AttemptResult {
    pub outcome: Outcome,
    pub http_status: Option<u16>,
    pub reply: Option<UpstreamReply>,
    pub error_snippet: Option<String>,
    pub latency: Duration,
    pub timed_out: bool,
}

impl AttemptResult {
    fn failure(
        outcome: Outcome,
        http_status: Option<u16>,
        error_snippet: Option<String>,
        latency: Duration,
    ) -> Self {
        Self {
            outcome,
            http_status,
            reply: None,
            error_snippet,
            latency,
            timed_out: false,
        }
    }
}

/// Upstream trait for dependency injection and testing
#[async_trait]
pub trait GrokUpstream: Send + Sync {
    /// Perform one attempt for one inbound request using one leased session.
    async fn attempt(&self, session: &sessions::Model, request: &UpstreamRequest)
    -> AttemptResult;
}

/// HTTP client for the Grok conversation API.
pub struct GrokClient {
    http: reqwest::Client,
    config: UpstreamConfig,
}

impl GrokClient {
    pub fn new(config: UpstreamConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.attempt_timeout_seconds))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build upstream client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn pick_user_agent(&self) -> &str {
        self.config
            .user_agents
            .choose(&mut rand::rng())
            .map(String::as_str)
            .unwrap_or("Mozilla/5.0")
    }

    /// Browser-fingerprint header set required for anti-bot traversal, plus
    /// the session cookie. The user agent stays fixed within one attempt.
    fn headers(&self, session: &sessions::Model, user_agent: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let fixed: &[(&str, &str)] = &[
            ("accept", "*/*"),
            ("accept-language", "en-US,en;q=0.9,de-DE;q=0.8"),
            ("cache-control", "no-cache"),
            ("content-type", "application/json"),
            ("origin", "https://grok.com"),
            ("pragma", "no-cache"),
            ("priority", "u=1, i"),
            ("referer", "https://grok.com/c"),
            (
                "sec-ch-ua",
                "\"Chromium\";v=\"140\", \"Not=A?Brand\";v=\"24\", \"Google Chrome\";v=\"140\"",
            ),
            ("sec-ch-ua-mobile", "?0"),
            ("sec-ch-ua-platform", "\"Windows\""),
            ("sec-fetch-dest", "empty"),
            ("sec-fetch-mode", "cors"),
            ("sec-fetch-site", "same-origin"),
        ];
        for &(name, value) in fixed {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_static(value),
            );
        }
        if let Ok(value) = HeaderValue::from_str(user_agent) {
            headers.insert(HeaderName::from_static("user-agent"), value);
        }
        // Cookie material is attached verbatim, cf_clearance included
        if let Ok(value) = HeaderValue::from_str(&session.cookie_text) {
            headers.insert(HeaderName::from_static("cookie"), value);
        }
        if let Ok(value) = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string()) {
            headers.insert(HeaderName::from_static("x-xai-request-id"), value);
        }
        headers
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/rest/app-chat/conversations/new",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

/// Classify a reqwest transport failure. Timeouts and connection-level
/// failures rotate as transport errors; mid-stream body failures look like
/// an upstream reset.
fn classify_transport(error: &reqwest::Error) -> (Outcome, bool) {
    if error.is_timeout() {
        (Outcome::TransportError, true)
    } else if error.is_connect() || error.is_request() {
        (Outcome::TransportError, false)
    } else {
        (Outcome::Upstream5xx, false)
    }
}

/// Classify a first-chunk error payload delivered inside a 200 stream.
fn classify_error_event(message: &str) -> Outcome {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") {
        Outcome::RateLimit
    } else if crate::grok::outcome::has_anti_bot_signature(message) {
        Outcome::AntiBot
    } else {
        Outcome::Upstream5xx
    }
}

#[async_trait]
impl GrokUpstream for GrokClient {
    async fn attempt(
        &self,
        session: &sessions::Model,
        request: &UpstreamRequest,
    ) -> AttemptResult {
        let started = Instant::now();
        let user_agent = self.pick_user_agent().to_string();
        let payload = build_chat_payload(&request.model, &request.message, request.is_reasoning);

        debug!(
            session_id = %session.id,
            model = %request.model,
            "Dispatching upstream attempt"
        );

        let response = match self
            .http
            .post(self.chat_url())
            .headers(self.headers(session, &user_agent))
            .json(&payload)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let (outcome, timed_out) = classify_transport(&e);
                warn!(session_id = %session.id, error = %e, "Upstream dispatch failed");
                return AttemptResult {
                    timed_out,
                    ..AttemptResult::failure(
                        outcome,
                        None,
                        Some(e.to_string()),
                        started.elapsed(),
                    )
                };
            }
        };

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = match response.bytes().await {
                Ok(bytes) => {
                    let end = bytes.len().min(ERROR_BODY_LIMIT);
                    String::from_utf8_lossy(&bytes[..end]).into_owned()
                }
                Err(_) => String::new(),
            };
            let outcome = classify_status(status, &body);
            // Latency stops at the first error signal
            return AttemptResult::failure(outcome, Some(status), Some(body), started.elapsed());
        }

        let mut accumulator = StreamAccumulator::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => {
                    if let Some(message) = accumulator.push_chunk(&bytes) {
                        let outcome = classify_error_event(&message);
                        return AttemptResult::failure(
                            outcome,
                            Some(status),
                            Some(message),
                            started.elapsed(),
                        );
                    }
                }
                Err(e) => {
                    let (outcome, timed_out) = classify_transport(&e);
                    warn!(session_id = %session.id, error = %e, "Upstream stream interrupted");
                    return AttemptResult {
                        timed_out,
                        ..AttemptResult::failure(
                            outcome,
                            Some(status),
                            Some(e.to_string()),
                            started.elapsed(),
                        )
                    };
                }
            }
        }

        let reply = accumulator.finish();
        AttemptResult {
            outcome: Outcome::Success,
            http_status: Some(status),
            reply: Some(reply),
            error_snippet: None,
            latency: started.elapsed(),
            timed_out: false,
        }
    }
}
