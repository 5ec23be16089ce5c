//! Resilience coordinator: drives one inbound chat request through session
//! acquisition, upstream attempts, retry with progressive backoff, and the
//! terminal persistence of its generation and token-usage rows.

pub mod circuit;

use crate::config::{Config, ResilienceConfig};
use crate::database::entities::{generations, token_usage};
use crate::database::DatabaseManager;
use crate::error::AppError;
use crate::grok::{GrokUpstream, Outcome, UpstreamRequest, UpstreamUsage};
use crate::metrics;
use crate::openai::transform::{canonical_prompt, map_model};
use crate::openai::ChatCompletionRequest;
use crate::pool::SessionPool;
use crate::telemetry;
use async_trait::async_trait;
use chrono::Utc;
use circuit::{CircuitBreaker, CircuitState};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// HTTP-equivalent status persisted for a caller-cancelled request.
const STATUS_CLIENT_CLOSED_REQUEST: i32 = 499;

const CANCELLED_MESSAGE: &str = "request cancelled by client";

/// The terminal result of one coordinated request.
#[derive(Debug, Clone)]
pub struct CompletedGeneration {
    pub generation_id: String,
    pub session_id: String,
    pub model: String,
    pub content: String,
    pub reasoning_content: Option<String>,
    pub finish_reason: String,
    pub usage: UpstreamUsage,
    pub latency_ms: i64,
}

/// Chat service trait for dependency injection and testing
#[async_trait]
pub trait ChatService: Send + Sync {
    /// Drive one inbound request to its terminal outcome. The `cancel`
    /// channel observes the caller: a signalled or dropped sender abandons
    /// the in-flight attempt and stops further retries.
    async fn handle(
        &self,
        request_id: &str,
        request: &ChatCompletionRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<CompletedGeneration, AppError>;

    fn circuit_state(&self) -> CircuitState;
}

struct LastFailure {
    outcome: Outcome,
    http_status: Option<u16>,
    snippet: Option<String>,
    timed_out: bool,
}

pub struct ChatServiceImpl {
    pool: Arc<SessionPool>,
    upstream: Arc<dyn GrokUpstream>,
    database: Arc<DatabaseManager>,
    breaker: CircuitBreaker,
    provider: String,
    resilience: ResilienceConfig,
}

impl ChatServiceImpl {
    pub fn new(
        pool: Arc<SessionPool>,
        upstream: Arc<dyn GrokUpstream>,
        database: Arc<DatabaseManager>,
        config: &Config,
    ) -> Self {
        Self {
            pool,
            upstream,
            database,
            breaker: CircuitBreaker::from_config(&config.resilience),
            provider: config.upstream.provider.clone(),
            resilience: config.resilience.clone(),
        }
    }

    /// Base generation row carrying the request snapshot; outcome fields are
    /// filled in by the success/failure paths.
    fn generation_row(
        &self,
        request_id: &str,
        request: &ChatCompletionRequest,
        model: &str,
        prompt: &str,
        session_id: Option<String>,
        status: i32,
        latency_ms: i64,
    ) -> generations::Model {
        generations::Model {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.to_string(),
            session_id,
            provider: self.provider.clone(),
            model: model.to_string(),
            prompt: prompt.to_string(),
            prompt_tokens: 0,
            response_text: None,
            response_tokens: 0,
            response_raw: None,
            status,
            latency_ms: latency_ms as i32,
            error_message: None,
            reasoning_tokens: 0,
            audio_tokens: 0,
            image_tokens: 0,
            cached_tokens: 0,
            accepted_prediction_tokens: 0,
            rejected_prediction_tokens: 0,
            num_sources_used: 0,
            response_id: None,
            previous_response_id: None,
            temperature: request.temperature,
            top_p: request.top_p,
            max_output_tokens: request.max_output_tokens,
            parallel_tool_calls: request.parallel_tool_calls,
            tool_choice: request.tool_choice.as_ref().map(|tc| tc.as_persisted()),
            finish_reason: None,
            reasoning_content: None,
            incomplete_details: None,
            annotations: None,
            created_at: Utc::now(),
        }
    }

    /// Persist the terminal row; a persistence failure is a telemetry gap,
    /// never a request failure.
    async fn persist_generation(&self, row: &generations::Model) {
        if let Err(e) = self.database.generations().insert(row).await {
            warn!(
                request_id = %row.request_id,
                error = %e,
                "Failed to persist generation row"
            );
        }
    }

    async fn persist_token_usage(
        &self,
        generation: &generations::Model,
        usage: &UpstreamUsage,
    ) {
        let row = token_usage::Model {
            id: Uuid::new_v4().to_string(),
            generation_id: generation.id.clone(),
            user_id: None,
            session_id: generation.session_id.clone(),
            created_at: Utc::now(),
            provider: generation.provider.clone(),
            model: generation.model.clone(),
            prompt_text_tokens: usage.prompt_tokens,
            prompt_audio_tokens: usage.audio_tokens,
            prompt_image_tokens: usage.image_tokens,
            prompt_cached_tokens: usage.cached_tokens,
            prompt_total_tokens: usage.prompt_tokens,
            completion_reasoning_tokens: usage.reasoning_tokens,
            completion_audio_tokens: 0,
            completion_text_tokens: usage.completion_tokens,
            completion_accepted_prediction_tokens: usage.accepted_prediction_tokens,
            completion_rejected_prediction_tokens: usage.rejected_prediction_tokens,
            completion_total_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            prompt_cost_micro_usd: 0,
            completion_cost_micro_usd: 0,
            total_cost_micro_usd: 0,
        };
        if let Err(e) = self.database.token_usage().insert(&row).await {
            warn!(
                generation_id = %generation.id,
                error = %e,
                "Failed to persist token usage row"
            );
        }
    }

    async fn finish_cancelled(
        &self,
        request_id: &str,
        request: &ChatCompletionRequest,
        model: &str,
        prompt: &str,
        session_id: Option<String>,
        started: Instant,
        probe: bool,
    ) -> AppError {
        if probe {
            self.breaker.on_probe_abandoned();
        }
        let mut row = self.generation_row(
            request_id,
            request,
            model,
            prompt,
            session_id,
            STATUS_CLIENT_CLOSED_REQUEST,
            started.elapsed().as_millis() as i64,
        );
        row.error_message = Some(CANCELLED_MESSAGE.to_string());
        self.persist_generation(&row).await;
        metrics::record_error("cancelled", "/v1/chat/completions");
        AppError::Internal(CANCELLED_MESSAGE.to_string())
    }
}

/// Resolves when the caller signals cancellation or disappears.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender dropped: the caller is gone
            return;
        }
    }
}

#[async_trait]
impl ChatService for ChatServiceImpl {
    async fn handle(
        &self,
        request_id: &str,
        request: &ChatCompletionRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<CompletedGeneration, AppError> {
        let Some(permit) = self.breaker.allow_request() else {
            metrics::record_error("service_unavailable", "/v1/chat/completions");
            return Err(AppError::ServiceUnavailable(
                "upstream temporarily unavailable".to_string(),
            ));
        };

        let started = Instant::now();
        let model = map_model(&request.model);
        let prompt = canonical_prompt(&request.messages);
        let upstream_request = UpstreamRequest {
            model: model.clone(),
            message: prompt.clone(),
            is_reasoning: false,
        };

        let max_attempts = self.resilience.max_attempts.max(1);
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_failure: Option<LastFailure> = None;
        let mut last_session_id: Option<String> = None;
        let mut attempt: u32 = 0;

        while attempt < max_attempts {
            let session = match self.pool.acquire(&self.provider, &excluded, attempt == 0).await
            {
                Some(session) => session,
                None => {
                    if permit.probe {
                        self.breaker.on_probe_abandoned();
                    }
                    metrics::record_error("no_healthy_sessions", "/v1/chat/completions");
                    if attempt > 0 {
                        // Attempts were made; record the terminal failure row
                        let mut row = self.generation_row(
                            request_id,
                            request,
                            &model,
                            &prompt,
                            last_session_id.clone(),
                            503,
                            started.elapsed().as_millis() as i64,
                        );
                        row.error_message =
                            Some("no healthy sessions remaining after retries".to_string());
                        self.persist_generation(&row).await;
                    }
                    return Err(AppError::NoHealthySessions);
                }
            };
            excluded.insert(session.id.clone());
            last_session_id = Some(session.id.clone());

            let result = tokio::select! {
                result = self.upstream.attempt(&session, &upstream_request) => result,
                _ = cancelled(&mut cancel) => {
                    self.pool.release(&session.id, Outcome::TransportError).await;
                    telemetry::record_attempt(
                        request_id,
                        attempt,
                        &session.id,
                        Outcome::TransportError,
                        None,
                        started.elapsed().as_millis() as i64,
                        Some(CANCELLED_MESSAGE),
                        &session.cookie_text,
                    );
                    return Err(self
                        .finish_cancelled(
                            request_id,
                            request,
                            &model,
                            &prompt,
                            Some(session.id.clone()),
                            started,
                            permit.probe,
                        )
                        .await);
                }
            };

            telemetry::record_attempt(
                request_id,
                attempt,
                &session.id,
                result.outcome,
                result.http_status,
                result.latency.as_millis() as i64,
                result.error_snippet.as_deref(),
                &session.cookie_text,
            );
            self.pool.release(&session.id, result.outcome).await;

            match result.outcome {
                Outcome::Success => {
                    self.breaker.on_success();
                    let reply = result.reply.ok_or_else(|| {
                        AppError::Internal("upstream succeeded without a reply".to_string())
                    })?;
                    let latency_ms = started.elapsed().as_millis() as i64;

                    let mut row = self.generation_row(
                        request_id,
                        request,
                        &model,
                        &prompt,
                        Some(session.id.clone()),
                        result.http_status.unwrap_or(200) as i32,
                        latency_ms,
                    );
                    row.prompt_tokens = reply.usage.prompt_tokens;
                    row.response_text = Some(reply.text.clone());
                    row.response_tokens = reply.usage.completion_tokens;
                    row.response_raw = reply.raw.clone();
                    row.reasoning_tokens = reply.usage.reasoning_tokens;
                    row.audio_tokens = reply.usage.audio_tokens;
                    row.image_tokens = reply.usage.image_tokens;
                    row.cached_tokens = reply.usage.cached_tokens;
                    row.accepted_prediction_tokens = reply.usage.accepted_prediction_tokens;
                    row.rejected_prediction_tokens = reply.usage.rejected_prediction_tokens;
                    row.num_sources_used = reply.usage.num_sources_used;
                    row.response_id = reply.response_id.clone();
                    row.finish_reason = Some(reply.finish_reason.clone());
                    row.reasoning_content = reply.reasoning_content.clone();
                    self.persist_generation(&row).await;
                    self.persist_token_usage(&row, &reply.usage).await;

                    metrics::record_generation(
                        &model,
                        &self.provider,
                        result.http_status.unwrap_or(200),
                        latency_ms,
                    );
                    info!(
                        request_id = %request_id,
                        generation_id = %row.id,
                        attempts = attempt + 1,
                        latency_ms = latency_ms,
                        "Generation complete"
                    );

                    return Ok(CompletedGeneration {
                        generation_id: row.id,
                        session_id: session.id,
                        model,
                        content: reply.text,
                        reasoning_content: reply.reasoning_content,
                        finish_reason: reply.finish_reason,
                        usage: reply.usage,
                        latency_ms,
                    });
                }
                Outcome::ClientError => {
                    // The upstream answered; this is not an upstream health
                    // signal, and retrying the same payload cannot help.
                    self.breaker.on_success();
                    let status = result.http_status.unwrap_or(400);
                    let message = telemetry::sanitize_snippet(
                        result.error_snippet.as_deref().unwrap_or("upstream rejected request"),
                        &session.cookie_text,
                    );
                    let latency_ms = started.elapsed().as_millis() as i64;

                    let mut row = self.generation_row(
                        request_id,
                        request,
                        &model,
                        &prompt,
                        Some(session.id.clone()),
                        status as i32,
                        latency_ms,
                    );
                    row.error_message = Some(message.clone());
                    self.persist_generation(&row).await;
                    metrics::record_generation(&model, &self.provider, status, latency_ms);

                    return Err(AppError::UpstreamRejected { status, message });
                }
                outcome => {
                    last_failure = Some(LastFailure {
                        outcome,
                        http_status: result.http_status,
                        snippet: result
                            .error_snippet
                            .map(|s| telemetry::sanitize_snippet(&s, &session.cookie_text)),
                        timed_out: result.timed_out,
                    });
                    attempt += 1;
                    if attempt < max_attempts {
                        let delay = self.resilience.backoff_for_attempt((attempt - 1) as usize);
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancelled(&mut cancel) => {
                                return Err(self
                                    .finish_cancelled(
                                        request_id,
                                        request,
                                        &model,
                                        &prompt,
                                        Some(session.id.clone()),
                                        started,
                                        permit.probe,
                                    )
                                    .await);
                            }
                        }
                    }
                }
            }
        }

        // Exhausted every attempt; this is the upstream-wide failure signal
        self.breaker.on_terminal_failure();
        metrics::record_circuit_state(self.breaker.state());

        let failure = last_failure.ok_or_else(|| {
            AppError::Internal("retry loop exhausted without recording a failure".to_string())
        })?;
        let status = failure
            .http_status
            .map(|s| s as i32)
            .unwrap_or(if failure.timed_out { 504 } else { 502 });
        let latency_ms = started.elapsed().as_millis() as i64;

        let mut row = self.generation_row(
            request_id,
            request,
            &model,
            &prompt,
            last_session_id,
            status,
            latency_ms,
        );
        row.error_message = Some(format!(
            "exhausted {} attempts; last outcome: {}{}",
            max_attempts,
            failure.outcome,
            failure
                .snippet
                .as_deref()
                .map(|s| format!(" ({})", s))
                .unwrap_or_default()
        ));
        self.persist_generation(&row).await;

        metrics::record_generation(&model, &self.provider, status as u16, latency_ms);
        metrics::record_error("upstream_exhausted", "/v1/chat/completions");
        warn!(
            request_id = %request_id,
            attempts = max_attempts,
            last_outcome = %failure.outcome,
            "Request exhausted all attempts"
        );

        if failure.timed_out {
            Err(AppError::UpstreamTimeout)
        } else {
            Err(AppError::ServiceUnavailable(format!(
                "upstream attempts exhausted (last outcome: {})",
                failure.outcome
            )))
        }
    }

    fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grok::wire::UpstreamUsage;
    use crate::test_utils::{MockAttempt, MockGrokUpstream, setup_test_database};
    use crate::config::PoolConfig;
    use std::time::Duration;

    fn chat_request(stream: bool) -> ChatCompletionRequest {
        serde_json::from_value(serde_json::json!({
            "model": "grok-3",
            "messages": [{"role": "user", "content": "hello"}],
            "stream": stream,
        }))
        .unwrap()
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.resilience.backoff_seconds = vec![0, 0, 0, 0, 0];
        config.pool = PoolConfig {
            acquire_wait_seconds: 0,
            ..PoolConfig::default()
        };
        config
    }

    async fn build_service(
        config: &Config,
        upstream: Arc<MockGrokUpstream>,
        cookies: &[&str],
    ) -> (ChatServiceImpl, Arc<SessionPool>) {
        let database = Arc::new(setup_test_database().await);
        let pool = Arc::new(SessionPool::new(database.clone(), config.pool.clone()));
        for cookie in cookies {
            pool.create_session(cookie, "grok", None, serde_json::json!({}))
                .await
                .unwrap();
        }
        let service = ChatServiceImpl::new(pool.clone(), upstream, database, config);
        (service, pool)
    }

    fn live_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let config = fast_config();
        let upstream = Arc::new(MockGrokUpstream::always(MockAttempt::success(
            "hi",
            UpstreamUsage {
                prompt_tokens: 5,
                completion_tokens: 2,
                total_tokens: 7,
                ..UpstreamUsage::default()
            },
        )));
        let (service, _pool) = build_service(&config, upstream.clone(), &["sso=a"]).await;

        let (_guard, cancel) = live_cancel();
        let completed = service
            .handle("req-1", &chat_request(false), cancel)
            .await
            .unwrap();

        assert_eq!(completed.content, "hi");
        assert_eq!(completed.usage.total_tokens, 7);
        assert_eq!(upstream.call_count(), 1);

        // One generation row with the upstream status
        let generation = service
            .database
            .generations()
            .get_by_request_id("req-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(generation.status, 200);
        assert_eq!(generation.response_text.as_deref(), Some("hi"));
        let usage_row = service
            .database
            .token_usage()
            .get_by_generation_id(&generation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(usage_row.total_tokens, 7);
    }

    #[tokio::test]
    async fn test_rotates_to_next_session_on_rate_limit() {
        let config = fast_config();
        let upstream = Arc::new(MockGrokUpstream::scripted(vec![
            MockAttempt::failure(Outcome::RateLimit, Some(429)),
            MockAttempt::success("ok", UpstreamUsage::default()),
        ]));
        let (service, pool) = build_service(&config, upstream.clone(), &["sso=a", "sso=b"]).await;

        let (_guard, cancel) = live_cancel();
        let completed = service
            .handle("req-1", &chat_request(false), cancel)
            .await
            .unwrap();

        assert_eq!(completed.content, "ok");
        assert_eq!(upstream.call_count(), 2);
        // Two different sessions were used
        let used = upstream.sessions_used();
        assert_ne!(used[0], used[1]);
        // Rate-limited session keeps its status
        let stats = pool.stats().await;
        assert_eq!(stats.healthy, 2);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let config = fast_config();
        let upstream = Arc::new(MockGrokUpstream::always(MockAttempt::failure(
            Outcome::ClientError,
            Some(422),
        )));
        let (service, _pool) = build_service(&config, upstream.clone(), &["sso=a", "sso=b"]).await;

        let (_guard, cancel) = live_cancel();
        let err = service
            .handle("req-1", &chat_request(false), cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AppError::UpstreamRejected { status: 422, .. }
        ));
        assert_eq!(upstream.call_count(), 1);
        assert_eq!(service.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_single_attempt_when_configured() {
        let mut config = fast_config();
        config.resilience.max_attempts = 1;
        let upstream = Arc::new(MockGrokUpstream::always(MockAttempt::failure(
            Outcome::Upstream5xx,
            Some(502),
        )));
        let (service, _pool) = build_service(&config, upstream.clone(), &["sso=a", "sso=b"]).await;

        let (_guard, cancel) = live_cancel();
        let err = service
            .handle("req-1", &chat_request(false), cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::ServiceUnavailable(_)));
        assert_eq!(upstream.call_count(), 1);
    }

    #[tokio::test]
    async fn test_no_sessions_returns_capacity_error_without_circuit_impact() {
        let config = fast_config();
        let upstream = Arc::new(MockGrokUpstream::always(MockAttempt::success(
            "unused",
            UpstreamUsage::default(),
        )));
        let (service, _pool) = build_service(&config, upstream.clone(), &[]).await;

        for _ in 0..10 {
            let (_guard, cancel) = live_cancel();
            let err = service
                .handle("req-1", &chat_request(false), cancel)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::NoHealthySessions));
        }
        assert_eq!(upstream.call_count(), 0);
        // Capacity failures never open the circuit
        assert_eq!(service.circuit_state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_exhaustion_feeds_circuit_until_open() {
        let mut config = fast_config();
        config.resilience.max_attempts = 1;
        config.resilience.circuit_failure_threshold = 3;
        let upstream = Arc::new(MockGrokUpstream::always(MockAttempt::failure(
            Outcome::Upstream5xx,
            Some(503),
        )));
        let (service, _pool) = build_service(&config, upstream.clone(), &["sso=a"]).await;

        for _ in 0..3 {
            let (_guard, cancel) = live_cancel();
            let _ = service.handle("req", &chat_request(false), cancel).await;
        }
        assert_eq!(service.circuit_state(), CircuitState::Open);

        // Short-circuits without touching the pool or upstream
        let calls_before = upstream.call_count();
        let (_guard, cancel) = live_cancel();
        let err = service
            .handle("req", &chat_request(false), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ServiceUnavailable(_)));
        assert_eq!(upstream.call_count(), calls_before);
    }

    #[tokio::test]
    async fn test_timeout_exhaustion_maps_to_upstream_timeout() {
        let mut config = fast_config();
        config.resilience.max_attempts = 2;
        let upstream = Arc::new(MockGrokUpstream::always(MockAttempt::timeout()));
        let (service, _pool) = build_service(&config, upstream.clone(), &["sso=a", "sso=b"]).await;

        let (_guard, cancel) = live_cancel();
        let err = service
            .handle("req-1", &chat_request(false), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamTimeout));
        assert_eq!(upstream.call_count(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries_and_persists_row() {
        let config = fast_config();
        let upstream = Arc::new(MockGrokUpstream::scripted(vec![
            MockAttempt::failure(Outcome::RateLimit, Some(429)),
            MockAttempt::success("slow", UpstreamUsage::default())
                .with_delay(Duration::from_secs(30)),
        ]));
        let (service, pool) = build_service(&config, upstream.clone(), &["sso=a", "sso=b"]).await;
        let service = Arc::new(service);

        let (cancel_tx, cancel_rx) = live_cancel();
        let handle = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .handle("req-cancel", &chat_request(false), cancel_rx)
                    .await
            })
        };

        // Let attempt 1 fail and attempt 2 get in flight, then cancel
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        // Attempt 3 never started
        assert_eq!(upstream.call_count(), 2);

        // The in-flight session was released with a failure outcome
        let stats = pool.stats().await;
        assert_eq!(stats.in_flight, 0);

        let generation = service
            .database
            .generations()
            .get_by_request_id("req-cancel")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(generation.status, STATUS_CLIENT_CLOSED_REQUEST);
        assert_eq!(
            generation.error_message.as_deref(),
            Some(CANCELLED_MESSAGE)
        );
        assert!(generation.latency_ms >= 0);
    }

    #[tokio::test]
    async fn test_dropped_caller_counts_as_cancellation() {
        let config = fast_config();
        let upstream = Arc::new(MockGrokUpstream::always(
            MockAttempt::success("slow", UpstreamUsage::default())
                .with_delay(Duration::from_secs(30)),
        ));
        let (service, _pool) = build_service(&config, upstream.clone(), &["sso=a"]).await;
        let service = Arc::new(service);

        let (cancel_tx, cancel_rx) = live_cancel();
        let handle = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .handle("req-drop", &chat_request(false), cancel_rx)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(cancel_tx);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
        assert_eq!(upstream.call_count(), 1);
    }

    #[tokio::test]
    async fn test_attempt_usage_accounting_per_attempt() {
        let config = fast_config();
        let upstream = Arc::new(MockGrokUpstream::scripted(vec![
            MockAttempt::failure(Outcome::Upstream5xx, Some(502)),
            MockAttempt::failure(Outcome::Upstream5xx, Some(502)),
            MockAttempt::success("done", UpstreamUsage::default()),
        ]));
        let (service, pool) = build_service(&config, upstream.clone(), &["sso=a", "sso=b", "sso=c"])
            .await;

        let (_guard, cancel) = live_cancel();
        service
            .handle("req-1", &chat_request(false), cancel)
            .await
            .unwrap();

        // Each leased session's usage_count incremented exactly once
        let sessions = pool
            .list_sessions(&crate::database::SessionFilter::default())
            .await
            .unwrap();
        let total_usage: i64 = sessions.iter().map(|s| s.usage_count).sum();
        assert_eq!(total_usage, 3);
        for session in sessions {
            assert!(session.usage_count <= 1);
        }
    }
}
