//! Shared test infrastructure: in-memory database setup, a scriptable mock
//! upstream, and a server builder wired around them.

use crate::config::{Config, DatabaseConfig, PoolConfig};
use crate::database::entities::sessions;
use crate::database::DatabaseManager;
use crate::grok::client::{AttemptResult, GrokUpstream, UpstreamRequest};
use crate::grok::wire::{UpstreamReply, UpstreamUsage};
use crate::grok::Outcome;
use crate::server::Server;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fresh in-memory SQLite database with the schema applied. A single pool
/// connection keeps every query on the same in-memory instance.
pub async fn setup_test_database() -> DatabaseManager {
    let database = DatabaseManager::new_from_config(&DatabaseConfig {
        url: "sqlite::memory:".to_string(),
        min_connections: 1,
        max_connections: 1,
    })
    .await
    .expect("failed to open in-memory database");
    database.migrate().await.expect("failed to run migrations");
    database
}

/// One scripted upstream attempt.
#[derive(Debug, Clone)]
pub struct MockAttempt {
    pub outcome: Outcome,
    pub http_status: Option<u16>,
    pub text: String,
    pub usage: UpstreamUsage,
    pub error_snippet: Option<String>,
    pub delay: Option<Duration>,
    pub timed_out: bool,
}

impl MockAttempt {
    pub fn success(text: &str, usage: UpstreamUsage) -> Self {
        Self {
            outcome: Outcome::Success,
            http_status: Some(200),
            text: text.to_string(),
            usage,
            error_snippet: None,
            delay: None,
            timed_out: false,
        }
    }

    pub fn failure(outcome: Outcome, http_status: Option<u16>) -> Self {
        Self {
            outcome,
            http_status,
            text: String::new(),
            usage: UpstreamUsage::default(),
            error_snippet: Some(format!("mock upstream failure: {}", outcome)),
            delay: None,
            timed_out: false,
        }
    }

    pub fn timeout() -> Self {
        Self {
            timed_out: true,
            ..Self::failure(Outcome::TransportError, None)
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_snippet(mut self, snippet: &str) -> Self {
        self.error_snippet = Some(snippet.to_string());
        self
    }
}

enum MockMode {
    /// Pop attempts in order; panics when the script runs dry.
    Scripted(VecDeque<MockAttempt>),
    /// Repeat the same attempt forever.
    Always(MockAttempt),
}

/// Scriptable stand-in for the upstream client, recording which sessions
/// were used.
pub struct MockGrokUpstream {
    mode: Mutex<MockMode>,
    sessions: Mutex<Vec<String>>,
}

impl MockGrokUpstream {
    pub fn scripted(attempts: Vec<MockAttempt>) -> Self {
        Self {
            mode: Mutex::new(MockMode::Scripted(attempts.into())),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn always(attempt: MockAttempt) -> Self {
        Self {
            mode: Mutex::new(MockMode::Always(attempt)),
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Session ids in attempt order.
    pub fn sessions_used(&self) -> Vec<String> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl GrokUpstream for MockGrokUpstream {
    async fn attempt(
        &self,
        session: &sessions::Model,
        _request: &UpstreamRequest,
    ) -> AttemptResult {
        let attempt = {
            let mut mode = self.mode.lock().unwrap();
            self.sessions.lock().unwrap().push(session.id.clone());
            match &mut *mode {
                MockMode::Scripted(queue) => queue
                    .pop_front()
                    .expect("mock upstream script exhausted: unexpected extra attempt"),
                MockMode::Always(attempt) => attempt.clone(),
            }
        };

        if let Some(delay) = attempt.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = if attempt.outcome == Outcome::Success {
            Some(UpstreamReply {
                text: attempt.text.clone(),
                reasoning_content: None,
                finish_reason: "stop".to_string(),
                usage: attempt.usage.clone(),
                raw: Some(serde_json::json!({"message": attempt.text})),
                response_id: None,
            })
        } else {
            None
        };

        AttemptResult {
            outcome: attempt.outcome,
            http_status: attempt.http_status,
            reply,
            error_snippet: attempt.error_snippet,
            latency: attempt.delay.unwrap_or(Duration::from_millis(1)),
            timed_out: attempt.timed_out,
        }
    }
}

/// Builder for a fully wired test server: in-memory database, mock upstream,
/// zeroed backoffs, metrics exporter disabled.
pub struct TestServerBuilder {
    config: Option<Config>,
    upstream: Option<Arc<MockGrokUpstream>>,
    admin_key: Option<String>,
}

impl TestServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            upstream: None,
            admin_key: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_upstream(mut self, upstream: Arc<MockGrokUpstream>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    pub fn with_admin_key(mut self, key: &str) -> Self {
        self.admin_key = Some(key.to_string());
        self
    }

    pub fn test_config() -> Config {
        let mut config = Config::default();
        config.database = DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            min_connections: 1,
            max_connections: 1,
        };
        config.metrics.enabled = false;
        config.auth.api_keys = "test-key".to_string();
        config.pool = PoolConfig {
            acquire_wait_seconds: 0,
            ..PoolConfig::default()
        };
        config.resilience.backoff_seconds = vec![0, 0, 0, 0, 0];
        config
    }

    pub async fn build(self) -> Server {
        let mut config = self.config.unwrap_or_else(Self::test_config);
        if let Some(admin_key) = self.admin_key {
            config.auth.admin_api_keys = admin_key;
        }
        let upstream = self.upstream.unwrap_or_else(|| {
            Arc::new(MockGrokUpstream::always(MockAttempt::success(
                "mock response",
                UpstreamUsage::default(),
            )))
        });

        let server = Server::build(config, upstream)
            .await
            .expect("failed to build test server");
        server
            .database
            .migrate()
            .await
            .expect("failed to migrate test database");
        server
    }
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert a healthy session directly through the pool.
pub async fn create_test_session(server: &Server, cookie_text: &str) -> sessions::Model {
    server
        .session_pool
        .create_session(cookie_text, "grok", None, serde_json::json!({}))
        .await
        .expect("failed to create test session")
}
