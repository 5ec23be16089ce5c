//! Session pool and rotation engine.
//!
//! Keeps an in-memory projection of session rows, classifies each session's
//! effective status, and hands sessions out to the request coordinator. The
//! pool is the only in-process mutator of session status and counters; all
//! durable state goes through the persistence gateway.

pub mod health_loop;

use crate::config::PoolConfig;
use crate::database::entities::sessions::{self, SessionStatus};
use crate::database::{DatabaseError, DatabaseManager, DatabaseResult, SessionFilter, with_retry};
use crate::grok::Outcome;
use crate::metrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Consecutive auth failures before a session is quarantined.
const AUTH_FAILURE_QUARANTINE_THRESHOLD: u32 = 3;
/// Consecutive auth failures before a quarantined session is revoked.
const AUTH_FAILURE_REVOKE_THRESHOLD: u32 = 6;
/// Consecutive anti-bot interceptions before a session is quarantined.
const ANTI_BOT_QUARANTINE_THRESHOLD: u32 = 3;
/// Sessions with fewer uses than this are exempt from the failure-rate rule.
const FAILURE_RATE_MIN_USAGE: i64 = 20;

/// Poll interval while waiting for a session to become available.
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(200);

struct PoolEntry {
    session: sessions::Model,
    /// In-flight leases; never persisted.
    leases: u32,
    consecutive_auth_failures: u32,
    consecutive_anti_bot: u32,
}

impl PoolEntry {
    fn new(session: sessions::Model) -> Self {
        Self {
            session,
            leases: 0,
            consecutive_auth_failures: 0,
            consecutive_anti_bot: 0,
        }
    }
}

/// Aggregate pool health, computed over effective statuses.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub healthy: usize,
    pub quarantined: usize,
    pub expired: usize,
    pub revoked: usize,
    pub in_flight: usize,
    pub avg_failure_rate: f64,
}

/// Effective status of a session at read time.
///
/// Stored non-healthy statuses are authoritative (demotions are never undone
/// automatically); a stored-healthy session is demoted by the first matching
/// retirement rule.
pub fn classify(session: &sessions::Model, config: &PoolConfig, now: DateTime<Utc>) -> SessionStatus {
    match session.status {
        SessionStatus::Revoked => SessionStatus::Revoked,
        SessionStatus::Expired => SessionStatus::Expired,
        SessionStatus::Quarantined => SessionStatus::Quarantined,
        SessionStatus::Healthy => {
            if session.expires_at.is_some_and(|at| at <= now) {
                return SessionStatus::Expired;
            }
            if session.usage_count >= config.rotation_threshold {
                return SessionStatus::Expired;
            }
            if now - session.created_at > ChronoDuration::hours(config.max_age_hours) {
                return SessionStatus::Expired;
            }
            if session.usage_count >= FAILURE_RATE_MIN_USAGE
                && session.failure_rate() >= config.failure_threshold
            {
                return SessionStatus::Quarantined;
            }
            SessionStatus::Healthy
        }
    }
}

/// Why a stored-healthy session is being retired, for rotation metrics.
fn rotation_reason(
    session: &sessions::Model,
    config: &PoolConfig,
    now: DateTime<Utc>,
) -> &'static str {
    if session.expires_at.is_some_and(|at| at <= now) {
        "cookie_expired"
    } else if session.usage_count >= config.rotation_threshold {
        "usage_limit"
    } else if now - session.created_at > ChronoDuration::hours(config.max_age_hours) {
        "age_limit"
    } else {
        "failure_rate"
    }
}

pub struct SessionPool {
    database: Arc<DatabaseManager>,
    config: PoolConfig,
    inner: RwLock<HashMap<String, PoolEntry>>,
}

impl SessionPool {
    pub fn new(database: Arc<DatabaseManager>, config: PoolConfig) -> Self {
        Self {
            database,
            config,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the projection from persistence, preserving lease counters
    /// and consecutive-failure tracking for sessions that survive.
    pub async fn reload(&self) -> DatabaseResult<usize> {
        let rows = with_retry(|| async {
            self.database
                .sessions()
                .list(&SessionFilter::default())
                .await
        })
        .await?;

        let mut inner = self.inner.write().await;
        let mut fresh = HashMap::with_capacity(rows.len());
        for session in rows {
            let entry = match inner.remove(&session.id) {
                Some(mut existing) => {
                    existing.session = session;
                    existing
                }
                None => PoolEntry::new(session),
            };
            fresh.insert(entry.session.id.clone(), entry);
        }
        *inner = fresh;
        Ok(inner.len())
    }

    /// Acquire a session for one attempt. Candidates are effective-healthy
    /// sessions of the provider, excluding ids already tried within the
    /// request; ties break on fewest leases, then lowest usage, then oldest
    /// use. When `allow_wait` is set and the pool is empty, acquisition
    /// polls for a bounded window before giving up.
    pub async fn acquire(
        &self,
        provider: &str,
        excluded: &HashSet<String>,
        allow_wait: bool,
    ) -> Option<sessions::Model> {
        let deadline = Instant::now() + Duration::from_secs(self.config.acquire_wait_seconds);
        loop {
            if let Some(session) = self.try_acquire(provider, excluded).await {
                return Some(session);
            }
            if !allow_wait || Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    async fn try_acquire(
        &self,
        provider: &str,
        excluded: &HashSet<String>,
    ) -> Option<sessions::Model> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let chosen = inner
            .values()
            .filter(|entry| entry.session.provider == provider)
            .filter(|entry| !excluded.contains(&entry.session.id))
            .filter(|entry| classify(&entry.session, &self.config, now) == SessionStatus::Healthy)
            .min_by_key(|entry| {
                (
                    entry.leases,
                    entry.session.usage_count,
                    entry.session.last_used_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
                    entry.session.id.clone(),
                )
            })
            .map(|entry| entry.session.id.clone())?;

        let entry = inner.get_mut(&chosen)?;
        entry.leases += 1;
        debug!(
            session_id = %entry.session.id,
            usage = entry.session.usage_count,
            leases = entry.leases,
            "Acquired session"
        );
        Some(entry.session.clone())
    }

    /// Release a session after one attempt, recording the outcome.
    ///
    /// Counters persist through the gateway's atomic increment; consecutive
    /// auth failures and anti-bot interceptions drive quarantine proposals.
    /// A rate-limited session is itself fine and keeps its status.
    pub async fn release(&self, session_id: &str, outcome: Outcome) {
        let success = outcome.is_success();

        let proposal = {
            let mut inner = self.inner.write().await;
            match inner.get_mut(session_id) {
                Some(entry) => {
                    entry.leases = entry.leases.saturating_sub(1);
                    entry.session.usage_count += 1;
                    if success {
                        entry.session.success_count += 1;
                    } else {
                        entry.session.failure_count += 1;
                    }
                    entry.session.last_used_at = Some(Utc::now());

                    match outcome {
                        Outcome::AuthFailure => {
                            entry.consecutive_auth_failures += 1;
                            entry.consecutive_anti_bot = 0;
                            if entry.consecutive_auth_failures >= AUTH_FAILURE_REVOKE_THRESHOLD {
                                Some((SessionStatus::Revoked, "auth_failure"))
                            } else if entry.consecutive_auth_failures
                                >= AUTH_FAILURE_QUARANTINE_THRESHOLD
                            {
                                Some((SessionStatus::Quarantined, "auth_failure"))
                            } else {
                                None
                            }
                        }
                        Outcome::AntiBot => {
                            entry.consecutive_anti_bot += 1;
                            entry.consecutive_auth_failures = 0;
                            if entry.consecutive_anti_bot >= ANTI_BOT_QUARANTINE_THRESHOLD {
                                Some((SessionStatus::Quarantined, "anti_bot"))
                            } else {
                                None
                            }
                        }
                        _ => {
                            entry.consecutive_auth_failures = 0;
                            entry.consecutive_anti_bot = 0;
                            None
                        }
                    }
                }
                None => None,
            }
        };

        let persisted = with_retry(|| async {
            self.database
                .sessions()
                .increment_usage(session_id, success)
                .await
        })
        .await;
        if let Err(e) = persisted {
            // Telemetry gap: keep serving from the in-memory view
            warn!(
                session_id = %session_id,
                error = %e,
                "Failed to persist session usage"
            );
        }

        if let Some((status, reason)) = proposal {
            self.apply_status(session_id, status, reason).await;
        }
    }

    /// Apply a status change in persistence and the projection. An already
    /// applied or superseded transition is not an error.
    async fn apply_status(&self, session_id: &str, status: SessionStatus, reason: &str) {
        match self
            .database
            .sessions()
            .update_status(session_id, status, Some(reason))
            .await
        {
            Ok(()) => {
                if let Some(entry) = self.inner.write().await.get_mut(session_id) {
                    entry.session.status = status;
                }
                metrics::record_session_rotation(reason);
                info!(
                    session_id = %session_id,
                    status = %status,
                    reason = reason,
                    "Session status changed"
                );
            }
            Err(DatabaseError::InvalidTransition { from, to }) => {
                debug!(
                    session_id = %session_id,
                    from = %from,
                    to = %to,
                    "Skipped superseded status transition"
                );
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to persist status change");
            }
        }
    }

    /// One health-loop tick: reload, demote per the classifier, stamp the
    /// scan, and refresh gauges.
    pub async fn run_health_check(&self) -> DatabaseResult<()> {
        self.reload().await?;
        let now = Utc::now();

        let mut demotions = Vec::new();
        let mut scanned = Vec::new();
        {
            let inner = self.inner.read().await;
            for entry in inner.values() {
                if entry.session.status == SessionStatus::Revoked {
                    continue;
                }
                scanned.push(entry.session.id.clone());

                let effective = classify(&entry.session, &self.config, now);
                if effective != entry.session.status {
                    demotions.push((
                        entry.session.id.clone(),
                        effective,
                        rotation_reason(&entry.session, &self.config, now),
                    ));
                }
            }
        }

        for (id, status, reason) in &demotions {
            self.apply_status(id, *status, reason).await;
        }

        if let Err(e) = self
            .database
            .sessions()
            .mark_health_checked_many(&scanned)
            .await
        {
            warn!(error = %e, "Failed to stamp health check scan");
        }

        let stats = self.stats().await;
        metrics::update_session_gauges(&stats);
        if !demotions.is_empty() {
            info!(
                rotated = demotions.len(),
                healthy = stats.healthy,
                quarantined = stats.quarantined,
                expired = stats.expired,
                "Health check rotated sessions"
            );
        }
        Ok(())
    }

    /// Pure read over the projection; backs `/health` and operator tooling.
    pub async fn stats(&self) -> PoolStats {
        let now = Utc::now();
        let inner = self.inner.read().await;

        let mut stats = PoolStats {
            total: inner.len(),
            healthy: 0,
            quarantined: 0,
            expired: 0,
            revoked: 0,
            in_flight: 0,
            avg_failure_rate: 0.0,
        };
        let mut rate_sum = 0.0;
        for entry in inner.values() {
            match classify(&entry.session, &self.config, now) {
                SessionStatus::Healthy => stats.healthy += 1,
                SessionStatus::Quarantined => stats.quarantined += 1,
                SessionStatus::Expired => stats.expired += 1,
                SessionStatus::Revoked => stats.revoked += 1,
            }
            stats.in_flight += entry.leases as usize;
            rate_sum += entry.session.failure_rate();
        }
        if !inner.is_empty() {
            stats.avg_failure_rate = rate_sum / inner.len() as f64;
        }
        stats
    }

    /// Admin: register a new cookie session.
    pub async fn create_session(
        &self,
        cookie_text: &str,
        provider: &str,
        expires_at: Option<DateTime<Utc>>,
        metadata: serde_json::Value,
    ) -> DatabaseResult<sessions::Model> {
        let session = self
            .database
            .sessions()
            .insert(cookie_text, provider, expires_at, metadata)
            .await?;
        self.inner
            .write()
            .await
            .insert(session.id.clone(), PoolEntry::new(session.clone()));
        info!(session_id = %session.id, provider = %provider, "Session created");
        Ok(session)
    }

    /// Admin: quarantine a session. Idempotent.
    pub async fn quarantine(&self, session_id: &str, reason: &str) -> DatabaseResult<()> {
        self.admin_transition(session_id, SessionStatus::Quarantined, reason)
            .await
    }

    /// Admin: revoke a session permanently.
    pub async fn revoke(&self, session_id: &str, reason: &str) -> DatabaseResult<()> {
        self.admin_transition(session_id, SessionStatus::Revoked, reason)
            .await
    }

    /// Admin: re-promote a quarantined session to healthy. This is the only
    /// path back from quarantine; the health loop never re-promotes.
    pub async fn activate(&self, session_id: &str) -> DatabaseResult<()> {
        self.admin_transition(session_id, SessionStatus::Healthy, "manual")
            .await
    }

    async fn admin_transition(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: &str,
    ) -> DatabaseResult<()> {
        self.database
            .sessions()
            .update_status(session_id, status, Some(reason))
            .await?;
        if let Some(entry) = self.inner.write().await.get_mut(session_id) {
            entry.session.status = status;
            entry.consecutive_auth_failures = 0;
            entry.consecutive_anti_bot = 0;
        }
        metrics::record_session_rotation("manual");
        Ok(())
    }

    pub async fn list_sessions(
        &self,
        filter: &SessionFilter,
    ) -> DatabaseResult<Vec<sessions::Model>> {
        with_retry(|| async { self.database.sessions().list(filter).await }).await
    }

    pub async fn get_session(&self, session_id: &str) -> DatabaseResult<Option<sessions::Model>> {
        self.database.sessions().get(session_id).await
    }
}

#[async_trait::async_trait]
impl crate::health::HealthChecker for SessionPool {
    fn name(&self) -> &str {
        "session_pool"
    }

    async fn check(&self) -> crate::health::HealthCheckResult {
        let stats = self.stats().await;
        let details = serde_json::json!({
            "total": stats.total,
            "healthy": stats.healthy,
            "quarantined": stats.quarantined,
            "expired": stats.expired,
            "revoked": stats.revoked,
            "in_flight": stats.in_flight,
        });

        if stats.total == 0 {
            crate::health::HealthCheckResult::degraded_with_details(
                "session pool is empty".to_string(),
                details,
            )
        } else if stats.healthy == 0 {
            crate::health::HealthCheckResult::unhealthy_with_details(
                "no healthy sessions in pool".to_string(),
                details,
            )
        } else {
            crate::health::HealthCheckResult::healthy_with_details(details)
        }
    }
}
