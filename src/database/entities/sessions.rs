use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One cookie-backed pool member.
///
/// Counters are monotonic; `success_count + failure_count <= usage_count`
/// holds because every release increments usage exactly once. The cookie
/// hash deduplicates sessions per provider.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub cookie_text: String,
    pub cookie_hash: String,
    pub provider: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub status: SessionStatus,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub metadata: Json,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn failure_rate(&self) -> f64 {
        if self.usage_count == 0 {
            return 0.0;
        }
        self.failure_count as f64 / self.usage_count as f64
    }

    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_seconds() as f64 / 3600.0
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[sea_orm(string_value = "healthy")]
    Healthy,
    #[sea_orm(string_value = "quarantined")]
    Quarantined,
    #[sea_orm(string_value = "expired")]
    Expired,
    #[sea_orm(string_value = "revoked")]
    Revoked,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Healthy => "healthy",
            SessionStatus::Quarantined => "quarantined",
            SessionStatus::Expired => "expired",
            SessionStatus::Revoked => "revoked",
        }
    }

    /// Permitted transitions. Revoked is terminal; re-promotion
    /// `quarantined -> healthy` is reserved for explicit operator action.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Revoked, _) => false,
            (_, Revoked) => true,
            (Healthy, Quarantined) => true,
            (Healthy, Expired) | (Quarantined, Expired) => true,
            (Quarantined, Healthy) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable hash of the cookie material, used for per-provider deduplication.
pub fn hash_cookie(cookie_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cookie_text.as_bytes());
    format!("{:x}", hasher.finalize())
}
