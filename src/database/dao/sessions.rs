use crate::database::dao::map_db_err;
use crate::database::entities::sessions::{self, SessionStatus, hash_cookie};
use crate::database::{DatabaseError, DatabaseResult};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, NullOrdering};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, Order,
    QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

/// Filter for session listings.
#[derive(Debug, Default, Clone)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub provider: Option<String>,
}

/// Sessions DAO for database operations
pub struct SessionsDao {
    db: DatabaseConnection,
}

impl SessionsDao {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// List sessions ordered by `last_used_at` ascending with nulls first,
    /// supporting least-recently-used selection.
    pub async fn list(&self, filter: &SessionFilter) -> DatabaseResult<Vec<sessions::Model>> {
        let mut select = sessions::Entity::find();

        if let Some(status) = filter.status {
            select = select.filter(sessions::Column::Status.eq(status));
        }
        if let Some(ref provider) = filter.provider {
            select = select.filter(sessions::Column::Provider.eq(provider));
        }

        select
            .order_by_with_nulls(sessions::Column::LastUsedAt, Order::Asc, NullOrdering::First)
            .order_by_asc(sessions::Column::CreatedAt)
            .all(&self.db)
            .await
            .map_err(map_db_err)
    }

    pub async fn get(&self, id: &str) -> DatabaseResult<Option<sessions::Model>> {
        sessions::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(map_db_err)
    }

    /// Insert a new session. Fails with `Duplicate` when a session with the
    /// same (provider, cookie_hash) already exists.
    pub async fn insert(
        &self,
        cookie_text: &str,
        provider: &str,
        expires_at: Option<DateTime<Utc>>,
        metadata: serde_json::Value,
    ) -> DatabaseResult<sessions::Model> {
        let cookie_hash = hash_cookie(cookie_text);

        let existing = sessions::Entity::find()
            .filter(sessions::Column::Provider.eq(provider))
            .filter(sessions::Column::CookieHash.eq(&cookie_hash))
            .one(&self.db)
            .await
            .map_err(map_db_err)?;
        if existing.is_some() {
            return Err(DatabaseError::Duplicate(format!(
                "session with the same cookie already exists for provider {}",
                provider
            )));
        }

        let model = sessions::Model {
            id: Uuid::new_v4().to_string(),
            cookie_text: cookie_text.to_string(),
            cookie_hash,
            provider: provider.to_string(),
            created_at: Utc::now(),
            last_used_at: None,
            expires_at,
            usage_count: 0,
            success_count: 0,
            failure_count: 0,
            status: SessionStatus::Healthy,
            last_health_check_at: None,
            metadata,
        };

        // The unique (provider, cookie_hash) index catches concurrent inserts
        // that slipped past the pre-check.
        model
            .clone()
            .into_active_model()
            .insert(&self.db)
            .await
            .map_err(map_db_err)?;

        Ok(model)
    }

    /// Update a session's status, rejecting transitions outside the
    /// permitted set. Re-applying the current status is a no-op.
    pub async fn update_status(
        &self,
        id: &str,
        new_status: SessionStatus,
        reason: Option<&str>,
    ) -> DatabaseResult<()> {
        let current = self.get(id).await?.ok_or(DatabaseError::NotFound)?;

        if current.status == new_status {
            return Ok(());
        }
        if !current.status.can_transition_to(new_status) {
            return Err(DatabaseError::InvalidTransition {
                from: current.status.to_string(),
                to: new_status.to_string(),
            });
        }

        let mut active = current.into_active_model();
        active.status = Set(new_status);
        active.update(&self.db).await.map_err(map_db_err)?;

        tracing::info!(
            session_id = %id,
            status = %new_status,
            reason = reason.unwrap_or("unspecified"),
            "Session status updated"
        );
        Ok(())
    }

    /// Atomically bump usage counters and `last_used_at` in one statement,
    /// so concurrent releases on the same session never lose updates.
    pub async fn increment_usage(&self, id: &str, success: bool) -> DatabaseResult<()> {
        let mut update = sessions::Entity::update_many()
            .col_expr(
                sessions::Column::UsageCount,
                Expr::col(sessions::Column::UsageCount).add(1),
            )
            .col_expr(sessions::Column::LastUsedAt, Expr::value(Utc::now()));

        update = if success {
            update.col_expr(
                sessions::Column::SuccessCount,
                Expr::col(sessions::Column::SuccessCount).add(1),
            )
        } else {
            update.col_expr(
                sessions::Column::FailureCount,
                Expr::col(sessions::Column::FailureCount).add(1),
            )
        };

        let result = update
            .filter(sessions::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;

        if result.rows_affected == 0 {
            return Err(DatabaseError::NotFound);
        }
        Ok(())
    }

    pub async fn mark_health_checked(&self, id: &str) -> DatabaseResult<()> {
        let result = sessions::Entity::update_many()
            .col_expr(
                sessions::Column::LastHealthCheckAt,
                Expr::value(Utc::now()),
            )
            .filter(sessions::Column::Id.eq(id))
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;

        if result.rows_affected == 0 {
            return Err(DatabaseError::NotFound);
        }
        Ok(())
    }

    /// Stamp `last_health_check_at` for a whole scan in one statement.
    pub async fn mark_health_checked_many(&self, ids: &[String]) -> DatabaseResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sessions::Entity::update_many()
            .col_expr(
                sessions::Column::LastHealthCheckAt,
                Expr::value(Utc::now()),
            )
            .filter(sessions::Column::Id.is_in(ids.iter().map(String::as_str)))
            .exec(&self.db)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::setup_test_database;

    #[tokio::test]
    async fn test_insert_and_get() {
        let db = setup_test_database().await;
        let dao = db.sessions();

        let created = dao
            .insert("sso=abc", "grok", None, serde_json::json!({"source": "test"}))
            .await
            .unwrap();
        assert_eq!(created.status, SessionStatus::Healthy);
        assert_eq!(created.usage_count, 0);

        let fetched = dao.get(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.cookie_hash, created.cookie_hash);
        assert!(dao.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_duplicate_cookie_rejected() {
        let db = setup_test_database().await;
        let dao = db.sessions();

        dao.insert("sso=abc", "grok", None, serde_json::json!({}))
            .await
            .unwrap();
        let err = dao
            .insert("sso=abc", "grok", None, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Duplicate(_)));

        // Same cookie under a different provider is allowed
        dao.insert("sso=abc", "other", None, serde_json::json!({}))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_increment_usage_is_cumulative() {
        let db = setup_test_database().await;
        let dao = db.sessions();
        let session = dao
            .insert("sso=abc", "grok", None, serde_json::json!({}))
            .await
            .unwrap();

        dao.increment_usage(&session.id, true).await.unwrap();
        dao.increment_usage(&session.id, false).await.unwrap();
        dao.increment_usage(&session.id, true).await.unwrap();

        let updated = dao.get(&session.id).await.unwrap().unwrap();
        assert_eq!(updated.usage_count, 3);
        assert_eq!(updated.success_count, 2);
        assert_eq!(updated.failure_count, 1);
        assert!(updated.last_used_at.is_some());
        assert!(updated.success_count + updated.failure_count <= updated.usage_count);
    }

    #[tokio::test]
    async fn test_increment_usage_missing_session() {
        let db = setup_test_database().await;
        let err = db.sessions().increment_usage("nope", true).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound));
    }

    #[tokio::test]
    async fn test_update_status_transitions() {
        let db = setup_test_database().await;
        let dao = db.sessions();
        let session = dao
            .insert("sso=abc", "grok", None, serde_json::json!({}))
            .await
            .unwrap();

        dao.update_status(&session.id, SessionStatus::Quarantined, Some("auth failures"))
            .await
            .unwrap();
        // Idempotent: quarantining twice is a no-op
        dao.update_status(&session.id, SessionStatus::Quarantined, None)
            .await
            .unwrap();

        // Operator re-promotion is allowed
        dao.update_status(&session.id, SessionStatus::Healthy, Some("operator"))
            .await
            .unwrap();

        dao.update_status(&session.id, SessionStatus::Revoked, None)
            .await
            .unwrap();
        let err = dao
            .update_status(&session.id, SessionStatus::Healthy, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_expired_cannot_return_to_healthy() {
        let db = setup_test_database().await;
        let dao = db.sessions();
        let session = dao
            .insert("sso=abc", "grok", None, serde_json::json!({}))
            .await
            .unwrap();

        dao.update_status(&session.id, SessionStatus::Expired, Some("age limit"))
            .await
            .unwrap();
        let err = dao
            .update_status(&session.id, SessionStatus::Healthy, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_list_orders_by_last_used_nulls_first() {
        let db = setup_test_database().await;
        let dao = db.sessions();

        let a = dao
            .insert("sso=a", "grok", None, serde_json::json!({}))
            .await
            .unwrap();
        let b = dao
            .insert("sso=b", "grok", None, serde_json::json!({}))
            .await
            .unwrap();
        // Using `a` stamps its last_used_at, pushing it behind the unused `b`
        dao.increment_usage(&a.id, true).await.unwrap();

        let listed = dao.list(&SessionFilter::default()).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1].id, a.id);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let db = setup_test_database().await;
        let dao = db.sessions();

        let a = dao
            .insert("sso=a", "grok", None, serde_json::json!({}))
            .await
            .unwrap();
        dao.insert("sso=b", "other", None, serde_json::json!({}))
            .await
            .unwrap();
        dao.update_status(&a.id, SessionStatus::Quarantined, None)
            .await
            .unwrap();

        let quarantined = dao
            .list(&SessionFilter {
                status: Some(SessionStatus::Quarantined),
                provider: None,
            })
            .await
            .unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(quarantined[0].id, a.id);

        let grok_only = dao
            .list(&SessionFilter {
                status: None,
                provider: Some("other".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(grok_only.len(), 1);
        assert_eq!(grok_only[0].provider, "other");
    }

    #[tokio::test]
    async fn test_mark_health_checked() {
        let db = setup_test_database().await;
        let dao = db.sessions();
        let session = dao
            .insert("sso=abc", "grok", None, serde_json::json!({}))
            .await
            .unwrap();
        assert!(session.last_health_check_at.is_none());

        dao.mark_health_checked(&session.id).await.unwrap();
        let updated = dao.get(&session.id).await.unwrap().unwrap();
        assert!(updated.last_health_check_at.is_some());
    }
}
