//! Persistence gateway with domain-specific DAOs
//!
//! Each domain (sessions, generations, token usage) has its own DAO for
//! focused operations. Counter updates are single-statement and atomic at
//! the row level.

use sea_orm::{ConnectOptions, DatabaseConnection};
use std::time::Duration;
use thiserror::Error;

pub mod dao;
pub mod entities;
pub mod migration;

pub use dao::{GenerationsDao, SessionFilter, SessionsDao, TokenUsageDao};

/// Database error types
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Record not found")]
    NotFound,
    #[error("Duplicate record: {0}")]
    Duplicate(String),
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Database unavailable: {0}")]
    Unavailable(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Retry a persistence operation at most twice on connectivity loss.
///
/// Anything other than [`DatabaseError::Unavailable`] is returned as-is;
/// exhausted retries surface the final unavailability so the caller can
/// degrade to its in-memory view.
pub async fn with_retry<T, Fut>(mut op: impl FnMut() -> Fut) -> DatabaseResult<T>
where
    Fut: std::future::Future<Output = DatabaseResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(DatabaseError::Unavailable(msg)) if attempt < 2 => {
                attempt += 1;
                tracing::warn!(
                    "Database unavailable ({}), retry {}/2 after backoff",
                    msg,
                    attempt
                );
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            other => return other,
        }
    }
}

/// Database connection manager
pub struct DatabaseManager {
    pub connection: DatabaseConnection,
}

impl DatabaseManager {
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    pub async fn new_from_config(
        config: &crate::config::DatabaseConfig,
    ) -> Result<Self, DatabaseError> {
        let mut options = ConnectOptions::new(&config.url);
        options
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .connect_timeout(Duration::from_secs(10))
            .sqlx_logging(false);

        let connection = sea_orm::Database::connect(options)
            .await
            .map_err(|e| DatabaseError::Unavailable(e.to_string()))?;
        Ok(Self::new(connection))
    }

    /// Run database migrations
    pub async fn migrate(&self) -> DatabaseResult<()> {
        use crate::database::migration::Migrator;
        use sea_orm_migration::MigratorTrait;

        tracing::info!("Running database migrations");

        Migrator::up(&self.connection, None)
            .await
            .map_err(|e| DatabaseError::Migration(format!("Failed to run migrations: {}", e)))?;

        tracing::info!("Successfully completed all migrations");
        Ok(())
    }

    /// Health check for database connection
    pub async fn health_check(&self) -> DatabaseResult<()> {
        use crate::database::entities::sessions;
        use sea_orm::{EntityTrait, PaginatorTrait};

        let _count = sessions::Entity::find()
            .count(&self.connection)
            .await
            .map_err(|e| DatabaseError::Database(e.to_string()))?;
        Ok(())
    }

    /// Get sessions DAO
    pub fn sessions(&self) -> SessionsDao {
        SessionsDao::new(self.connection.clone())
    }

    /// Get generations DAO
    pub fn generations(&self) -> GenerationsDao {
        GenerationsDao::new(self.connection.clone())
    }

    /// Get token usage DAO
    pub fn token_usage(&self) -> TokenUsageDao {
        TokenUsageDao::new(self.connection.clone())
    }
}

#[async_trait::async_trait]
impl crate::health::HealthChecker for DatabaseManager {
    fn name(&self) -> &str {
        "database"
    }

    async fn check(&self) -> crate::health::HealthCheckResult {
        match self.health_check().await {
            Ok(()) => crate::health::HealthCheckResult::healthy(),
            Err(e) => crate::health::HealthCheckResult::unhealthy(e.to_string()),
        }
    }
}
