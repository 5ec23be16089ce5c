mod generations;
mod sessions;
mod token_usage;

pub use generations::GenerationsDao;
pub use sessions::{SessionFilter, SessionsDao};
pub use token_usage::TokenUsageDao;

use crate::database::DatabaseError;
use sea_orm::{DbErr, SqlErr};

/// Map a sea-orm error onto the gateway taxonomy. Connection-level failures
/// become `Unavailable` so callers can apply the bounded retry policy;
/// unique violations become `Duplicate`.
pub(crate) fn map_db_err(e: DbErr) -> DatabaseError {
    if let Some(SqlErr::UniqueConstraintViolation(msg)) = e.sql_err() {
        return DatabaseError::Duplicate(msg);
    }
    match e {
        DbErr::Conn(err) => DatabaseError::Unavailable(err.to_string()),
        DbErr::ConnectionAcquire(err) => DatabaseError::Unavailable(err.to_string()),
        DbErr::RecordNotFound(_) => DatabaseError::NotFound,
        other => DatabaseError::Database(other.to_string()),
    }
}
