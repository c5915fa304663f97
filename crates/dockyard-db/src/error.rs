//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<DbError> for dockyard_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => dockyard_core::Error::NotFound(what),
            DbError::Conflict(what) => dockyard_core::Error::Conflict(what),
            other => dockyard_core::Error::Store(other.to_string()),
        }
    }
}
