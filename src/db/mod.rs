pub mod repository;
pub mod sqlite;

pub use repository::*;
pub use sqlite::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    /// A UNIQUE index rejected a write. Under concurrent reconciliation this
    /// means another writer claimed the identity first; callers treat it as
    /// a retry signal, not a failure.
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Invalid enum value for {field}: {value}")]
    InvalidEnum { field: String, value: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                let text = msg.unwrap_or_else(|| err.to_string());
                if text.contains("UNIQUE constraint failed") {
                    DatabaseError::UniqueViolation(text)
                } else {
                    DatabaseError::ConstraintViolation(text)
                }
            }
            other => DatabaseError::Sqlite(other),
        }
    }
}

impl DatabaseError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, DatabaseError::UniqueViolation(_))
    }
}
