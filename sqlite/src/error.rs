//! Error types for the SQLite backend.
//!
//! Wraps the mapping core's [`OrmError`] together with database, I/O and
//! configuration failures.

use relata_core::{EntityKey, OrmError};
use thiserror::Error;

/// Errors that can occur while talking to SQLite through a context.
#[derive(Debug, Error)]
pub enum SqliteError {
    /// SQLite database operation failure.
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    /// Schema inference, translation or mapping failure.
    #[error(transparent)]
    Orm(#[from] OrmError),

    /// Configuration file could not be read or written.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Configuration file could not be parsed or serialized.
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// A row expected to exist was not found.
    #[error("{entity} with key {key} not found")]
    EntityNotFound { entity: String, key: EntityKey },

    /// A statement produced a result of the wrong shape.
    #[error("unexpected result: {0}")]
    UnexpectedResult(String),
}

/// Convenience alias for results with [`SqliteError`].
pub type Result<T> = std::result::Result<T, SqliteError>;
