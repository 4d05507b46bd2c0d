//! Error types for schema inference, query translation and object mapping.
//!
//! Every variant is fatal for the operation that raised it: schema errors
//! abort table construction, translation and mapping errors abort the query
//! without partial results. Nothing here is retried internally.

use thiserror::Error;

/// Errors raised by the mapping core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrmError {
    /// Entity definition cannot be turned into a table (missing or duplicate
    /// primary key, unresolvable relationship, non-complex root type).
    #[error("invalid entity schema: {0}")]
    InvalidEntitySchema(String),

    /// A column constraint was applied to a type it cannot describe.
    #[error("invalid attribute usage: {0}")]
    InvalidAttributeUsage(String),

    /// Query expression uses an operator with no SQL rendering.
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    /// Result rows or values could not be mapped onto the requested shape.
    #[error("object mapping error: {0}")]
    ObjectMappingError(String),

    /// The dialect has no type token for a semantic type.
    #[error("unknown type: {0}")]
    UnknownType(String),
}

impl OrmError {
    pub(crate) fn schema(message: impl Into<String>) -> Self {
        Self::InvalidEntitySchema(message.into())
    }

    pub(crate) fn mapping(message: impl Into<String>) -> Self {
        Self::ObjectMappingError(message.into())
    }
}

/// Convenience alias for results with [`OrmError`].
pub type Result<T> = std::result::Result<T, OrmError>;
