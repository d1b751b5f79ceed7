//! Domain error model.
//!
//! Domain errors are deterministic failures of the data model itself:
//! malformed identifiers, malformed selector tokens, inputs that violate
//! the model's rules. Infrastructure failures (database, network) live in
//! the store layer's error type.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error (deterministic input/model failures).
///
/// Errors are `Clone` and `PartialEq` so tests can compare them and the
/// API layer can match on them when choosing a status code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A selector URI token or selector document could not be decoded.
    #[error("invalid URI part: {0}")]
    InvalidSelector(String),

    /// A JSONPath expression was rejected at input.
    #[error("invalid JSONPath: {0}")]
    InvalidPath(String),

    /// An event named an entity reserved for internal bookkeeping.
    #[error("entity name {0:?} is reserved")]
    ReservedEntity(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_selector(msg: impl Into<String>) -> Self {
        Self::InvalidSelector(msg.into())
    }

    pub fn invalid_path(msg: impl Into<String>) -> Self {
        Self::InvalidPath(msg.into())
    }
}
