//! Store error taxonomy.
//!
//! Everything a database interaction can throw is folded into the small
//! set of client-facing kinds the HTTP layer maps to status codes.
//! Unclassified failures are logged in full here and surfaced only as an
//! opaque `ref#` correlation id.

use thiserror::Error;
use uuid::Uuid;

use evently_core::DomainError;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Malformed input: bad tokens, bad event ids, selector SQL the
    /// database rejected, unknown `after` positions.
    #[error("{0}")]
    BadRequest(String),

    /// The request was understood but is not permitted.
    #[error("{0}")]
    Forbidden(String),

    /// Ledger, event type or event unknown.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Valid request that the current ledger state rejects.
    #[error("{0}")]
    Unprocessable(String),

    /// The database refused the connection.
    #[error("datastore unavailable")]
    Unavailable,

    /// Service misconfiguration (environment, connection options).
    #[error("configuration error: {0}")]
    Config(String),

    /// Anything unclassified; the full cause is in the log under this id.
    #[error("internal error {reference}")]
    Internal { reference: String },
}

impl StoreError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self::Unprocessable(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Log the cause with a fresh correlation id and return the opaque form.
    pub fn internal(operation: &str, cause: impl core::fmt::Display) -> Self {
        let reference = format!("ref#{}", Uuid::new_v4().simple());
        tracing::error!(%reference, operation, "store failure: {cause}");
        Self::Internal { reference }
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::ReservedEntity(_) => Self::Forbidden(err.to_string()),
            other => Self::BadRequest(other.to_string()),
        }
    }
}

/// Map a sqlx failure that no caller classified first.
pub fn from_sqlx(operation: &str, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            if let Some(code) = db.code() {
                // 42601 syntax error: a selector produced SQL the
                // database could not parse.
                if code.as_ref() == "42601" {
                    return StoreError::bad_request("selector produced an invalid predicate");
                }
            }
            if let Some(rest) = message.strip_prefix("AFTER not found") {
                return StoreError::bad_request(format!("'after' value not found{rest}"));
            }
            StoreError::internal(operation, &err)
        }
        sqlx::Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            StoreError::Unavailable
        }
        sqlx::Error::PoolTimedOut => StoreError::Unavailable,
        _ => StoreError::internal(operation, &err),
    }
}
