//! Request context derived from the bearer token.

use axum::http::StatusCode;

use evently_auth::{Action, Claims};
use evently_core::LedgerId;

use crate::app::errors::ApiError;

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub claims: Claims,
}

impl AuthContext {
    pub fn new(claims: Claims) -> Self {
        Self { claims }
    }

    /// Deny unless some granted role allows the action.
    pub fn require(&self, action: Action) -> Result<(), ApiError> {
        if self.claims.allows(action) {
            return Ok(());
        }
        Err(ApiError::forbidden(
            "granted roles do not allow this operation",
        ))
    }

    /// The ledger this token is scoped to.
    pub fn ledger_id(&self) -> Result<LedgerId, ApiError> {
        let Some(ledger) = &self.claims.ledger else {
            return Err(ApiError::forbidden("token is not scoped to a ledger"));
        };
        ledger
            .parse()
            .map_err(|_| ApiError::new(StatusCode::FORBIDDEN, "token ledger claim is malformed"))
    }
}
