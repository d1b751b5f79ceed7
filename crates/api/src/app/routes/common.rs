//! Helpers shared by the route handlers.

use evently_core::{codec, Ledger, Selector};

use crate::app::errors::ApiError;
use crate::app::services::AppState;
use crate::context::AuthContext;

/// Resolve the ledger the bearer token is scoped to.
pub async fn current_ledger(state: &AppState, ctx: &AuthContext) -> Result<Ledger, ApiError> {
    let id = ctx.ledger_id()?;
    state
        .ledgers
        .for_ledger_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found("ledger"))
}

/// Decode a `:select.ndjson` path segment.
pub fn parse_select_param(param: &str) -> Result<Selector, ApiError> {
    let token = param
        .strip_suffix(".ndjson")
        .ok_or_else(|| ApiError::not_found("selector"))?;
    Ok(codec::decode(token)?)
}

/// The quoted ETag for a selector position.
pub fn position_etag(position: evently_core::EventId) -> String {
    format!("\"{position}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use evently_core::{EventId, LedgerId};

    #[test]
    fn select_param_requires_the_ndjson_suffix() {
        assert!(parse_select_param("gA").is_err());
        assert!(parse_select_param("gA.ndjson").is_ok());
    }

    #[test]
    fn etag_is_the_hex_position_in_quotes() {
        let position = EventId::new(1, 2, LedgerId::from_u32(3));
        assert_eq!(position_etag(position), format!("\"{position}\""));
        assert!(position_etag(position).starts_with('"'));
    }
}
