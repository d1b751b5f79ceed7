//! Bearer claims model (transport-agnostic).
//!
//! The token is the base64url encoding of a JSON claims document. It is
//! not signed; treat it as claims-from-an-issuer that an upstream gateway
//! has already verified. Decoding is strict about shape (unknown roles and
//! non-JSON payloads are rejected) but tolerant about base64 padding.

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::roles::{allows, Action, Role};

/// Claims carried by a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Ledger the token is scoped to, when the granted roles need one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ledger: Option<String>,

    /// RBAC roles granted by the issuer.
    pub roles: Vec<Role>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClaimsError {
    #[error("token is not base64url")]
    NotBase64,

    #[error("token payload is not a claims document: {0}")]
    Malformed(String),
}

impl Claims {
    /// Decode the bearer token into claims.
    pub fn decode(token: &str) -> Result<Self, ClaimsError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .or_else(|_| URL_SAFE.decode(token))
            .map_err(|_| ClaimsError::NotBase64)?;
        serde_json::from_slice(&bytes).map_err(|e| ClaimsError::Malformed(e.to_string()))
    }

    /// Encode claims into a bearer token (tests and tooling).
    pub fn encode(&self) -> String {
        let payload = serde_json::to_vec(self).expect("claims serialize");
        URL_SAFE_NO_PAD.encode(payload)
    }

    pub fn allows(&self, action: Action) -> bool {
        allows(&self.roles, action)
    }
}
