//! Ledger identity and metadata.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DomainError;
use crate::event_id::EventId;

/// Identifier of a ledger (tenant-scoped append-only log).
///
/// The wire form is exactly eight lowercase hex characters; internally it
/// is the 32-bit value packed into the low word of every [`EventId`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LedgerId(u32);

impl LedgerId {
    pub fn from_u32(value: u32) -> Self {
        Self(value)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl FromStr for LedgerId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DomainError::invalid_id(format!(
                "LedgerId: expected 8 hex characters, got {s:?}"
            )));
        }
        let value = u32::from_str_radix(s, 16)
            .map_err(|e| DomainError::invalid_id(format!("LedgerId: {e}")))?;
        Ok(Self(value))
    }
}

impl Serialize for LedgerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LedgerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Ledger metadata.
///
/// Created by the database; immutable except for reset and remove.
/// `genesis` is the id of the ledger's first (creation) event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub id: LedgerId,
    pub name: String,
    pub description: String,
    pub genesis: EventId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_id_round_trips_through_hex() {
        let id = LedgerId::from_u32(0x00ab_cdef);
        assert_eq!(id.to_string(), "00abcdef");
        assert_eq!("00abcdef".parse::<LedgerId>().unwrap(), id);
    }

    #[test]
    fn ledger_id_rejects_wrong_length_and_non_hex() {
        assert!("abcdef".parse::<LedgerId>().is_err());
        assert!("00abcdefx".parse::<LedgerId>().is_err());
        assert!("zzzzzzzz".parse::<LedgerId>().is_err());
    }
}
