//! Bit-exact event identifier.
//!
//! An event id is a 16-byte tuple packed big-endian: 8-byte timestamp
//! (epoch microseconds), 4-byte checksum, 4-byte ledger id. The string
//! form is 32 lowercase hex characters. Within one ledger, ids are
//! totally ordered by `(timestamp, checksum)`.

use core::cmp::Ordering;
use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DomainError;
use crate::ledger::LedgerId;

pub const EVENT_ID_BYTES: usize = 16;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EventId {
    timestamp: u64,
    checksum: u32,
    ledger: LedgerId,
}

impl EventId {
    pub fn new(timestamp: u64, checksum: u32, ledger: LedgerId) -> Self {
        Self {
            timestamp,
            checksum,
            ledger,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn ledger(&self) -> LedgerId {
        self.ledger
    }

    pub fn to_bytes(&self) -> [u8; EVENT_ID_BYTES] {
        let mut out = [0u8; EVENT_ID_BYTES];
        out[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.checksum.to_be_bytes());
        out[12..].copy_from_slice(&self.ledger.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; EVENT_ID_BYTES]) -> Self {
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[..8]);
        let mut chk = [0u8; 4];
        chk.copy_from_slice(&bytes[8..12]);
        let mut ledger = [0u8; 4];
        ledger.copy_from_slice(&bytes[12..]);
        Self {
            timestamp: u64::from_be_bytes(ts),
            checksum: u32::from_be_bytes(chk),
            ledger: LedgerId::from_be_bytes(ledger),
        }
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:08x}{}",
            self.timestamp, self.checksum, self.ledger
        )
    }
}

impl FromStr for EventId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DomainError::invalid_id(format!(
                "EventId: expected 32 hex characters, got {s:?}"
            )));
        }
        let timestamp = u64::from_str_radix(&s[..16], 16)
            .map_err(|e| DomainError::invalid_id(format!("EventId: {e}")))?;
        let checksum = u32::from_str_radix(&s[16..24], 16)
            .map_err(|e| DomainError::invalid_id(format!("EventId: {e}")))?;
        let ledger = s[24..].parse::<LedgerId>()?;
        Ok(Self {
            timestamp,
            checksum,
            ledger,
        })
    }
}

// Ordering within a ledger is by timestamp, then checksum; the ledger id
// participates last only to keep `Ord` total and consistent with `Eq`.
impl Ord for EventId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.checksum.cmp(&other.checksum))
            .then(self.ledger.cmp(&other.ledger))
    }
}

impl PartialOrd for EventId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}
