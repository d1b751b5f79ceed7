//! Event records: what clients append and what the store hands back.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event_id::EventId;

/// Entity tags on an event: entity name to the keys the event touches.
///
/// `BTreeMap` keeps the canonical (sorted) key order everywhere the map is
/// serialized, which the selector token and idempotency comparisons rely on.
pub type EntityMap = BTreeMap<String, Vec<String>>;

/// Marker event type recording an event-type registration.
pub const EVENT_REGISTERED: &str = "EVENT_REGISTERED";

/// Marker event type recording an event-type unregistration.
pub const EVENT_UNREGISTERED: &str = "EVENT_UNREGISTERED";

/// Reserved entity name that scopes registry markers to their ledger.
/// User events may not reference it.
pub const LEDGER_ENTITY: &str = "\u{1F4D2}"; // 📒

/// Event type of a ledger's genesis (creation) event.
pub const GENESIS_EVENT: &str = "\u{1F4D2}\u{120FB}"; // 📒𒃻

/// An event as returned from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEvent {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub entities: EntityMap,
    pub meta: Value,
    pub data: Value,
}

/// Client input for an append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendEvent {
    pub event: String,
    pub entities: EntityMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl AppendEvent {
    /// Meta payload as stored (absent means empty object).
    pub fn meta_value(&self) -> Value {
        self.meta.clone().unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// Data payload as stored (absent means empty object).
    pub fn data_value(&self) -> Value {
        self.data.clone().unwrap_or_else(|| Value::Object(Default::default()))
    }
}
