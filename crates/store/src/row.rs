//! Row decoding for selector procedures.

use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;

use evently_core::{EntityMap, EventId, LedgerId, PersistedEvent};

use crate::error::{StoreError, StoreResult};

/// One row from `run_selector` / `fetch_selected`.
///
/// The first row of a `run_selector` result is a header carrying only
/// `(timestamp, checksum)`, the ledger position the query read through;
/// its `event` column is NULL.
#[derive(Debug)]
pub(crate) struct EventRow {
    pub timestamp: i64,
    pub checksum: i64,
    pub event: Option<String>,
    pub entities: Option<Value>,
    pub meta: Option<Value>,
    pub data: Option<Value>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            timestamp: row.try_get("timestamp")?,
            checksum: row.try_get("checksum")?,
            event: row.try_get("event")?,
            entities: row.try_get("entities")?,
            meta: row.try_get("meta")?,
            data: row.try_get("data")?,
        })
    }
}

impl EventRow {
    pub fn position(&self, ledger: LedgerId) -> EventId {
        EventId::new(self.timestamp as u64, self.checksum as u32, ledger)
    }

    pub fn into_event(self, ledger: LedgerId) -> StoreResult<PersistedEvent> {
        let event_id = self.position(ledger);
        let timestamp = chrono::DateTime::from_timestamp_micros(self.timestamp)
            .ok_or_else(|| StoreError::internal("row_decode", "timestamp out of range"))?;
        let event = self
            .event
            .ok_or_else(|| StoreError::internal("row_decode", "event row without a name"))?;
        let entities: EntityMap = match self.entities {
            Some(value) => serde_json::from_value(value)
                .map_err(|e| StoreError::internal("row_decode", format!("entities: {e}")))?,
            None => EntityMap::new(),
        };
        Ok(PersistedEvent {
            event_id,
            timestamp,
            event,
            entities,
            meta: self.meta.unwrap_or(Value::Null),
            data: self.data.unwrap_or(Value::Null),
        })
    }
}
