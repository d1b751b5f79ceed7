//! Upstream append feed: LISTEN `ALL_EVENTS` → in-process fan-out.
//!
//! The database emits one notification per committed append, CSV-framed:
//!
//! ```text
//! ledgerId,timestamp,checksum,event,entities[,meta[,data]]
//! ```
//!
//! Fields are bare or single-quoted with SQL-style doubled quotes; a field
//! prefixed `E'…'` additionally needs a backslash un-escape pass. When the
//! payload would exceed the database's notification size limit, `meta`
//! and/or `data` are omitted and fetched with `fetch_missing_data`. This
//! framing is a wire contract of its own; keep the parser and the database
//! trigger in lockstep.

use std::sync::Arc;

use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use evently_core::{EntityMap, EventId, LedgerId, PersistedEvent};

use evently_notify::EventSink;

use crate::error::{from_sqlx, StoreError, StoreResult};

/// Notification channel the database raises for every append.
pub const ALL_EVENTS_CHANNEL: &str = "ALL_EVENTS";

/// The single upstream listener.
///
/// One LISTEN serves every channel and SSE stream in the process; commit
/// order on the channel is delivery order here.
pub struct EventFeed {
    handle: JoinHandle<()>,
}

impl EventFeed {
    /// Spawn the listen loop, delivering each parsed event to `sink`.
    pub async fn spawn(pool: PgPool, sink: Arc<dyn EventSink>) -> StoreResult<Self> {
        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(|e| from_sqlx("listen", e))?;
        listener
            .listen(ALL_EVENTS_CHANNEL)
            .await
            .map_err(|e| from_sqlx("listen", e))?;
        info!(channel = ALL_EVENTS_CHANNEL, "event feed listening");

        let handle = tokio::spawn(async move {
            loop {
                // recv() transparently reconnects; notifications raised
                // while disconnected are lost, which subscribers already
                // tolerate (no catch-up contract).
                let notification = match listener.recv().await {
                    Ok(notification) => notification,
                    Err(err) => {
                        warn!("event feed receive failed: {err}");
                        continue;
                    }
                };
                let event = match parse_notification(notification.payload()) {
                    Ok(wire) => wire.into_event(&pool).await,
                    Err(err) => {
                        warn!("discarding malformed notification: {err}");
                        continue;
                    }
                };
                match event {
                    Ok(event) => sink.deliver(&event),
                    Err(err) => warn!("discarding notification: {err}"),
                }
            }
        });
        Ok(Self { handle })
    }

    /// Stop listening; fan-out halts immediately.
    pub fn unlisten(&self) {
        self.handle.abort();
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct WireEvent {
    pub ledger: LedgerId,
    pub timestamp: u64,
    pub checksum: u32,
    pub event: String,
    pub entities: EntityMap,
    pub meta: Option<Value>,
    pub data: Option<Value>,
}

impl WireEvent {
    /// Complete the event, fetching payloads the notification had to omit.
    pub(crate) async fn into_event(self, pool: &PgPool) -> StoreResult<PersistedEvent> {
        let event_id = EventId::new(self.timestamp, self.checksum, self.ledger);
        let timestamp = chrono::DateTime::from_timestamp_micros(self.timestamp as i64)
            .ok_or_else(|| StoreError::internal("notification", "timestamp out of range"))?;

        let (meta, data) = match (self.meta, self.data) {
            (Some(meta), Some(data)) => (meta, data),
            (meta, _) => {
                let need_meta = meta.is_none();
                let row: (Option<Value>, Option<Value>) = sqlx::query_as(
                    "SELECT meta, data FROM fetch_missing_data($1, $2, $3)",
                )
                .bind(self.ledger.to_string())
                .bind(self.timestamp as i64)
                .bind(need_meta)
                .fetch_one(pool)
                .await
                .map_err(|e| from_sqlx("fetch_missing_data", e))?;
                (
                    meta.or(row.0).unwrap_or(Value::Null),
                    row.1.unwrap_or(Value::Null),
                )
            }
        };

        Ok(PersistedEvent {
            event_id,
            timestamp,
            event: self.event,
            entities: self.entities,
            meta,
            data,
        })
    }
}

pub(crate) fn parse_notification(payload: &str) -> StoreResult<WireEvent> {
    let mut fields = split_csv(payload)?;
    if fields.len() < 5 {
        return Err(StoreError::bad_request(format!(
            "notification has {} fields, expected at least 5",
            fields.len()
        )));
    }
    let data = if fields.len() > 6 { fields.pop() } else { None };
    let meta = if fields.len() > 5 { fields.pop() } else { None };

    let entities_raw = fields.pop().expect("entities field");
    let event = fields.pop().expect("event field");
    let checksum: u32 = fields
        .pop()
        .expect("checksum field")
        .parse()
        .map_err(|e| StoreError::bad_request(format!("notification checksum: {e}")))?;
    let timestamp: u64 = fields
        .pop()
        .expect("timestamp field")
        .parse()
        .map_err(|e| StoreError::bad_request(format!("notification timestamp: {e}")))?;
    let ledger: LedgerId = fields
        .pop()
        .expect("ledger field")
        .parse()
        .map_err(StoreError::from)?;

    let entities: EntityMap = serde_json::from_str(&entities_raw)
        .map_err(|e| StoreError::bad_request(format!("notification entities: {e}")))?;
    let parse_json = |raw: String, field: &str| -> StoreResult<Value> {
        serde_json::from_str(&raw)
            .map_err(|e| StoreError::bad_request(format!("notification {field}: {e}")))
    };

    Ok(WireEvent {
        ledger,
        timestamp,
        checksum,
        event,
        entities,
        meta: meta.map(|raw| parse_json(raw, "meta")).transpose()?,
        data: data.map(|raw| parse_json(raw, "data")).transpose()?,
    })
}

// Split the CSV frame. Quoted fields keep embedded commas; `''` collapses
// to a literal quote; `E'…'` fields get the backslash pass.
fn split_csv(payload: &str) -> StoreResult<Vec<String>> {
    let mut fields = Vec::new();
    let mut chars = payload.chars().peekable();

    loop {
        let escaped = if chars.peek() == Some(&'E') {
            let mut lookahead = chars.clone();
            lookahead.next();
            if lookahead.peek() == Some(&'\'') {
                chars = lookahead;
                true
            } else {
                false
            }
        } else {
            false
        };

        let field = if chars.peek() == Some(&'\'') {
            chars.next();
            let mut out = String::new();
            loop {
                match chars.next() {
                    None => {
                        return Err(StoreError::bad_request("unterminated quoted field"));
                    }
                    Some('\'') => {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            out.push('\'');
                        } else {
                            break;
                        }
                    }
                    Some(c) => out.push(c),
                }
            }
            if escaped { unescape_backslashes(&out) } else { out }
        } else {
            let mut out = String::new();
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                out.push(c);
                chars.next();
            }
            out
        };
        fields.push(field);

        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(c) => {
                return Err(StoreError::bad_request(format!(
                    "expected ',' after field, found {c:?}"
                )));
            }
        }
    }
    Ok(fields)
}

fn unescape_backslashes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_fields_parse() {
        let wire = parse_notification(
            "000000ff,1700000000000000,7,order-placed,'{\"order\":[\"o-1\"]}'",
        )
        .unwrap();
        assert_eq!(wire.ledger, LedgerId::from_u32(0xff));
        assert_eq!(wire.timestamp, 1_700_000_000_000_000);
        assert_eq!(wire.checksum, 7);
        assert_eq!(wire.event, "order-placed");
        assert_eq!(wire.entities.get("order").unwrap(), &vec!["o-1".to_string()]);
        assert_eq!(wire.meta, None);
        assert_eq!(wire.data, None);
    }

    #[test]
    fn quoted_fields_keep_commas_and_doubled_quotes() {
        let wire = parse_notification(
            "000000ff,1,2,note,'{}','{\"text\":\"a,b\"}','{\"who\":\"o''brien\"}'",
        )
        .unwrap();
        assert_eq!(wire.meta, Some(json!({"text": "a,b"})));
        assert_eq!(wire.data, Some(json!({"who": "o'brien"})));
    }

    #[test]
    fn e_prefixed_fields_get_a_backslash_pass() {
        // On the wire: E'{"path":"a\\\\b"}', the E'' doubling over the JSON
        // escape. One pass here, one by the JSON parser.
        let wire = parse_notification(
            "000000ff,1,2,note,'{}',E'{\"path\":\"a\\\\\\\\b\"}'",
        )
        .unwrap();
        assert_eq!(wire.meta, Some(json!({"path": "a\\b"})));
    }

    #[test]
    fn meta_only_frame_leaves_data_missing() {
        let wire =
            parse_notification("000000ff,1,2,big-event,'{}','{\"source\":\"batch\"}'").unwrap();
        assert_eq!(wire.meta, Some(json!({"source": "batch"})));
        assert_eq!(wire.data, None);
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(parse_notification("000000ff,1,2,order-placed").is_err());
        assert!(parse_notification("").is_err());
    }

    #[test]
    fn malformed_numbers_and_ledgers_are_rejected() {
        assert!(parse_notification("zz,1,2,e,'{}'").is_err());
        assert!(parse_notification("000000ff,abc,2,e,'{}'").is_err());
        assert!(parse_notification("000000ff,1,-2,e,'{}'").is_err());
    }

    #[test]
    fn unterminated_quotes_are_rejected() {
        assert!(parse_notification("000000ff,1,2,e,'{\"a\":1}").is_err());
    }

    #[test]
    fn bare_e_field_is_not_treated_as_escaped() {
        let wire = parse_notification("000000ff,1,2,Evented,'{}'").unwrap();
        assert_eq!(wire.event, "Evented");
    }
}
