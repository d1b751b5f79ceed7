//! Append engine: factual and atomic appends.
//!
//! Both flavors funnel into one `append_event` call. A factual append
//! sends the never-matching predicate so the database skips the race
//! check; an atomic append sends the selector's predicate bytes and its
//! `after` position packed as the previous event id. Idempotency keys
//! turn replays and certain conflicts back into the original success.

use sqlx::postgres::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use evently_core::{sql, AppendEvent, DomainError, EventId, Ledger, Selector, LEDGER_ENTITY};

use crate::error::{from_sqlx, StoreError, StoreResult};
use crate::registry::Registry;
use crate::row::EventRow;
use crate::source::SelectorSource;

/// A committed append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendReceipt {
    pub event_id: EventId,
    pub idempotency_key: String,
}

/// What an append attempt produced.
///
/// A lost race is an outcome, not an error: the caller decides how to
/// surface it (the HTTP layer answers 409 with the advanced selector).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Success(AppendReceipt),
    Race { message: String },
}

pub struct EventStore<S> {
    pool: PgPool,
    registry: Arc<Registry<S>>,
}

impl<S: SelectorSource> EventStore<S> {
    pub fn new(pool: PgPool, registry: Arc<Registry<S>>) -> Self {
        Self { pool, registry }
    }

    /// Unconditional append.
    pub async fn append_factual(
        &self,
        ledger: &Ledger,
        event: &AppendEvent,
    ) -> StoreResult<AppendOutcome> {
        self.validate(ledger, event).await?;
        raw_append(&self.pool, ledger, event, None).await
    }

    /// Append conditioned on a selector: commits iff no matching event
    /// exists after the selector's `after` at the moment of commit.
    pub async fn append_atomic(
        &self,
        ledger: &Ledger,
        event: &AppendEvent,
        selector: &Selector,
    ) -> StoreResult<AppendOutcome> {
        let selector = selector.clone().canonicalize()?;
        if !selector.is_filter() {
            return Err(StoreError::bad_request(
                "atomic append requires a filter selector",
            ));
        }
        if let Some(after) = selector.after() {
            if after.ledger() != ledger.id {
                return Err(StoreError::bad_request(format!(
                    "'after' {after} does not belong to ledger {}",
                    ledger.id
                )));
            }
        }
        self.validate(ledger, event).await?;
        raw_append(&self.pool, ledger, event, Some(&selector)).await
    }

    // Invariant: an append succeeds only if the event type is registered
    // and every entity the event names is listed for that type.
    async fn validate(&self, ledger: &Ledger, event: &AppendEvent) -> StoreResult<()> {
        if event.entities.keys().any(|name| name == LEDGER_ENTITY) {
            return Err(DomainError::ReservedEntity(LEDGER_ENTITY.into()).into());
        }
        let registered = self
            .registry
            .get_event(ledger, &event.event)
            .await
            .map_err(|err| match err {
                StoreError::NotFound(_) => StoreError::unprocessable(format!(
                    "Event {:?} is not registered for this ledger; register it at /REGISTER",
                    event.event
                )),
                other => other,
            })?;
        for name in event.entities.keys() {
            if !registered.entities.iter().any(|e| e == name) {
                return Err(StoreError::unprocessable(format!(
                    "Entity {name:?} is not registered for event {:?}; update its registration at /REGISTER",
                    event.event
                )));
            }
        }
        Ok(())
    }
}

/// The single `append_event` call, shared with registry marker writes
/// (which bypass validation by definition).
pub(crate) async fn raw_append(
    pool: &PgPool,
    ledger: &Ledger,
    event: &AppendEvent,
    condition: Option<&Selector>,
) -> StoreResult<AppendOutcome> {
    let after = condition.and_then(Selector::after);
    let previous = EventId::new(
        after.map(|a| a.timestamp()).unwrap_or(0),
        after.map(|a| a.checksum()).unwrap_or(0),
        ledger.id,
    );
    let previous = Uuid::from_bytes(previous.to_bytes());

    let append_key = event
        .idempotency_key
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let predicate: Vec<u8> = match condition {
        Some(selector) => sql::predicate_bytes(selector),
        None => sql::MATCH_NONE.as_bytes().to_vec(),
    };
    let entities = serde_json::to_value(&event.entities)
        .map_err(|e| StoreError::internal("append_event", e))?;

    let result = sqlx::query_scalar::<_, Uuid>(
        "SELECT append_event($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(previous)
    .bind(&event.event)
    .bind(entities)
    .bind(event.meta_value())
    .bind(event.data_value())
    .bind(&append_key)
    .bind(&predicate)
    .fetch_one(pool)
    .await;

    match result {
        Ok(uuid) => Ok(AppendOutcome::Success(AppendReceipt {
            event_id: EventId::from_bytes(*uuid.as_bytes()),
            idempotency_key: append_key,
        })),
        Err(sqlx::Error::Database(db)) => {
            let message = db.message().to_string();
            let is_key_conflict = db.code().as_deref() == Some("23505")
                && db
                    .constraint()
                    .is_some_and(|c| c.ends_with("_append_key_key"));

            if message.starts_with("RACE CONDITION") {
                if event.idempotency_key.is_some() {
                    if let Some(receipt) = idempotent_replay(pool, ledger, event, &append_key).await? {
                        return Ok(AppendOutcome::Success(receipt));
                    }
                }
                return Ok(AppendOutcome::Race {
                    message: "another event matching the selector was appended first".to_string(),
                });
            }
            if is_key_conflict {
                if let Some(receipt) = idempotent_replay(pool, ledger, event, &append_key).await? {
                    return Ok(AppendOutcome::Success(receipt));
                }
                return Err(StoreError::unprocessable(
                    "idempotency key was already used for a different event",
                ));
            }
            if message.contains("previous can only be genesis for first event") {
                return Err(StoreError::bad_request(
                    "Ledger already has events; reset it at /RESET to start over",
                ));
            }
            if message.contains("previous_id must exist in the ledger") {
                return Err(StoreError::bad_request("Previous Event ID not found"));
            }
            if let Some(rest) = message.strip_prefix("AFTER not found") {
                return Err(StoreError::bad_request(format!(
                    "'after' value not found{rest}"
                )));
            }
            Err(StoreError::internal("append_event", message))
        }
        Err(other) => Err(from_sqlx("append_event", other)),
    }
}

// A prior event under the same key that deeply equals the input turns the
// conflict into the original success; any difference is unprocessable.
async fn idempotent_replay(
    pool: &PgPool,
    ledger: &Ledger,
    event: &AppendEvent,
    append_key: &str,
) -> StoreResult<Option<AppendReceipt>> {
    let row: Option<EventRow> = sqlx::query_as(
        "SELECT timestamp, checksum, event, entities, meta, data \
         FROM find_with_append_key($1, $2)",
    )
    .bind(ledger.id.to_string())
    .bind(append_key)
    .fetch_optional(pool)
    .await
    .map_err(|e| from_sqlx("find_with_append_key", e))?;

    let Some(row) = row else {
        return Ok(None);
    };
    let stored = row.into_event(ledger.id)?;
    if replay_matches(&stored, event) {
        Ok(Some(AppendReceipt {
            event_id: stored.event_id,
            idempotency_key: append_key.to_string(),
        }))
    } else {
        Err(StoreError::unprocessable(
            "Event does not match the event originally appended with idempotencyKey",
        ))
    }
}

// Deep equality over (event, entities, meta, data); JSON objects compare
// key-order-independently.
fn replay_matches(stored: &evently_core::PersistedEvent, input: &AppendEvent) -> bool {
    stored.event == input.event
        && stored.entities == input.entities
        && stored.meta == input.meta_value()
        && stored.data == input.data_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{SelectorResult, SelectorSource};
    use chrono::Utc;
    use evently_core::{EntityMap, LedgerId, PersistedEvent};
    use serde_json::json;

    struct FakeSource {
        events: Vec<PersistedEvent>,
    }

    impl SelectorSource for FakeSource {
        fn select(
            &self,
            ledger: LedgerId,
            _selector: &Selector,
        ) -> impl core::future::Future<Output = StoreResult<SelectorResult>> + Send {
            let events = self.events.clone();
            async move {
                Ok(SelectorResult {
                    position: EventId::new(0, 0, ledger),
                    events: Box::pin(futures::stream::iter(events.into_iter().map(Ok))),
                })
            }
        }
    }

    fn ledger() -> Ledger {
        Ledger {
            id: LedgerId::from_u32(1),
            name: "test".into(),
            description: String::new(),
            genesis: EventId::new(1, 1, LedgerId::from_u32(1)),
        }
    }

    fn registration_marker(event: &str, entities: &[&str]) -> PersistedEvent {
        PersistedEvent {
            event_id: EventId::new(2, 1, LedgerId::from_u32(1)),
            timestamp: Utc::now(),
            event: evently_core::EVENT_REGISTERED.into(),
            entities: EntityMap::new(),
            meta: json!({}),
            data: json!({"event": event, "entities": entities}),
        }
    }

    fn store_with(markers: Vec<PersistedEvent>) -> EventStore<FakeSource> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        let registry = Arc::new(Registry::new(
            Arc::new(FakeSource { events: markers }),
            pool.clone(),
        ));
        EventStore::new(pool, registry)
    }

    fn order_event() -> AppendEvent {
        serde_json::from_value(json!({
            "event": "order-placed",
            "entities": {"order": ["o-1"]}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unregistered_event_is_unprocessable() {
        let store = store_with(vec![]);
        let err = store
            .append_factual(&ledger(), &order_event())
            .await
            .unwrap_err();
        let StoreError::Unprocessable(message) = err else {
            panic!("expected unprocessable");
        };
        assert!(message.contains("not registered"));
    }

    #[tokio::test]
    async fn unknown_entity_is_unprocessable() {
        let store = store_with(vec![registration_marker("order-placed", &["customer"])]);
        let err = store
            .append_factual(&ledger(), &order_event())
            .await
            .unwrap_err();
        let StoreError::Unprocessable(message) = err else {
            panic!("expected unprocessable");
        };
        assert!(message.contains("order"));
    }

    #[tokio::test]
    async fn reserved_entity_is_forbidden() {
        let store = store_with(vec![registration_marker("order-placed", &["order"])]);
        let mut event = order_event();
        event
            .entities
            .insert(LEDGER_ENTITY.to_string(), vec!["x".into()]);
        let err = store.append_factual(&ledger(), &event).await.unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn atomic_append_rejects_plain_selectors() {
        let store = store_with(vec![registration_marker("order-placed", &["order"])]);
        let err = store
            .append_atomic(&ledger(), &order_event(), &Selector::plain(None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)));
    }

    #[test]
    fn replay_comparison_is_key_order_independent() {
        let input: AppendEvent = serde_json::from_value(json!({
            "event": "order-placed",
            "entities": {"order": ["o-1"]},
            "meta": {"b": 2, "a": 1},
            "data": {"total": 42, "currency": "EUR"}
        }))
        .unwrap();
        let stored = evently_core::PersistedEvent {
            event_id: EventId::new(3, 3, LedgerId::from_u32(1)),
            timestamp: chrono::Utc::now(),
            event: "order-placed".into(),
            entities: serde_json::from_value(json!({"order": ["o-1"]})).unwrap(),
            meta: json!({"a": 1, "b": 2}),
            data: json!({"currency": "EUR", "total": 42}),
        };
        assert!(replay_matches(&stored, &input));

        let mut changed = input.clone();
        changed.data = Some(json!({"currency": "EUR", "total": 43}));
        assert!(!replay_matches(&stored, &changed));
    }

    #[tokio::test]
    async fn atomic_append_rejects_foreign_after() {
        let store = store_with(vec![registration_marker("order-placed", &["order"])]);
        let foreign: Selector = serde_json::from_value(json!({
            "entities": {"order": ["o-1"]},
            "after": EventId::new(5, 5, LedgerId::from_u32(2)).to_string()
        }))
        .unwrap();
        let err = store
            .append_atomic(&ledger(), &order_event(), &foreign)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)));
    }
}
