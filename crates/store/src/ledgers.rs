//! Ledger administration and metadata lookups.
//!
//! A ledger's name and description live in its genesis marker event, so
//! resolving a ledger id replays a one-event bounded selector. Lookups sit
//! behind a short single-flight cache invalidated on create and remove.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde::Deserialize;
use sqlx::postgres::PgPool;

use evently_core::{
    EventId, FilterSelector, JsonPathFilter, Ledger, LedgerId, Selector, GENESIS_EVENT,
};

use crate::cache::SingleFlightCache;
use crate::error::{from_sqlx, StoreError, StoreResult};
use crate::source::SelectorSource;

const CACHE_CAPACITY: usize = 1_000;
const CACHE_TTL: Duration = Duration::from_secs(5);

/// Name and description as recorded in the genesis event's data.
#[derive(Debug, Deserialize)]
struct GenesisData {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
}

pub struct Ledgers<S> {
    source: Arc<S>,
    pool: PgPool,
    cache: SingleFlightCache<LedgerId, Option<Ledger>>,
}

impl<S: SelectorSource> Ledgers<S> {
    pub fn new(source: Arc<S>, pool: PgPool) -> Self {
        Self {
            source,
            pool,
            cache: SingleFlightCache::new(CACHE_CAPACITY, CACHE_TTL),
        }
    }

    /// Create a ledger, or resolve an existing one with the same name.
    pub async fn create(&self, name: &str, description: &str) -> StoreResult<Ledger> {
        let id: Option<String> = sqlx::query_scalar("SELECT create_ledger($1, $2)")
            .bind(name)
            .bind(description)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                    StoreError::forbidden(format!("a ledger named {name:?} already exists"))
                }
                _ => from_sqlx("create_ledger", e),
            })?;
        let id: LedgerId = id
            .ok_or_else(|| {
                StoreError::forbidden(format!(
                    "a ledger named {name:?} already exists and could not be resolved"
                ))
            })?
            .parse()
            .map_err(StoreError::from)?;

        self.cache.invalidate(&id);
        self.for_ledger_id(id).await?.ok_or_else(|| {
            StoreError::internal("create_ledger", format!("created ledger {id} did not resolve"))
        })
    }

    /// Resolve a ledger id to its metadata; absent when it cannot be read.
    pub async fn for_ledger_id(&self, id: LedgerId) -> StoreResult<Option<Ledger>> {
        let source = Arc::clone(&self.source);
        self.cache
            .get_or_try_init(id, || async move {
                let result = source.select(id, &genesis_selector()).await?;
                let events: Vec<_> = match result.events.try_collect().await {
                    Ok(events) => events,
                    Err(_) => return Ok(None),
                };
                let Some(genesis) = events.into_iter().next() else {
                    return Ok(None);
                };
                let data: GenesisData =
                    serde_json::from_value(genesis.data.clone()).unwrap_or(GenesisData {
                        name: String::new(),
                        description: String::new(),
                    });
                Ok(Some(Ledger {
                    id,
                    name: data.name,
                    description: data.description,
                    genesis: genesis.event_id,
                }))
            })
            .await
    }

    /// Trim all events after `after`, or back to genesis when absent.
    pub async fn reset(&self, ledger: &Ledger, after: Option<EventId>) -> StoreResult<()> {
        if let Some(after) = after {
            if after.ledger() != ledger.id {
                return Err(StoreError::bad_request(format!(
                    "'after' {after} does not belong to ledger {}",
                    ledger.id
                )));
            }
            let exists: bool = sqlx::query_scalar("SELECT after_exists($1, $2, $3)")
                .bind(ledger.id.to_string())
                .bind(after.timestamp() as i64)
                .bind(i64::from(after.checksum()))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| from_sqlx("after_exists", e))?;
            if !exists {
                return Err(StoreError::bad_request(format!(
                    "'after' value not found: {after}"
                )));
            }
        }
        let position = after.unwrap_or(ledger.genesis);
        sqlx::query("SELECT reset_ledger_events($1, $2, $3)")
            .bind(ledger.id.to_string())
            .bind(position.timestamp() as i64)
            .bind(i64::from(position.checksum()))
            .execute(&self.pool)
            .await
            .map_err(|e| from_sqlx("reset_ledger_events", e))?;
        Ok(())
    }

    pub async fn remove(&self, ledger: &Ledger) -> StoreResult<()> {
        sqlx::query("SELECT remove_ledger($1)")
            .bind(ledger.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| from_sqlx("remove_ledger", e))?;
        self.cache.invalidate(&ledger.id);
        Ok(())
    }

    pub async fn event_count(&self, ledger: &Ledger) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT ledger_event_count($1)")
            .bind(ledger.id.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| from_sqlx("ledger_event_count", e))?;
        Ok(count as u64)
    }
}

// Genesis marker read: one event, filtered by the marker's name.
fn genesis_selector() -> Selector {
    let mut events = BTreeMap::new();
    events.insert(GENESIS_EVENT.to_string(), JsonPathFilter::new("$"));
    Selector::Filter(FilterSelector {
        limit: Some(1),
        events,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SelectorResult;
    use chrono::Utc;
    use evently_core::{EntityMap, PersistedEvent};
    use serde_json::json;

    struct FakeSource {
        events: Vec<PersistedEvent>,
    }

    impl SelectorSource for FakeSource {
        fn select(
            &self,
            ledger: LedgerId,
            selector: &Selector,
        ) -> impl core::future::Future<Output = StoreResult<SelectorResult>> + Send {
            let limit = selector.limit().unwrap_or(0) as usize;
            let mut events = self.events.clone();
            if limit > 0 {
                events.truncate(limit);
            }
            async move {
                Ok(SelectorResult {
                    position: EventId::new(0, 0, ledger),
                    events: Box::pin(futures::stream::iter(events.into_iter().map(Ok))),
                })
            }
        }
    }

    fn ledgers_with(events: Vec<PersistedEvent>) -> Ledgers<FakeSource> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        Ledgers::new(Arc::new(FakeSource { events }), pool)
    }

    fn genesis_event(id: LedgerId) -> PersistedEvent {
        PersistedEvent {
            event_id: EventId::new(1, 42, id),
            timestamp: Utc::now(),
            event: GENESIS_EVENT.into(),
            entities: EntityMap::new(),
            meta: json!({}),
            data: json!({"name": "orders", "description": "order history"}),
        }
    }

    #[tokio::test]
    async fn genesis_event_resolves_ledger_metadata() {
        let id = LedgerId::from_u32(9);
        let ledgers = ledgers_with(vec![genesis_event(id)]);
        let ledger = ledgers.for_ledger_id(id).await.unwrap().unwrap();
        assert_eq!(ledger.name, "orders");
        assert_eq!(ledger.description, "order history");
        assert_eq!(ledger.genesis, EventId::new(1, 42, id));
    }

    #[tokio::test]
    async fn missing_genesis_resolves_to_absent() {
        let ledgers = ledgers_with(vec![]);
        assert_eq!(ledgers.for_ledger_id(LedgerId::from_u32(9)).await.unwrap(), None);
    }

    #[test]
    fn genesis_selector_is_bounded_to_one_event() {
        assert_eq!(genesis_selector().limit(), Some(1));
    }
}
