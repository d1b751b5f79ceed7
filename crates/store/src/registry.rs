//! Registry of permitted event types, derived from marker events.
//!
//! There is no registry table. The registry for a ledger is the fold of
//! the `EVENT_REGISTERED` / `EVENT_UNREGISTERED` markers stored in the
//! ledger itself: an event type is registered iff its last marker says so.
//! Reads replay the markers through the selector engine behind a short
//! single-flight cache; writes append a new marker and drop the cache
//! entry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::postgres::PgPool;

use evently_core::{
    AppendEvent, DomainError, EntityMap, FilterSelector, JsonPathFilter, Ledger, LedgerId,
    PersistedEvent, Selector, EVENT_REGISTERED, EVENT_UNREGISTERED, LEDGER_ENTITY,
};

use crate::append::raw_append;
use crate::cache::SingleFlightCache;
use crate::error::{StoreError, StoreResult};
use crate::source::SelectorSource;

const CACHE_CAPACITY: usize = 1_000;
const CACHE_TTL: Duration = Duration::from_secs(10);

/// A registered event type and the entities its events may reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventType {
    pub event: String,
    pub entities: Vec<String>,
}

/// Payload of a registration marker's `data`.
#[derive(Debug, Serialize, Deserialize)]
struct RegistrationData {
    event: String,
    #[serde(default)]
    entities: Vec<String>,
}

pub struct Registry<S> {
    source: Arc<S>,
    pool: PgPool,
    cache: SingleFlightCache<LedgerId, Arc<Vec<EventType>>>,
}

impl<S: SelectorSource> Registry<S> {
    pub fn new(source: Arc<S>, pool: PgPool) -> Self {
        Self {
            source,
            pool,
            cache: SingleFlightCache::new(CACHE_CAPACITY, CACHE_TTL),
        }
    }

    /// All registered event types, sorted by name.
    pub async fn all_events(&self, ledger: &Ledger) -> StoreResult<Arc<Vec<EventType>>> {
        let ledger_id = ledger.id;
        let source = Arc::clone(&self.source);
        self.cache
            .get_or_try_init(ledger_id, || async move {
                let result = source.select(ledger_id, &marker_selector()).await?;
                let markers: Vec<PersistedEvent> = result.events.try_collect().await?;
                Ok(Arc::new(fold_registry(&markers)))
            })
            .await
    }

    pub async fn get_event(&self, ledger: &Ledger, name: &str) -> StoreResult<EventType> {
        self.all_events(ledger)
            .await?
            .iter()
            .find(|et| et.event == name)
            .cloned()
            .ok_or(StoreError::NotFound("event type"))
    }

    /// All entity names any registered event may reference, sorted.
    pub async fn entities(&self, ledger: &Ledger) -> StoreResult<Vec<String>> {
        let mut names: Vec<String> = self
            .all_events(ledger)
            .await?
            .iter()
            .flat_map(|et| et.entities.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub async fn events_for_entity(
        &self,
        ledger: &Ledger,
        entity: &str,
    ) -> StoreResult<Vec<EventType>> {
        let matching: Vec<EventType> = self
            .all_events(ledger)
            .await?
            .iter()
            .filter(|et| et.entities.iter().any(|e| e == entity))
            .cloned()
            .collect();
        if matching.is_empty() {
            return Err(StoreError::NotFound("entity"));
        }
        Ok(matching)
    }

    /// Register an event type, or update its entity list.
    ///
    /// Re-registering with an order-independent equal entity set is a
    /// no-op and appends nothing.
    pub async fn register_event_type(
        &self,
        ledger: &Ledger,
        name: &str,
        entities: &[String],
    ) -> StoreResult<EventType> {
        if entities.iter().any(|e| e == LEDGER_ENTITY) {
            return Err(DomainError::ReservedEntity(LEDGER_ENTITY.into()).into());
        }
        let mut normalized: Vec<String> = entities.to_vec();
        normalized.sort();
        normalized.dedup();

        let current = self.all_events(ledger).await?;
        if let Some(existing) = current.iter().find(|et| et.event == name) {
            if existing.entities == normalized {
                return Ok(existing.clone());
            }
        }

        let registered = EventType {
            event: name.to_string(),
            entities: normalized,
        };
        self.append_marker(ledger, EVENT_REGISTERED, &registered)
            .await?;
        self.cache.invalidate(&ledger.id);
        Ok(registered)
    }

    pub async fn delete_event(&self, ledger: &Ledger, name: &str) -> StoreResult<()> {
        let existing = self.get_event(ledger, name).await?;
        self.append_marker(ledger, EVENT_UNREGISTERED, &existing)
            .await?;
        self.cache.invalidate(&ledger.id);
        Ok(())
    }

    pub fn invalidate(&self, ledger: LedgerId) {
        self.cache.invalidate(&ledger);
    }

    // Markers bypass registry validation: the registry is defined by them.
    async fn append_marker(
        &self,
        ledger: &Ledger,
        marker: &'static str,
        event_type: &EventType,
    ) -> StoreResult<()> {
        let event = AppendEvent {
            event: marker.to_string(),
            entities: EntityMap::from([(
                LEDGER_ENTITY.to_string(),
                vec![ledger.id.to_string()],
            )]),
            meta: None,
            data: Some(json!({
                "event": event_type.event,
                "entities": event_type.entities,
            })),
            idempotency_key: None,
        };
        raw_append(&self.pool, ledger, &event, None).await?;
        Ok(())
    }
}

/// Selector matching exactly the two registry marker event types.
fn marker_selector() -> Selector {
    let mut events = BTreeMap::new();
    events.insert(EVENT_REGISTERED.to_string(), JsonPathFilter::new("$"));
    events.insert(EVENT_UNREGISTERED.to_string(), JsonPathFilter::new("$"));
    Selector::Filter(FilterSelector {
        events,
        ..Default::default()
    })
}

/// Fold markers in ledger order into the registered set.
pub fn fold_registry(markers: &[PersistedEvent]) -> Vec<EventType> {
    let mut registered: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for marker in markers {
        let Ok(data) = serde_json::from_value::<RegistrationData>(marker.data.clone()) else {
            continue;
        };
        match marker.event.as_str() {
            EVENT_REGISTERED => {
                let mut entities = data.entities;
                entities.sort();
                entities.dedup();
                registered.insert(data.event, entities);
            }
            EVENT_UNREGISTERED => {
                registered.remove(&data.event);
            }
            _ => {}
        }
    }
    registered
        .into_iter()
        .map(|(event, entities)| EventType { event, entities })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use evently_core::EventId;

    fn marker(seq: u64, kind: &str, event: &str, entities: &[&str]) -> PersistedEvent {
        PersistedEvent {
            event_id: EventId::new(seq, 0, LedgerId::from_u32(1)),
            timestamp: Utc::now(),
            event: kind.to_string(),
            entities: EntityMap::from([(
                LEDGER_ENTITY.to_string(),
                vec!["00000001".to_string()],
            )]),
            meta: json!({}),
            data: json!({"event": event, "entities": entities}),
        }
    }

    #[test]
    fn fold_keeps_the_last_marker_per_event_type() {
        let history = vec![
            marker(1, EVENT_REGISTERED, "A", &["x"]),
            marker(2, EVENT_REGISTERED, "B", &["y"]),
            marker(3, EVENT_UNREGISTERED, "A", &[]),
        ];
        assert_eq!(
            fold_registry(&history),
            vec![EventType {
                event: "B".into(),
                entities: vec!["y".into()]
            }]
        );
    }

    #[test]
    fn re_registration_overwrites_the_entity_list() {
        let history = vec![
            marker(1, EVENT_REGISTERED, "A", &["x"]),
            marker(2, EVENT_REGISTERED, "A", &["y", "x"]),
        ];
        assert_eq!(
            fold_registry(&history),
            vec![EventType {
                event: "A".into(),
                entities: vec!["x".into(), "y".into()]
            }]
        );
    }

    #[test]
    fn registering_after_unregistering_revives_the_event_type() {
        let history = vec![
            marker(1, EVENT_REGISTERED, "A", &["x"]),
            marker(2, EVENT_UNREGISTERED, "A", &[]),
            marker(3, EVENT_REGISTERED, "A", &["z"]),
        ];
        assert_eq!(
            fold_registry(&history),
            vec![EventType {
                event: "A".into(),
                entities: vec!["z".into()]
            }]
        );
    }

    #[test]
    fn unknown_markers_are_ignored() {
        let history = vec![
            marker(1, "something-else", "A", &["x"]),
            marker(2, EVENT_REGISTERED, "B", &["y"]),
        ];
        assert_eq!(fold_registry(&history).len(), 1);
    }

    struct FakeSource {
        events: Vec<PersistedEvent>,
    }

    impl crate::source::SelectorSource for FakeSource {
        fn select(
            &self,
            ledger: LedgerId,
            _selector: &Selector,
        ) -> impl core::future::Future<Output = crate::error::StoreResult<crate::source::SelectorResult>>
               + Send {
            let events = self.events.clone();
            async move {
                Ok(crate::source::SelectorResult {
                    position: evently_core::EventId::new(0, 0, ledger),
                    events: Box::pin(futures::stream::iter(events.into_iter().map(Ok))),
                })
            }
        }
    }

    fn registry_with(markers: Vec<PersistedEvent>) -> Registry<FakeSource> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool");
        Registry::new(Arc::new(FakeSource { events: markers }), pool)
    }

    fn test_ledger() -> Ledger {
        Ledger {
            id: LedgerId::from_u32(1),
            name: "test".into(),
            description: String::new(),
            genesis: evently_core::EventId::new(1, 1, LedgerId::from_u32(1)),
        }
    }

    #[tokio::test]
    async fn reserved_entity_cannot_be_registered() {
        let registry = registry_with(vec![]);
        let err = registry
            .register_event_type(&test_ledger(), "order-placed", &[LEDGER_ENTITY.to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Forbidden(_)));
    }

    #[tokio::test]
    async fn identical_re_registration_appends_nothing() {
        // The lazy pool would fail on any marker append; a no-op must
        // never reach the database.
        let registry = registry_with(vec![marker(1, EVENT_REGISTERED, "A", &["y", "x"])]);
        let registered = registry
            .register_event_type(&test_ledger(), "A", &["x".into(), "y".into()])
            .await
            .unwrap();
        assert_eq!(registered.entities, vec!["x".to_string(), "y".to_string()]);
    }

    #[tokio::test]
    async fn read_views_derive_from_the_fold() {
        let registry = registry_with(vec![
            marker(1, EVENT_REGISTERED, "A", &["x", "shared"]),
            marker(2, EVENT_REGISTERED, "B", &["shared"]),
        ]);
        let ledger = test_ledger();

        let entities = registry.entities(&ledger).await.unwrap();
        assert_eq!(entities, vec!["shared".to_string(), "x".to_string()]);

        let for_shared = registry.events_for_entity(&ledger, "shared").await.unwrap();
        assert_eq!(for_shared.len(), 2);

        assert!(matches!(
            registry.events_for_entity(&ledger, "nope").await,
            Err(StoreError::NotFound("entity"))
        ));
        assert!(matches!(
            registry.get_event(&ledger, "C").await,
            Err(StoreError::NotFound("event type"))
        ));
    }

    #[test]
    fn marker_selector_names_both_marker_events() {
        let Selector::Filter(filter) = marker_selector() else {
            panic!("expected filter selector");
        };
        assert!(filter.events.contains_key(EVENT_REGISTERED));
        assert!(filter.events.contains_key(EVENT_UNREGISTERED));
    }
}
