//! Infrastructure wiring: database pool, components, upstream feed.

use std::sync::Arc;

use evently_notify::{EventSink, NotifyCenter};
use evently_store::{
    DbConfig, EventFeed, EventStore, Ledgers, PgEventSource, Registry, StoreResult,
};

/// Shared per-request state.
#[derive(Clone)]
pub struct AppState {
    pub ledgers: Arc<Ledgers<PgEventSource>>,
    pub registry: Arc<Registry<PgEventSource>>,
    pub source: Arc<PgEventSource>,
    pub store: Arc<EventStore<PgEventSource>>,
    pub notify: Arc<NotifyCenter>,
}

/// Connect to the database and wire every component.
///
/// The returned feed is already listening; the caller owns registering
/// its `unlisten` as a shutdown hook.
pub async fn build_services() -> StoreResult<(AppState, EventFeed)> {
    let pool = DbConfig::from_env()?.connect().await?;

    let source = Arc::new(PgEventSource::new(pool.clone()));
    let registry = Arc::new(Registry::new(Arc::clone(&source), pool.clone()));
    let ledgers = Arc::new(Ledgers::new(Arc::clone(&source), pool.clone()));
    let store = Arc::new(EventStore::new(pool.clone(), Arc::clone(&registry)));
    let notify = Arc::new(NotifyCenter::new());

    let sink: Arc<dyn EventSink> = Arc::clone(&notify) as Arc<dyn EventSink>;
    let feed = EventFeed::spawn(pool, sink).await?;

    let state = AppState {
        ledgers,
        registry,
        source,
        store,
        notify,
    };
    Ok((state, feed))
}
