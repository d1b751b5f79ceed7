//! Seam between the upstream append feed and the channel registry.
//!
//! The store crate owns the database LISTEN loop; this trait is what it
//! delivers into, so the notification machinery stays database-free and
//! tests can drive it directly.

use evently_core::PersistedEvent;

use crate::channels::NotifyCenter;

/// Receives every newly appended event, in commit order.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &PersistedEvent);
}

impl EventSink for NotifyCenter {
    fn deliver(&self, event: &PersistedEvent) {
        NotifyCenter::deliver(self, event);
    }
}

impl<S: EventSink + ?Sized> EventSink for std::sync::Arc<S> {
    fn deliver(&self, event: &PersistedEvent) {
        (**self).deliver(event);
    }
}
