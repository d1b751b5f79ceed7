//! Channel and subscription registry with SSE fan-out.
//!
//! Channels are process-local and die with the process; subscriptions are
//! keyed by the canonical selector token, which makes re-subscribing the
//! same selector idempotent. Open SSE streams are held only as mailbox
//! senders: a client that disconnects closes its receiver, and the dead
//! sender is pruned on the next delivery, so nothing leaks without an
//! explicit teardown call.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use evently_core::{codec, DomainError, LedgerId, PersistedEvent, Selector};

use crate::mailbox::{mailbox, MailboxSender, MailboxStream};
use crate::matcher::Matcher;

/// SSE event name for notification messages.
pub const SSE_EVENT: &str = "Subscriptions Triggered";

/// Reconnect delay advertised to SSE clients.
pub const SSE_RETRY_MS: u64 = 10_000;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl core::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for ChannelId {
    type Err = NotifyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| NotifyError::ChannelNotFound)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    fn fresh() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SubscriptionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One outbound SSE message: which subscriptions a new event triggered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    /// Event id (hex) of the triggering event.
    pub id: String,
    /// Matched subscription ids, comma-joined.
    pub data: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    #[error("channel not found")]
    ChannelNotFound,

    #[error("subscription not found")]
    SubscriptionNotFound,

    #[error("catch-up on reconnect is not supported; open a new stream without Last-Event-Id")]
    CatchUpUnsupported,

    #[error(transparent)]
    Selector(#[from] DomainError),
}

/// A subscription as reported to clients.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub selector: Selector,
}

struct Subscription {
    id: SubscriptionId,
    selector: Selector,
    matcher: Matcher,
}

#[derive(Default)]
struct Channel {
    /// Canonical selector token → subscription.
    filters: BTreeMap<String, Subscription>,
    streams: Vec<MailboxSender<SseMessage>>,
}

/// Everything the process knows about notification channels.
#[derive(Default)]
pub struct NotifyCenter {
    channels: Mutex<HashMap<(LedgerId, ChannelId), Channel>>,
}

impl NotifyCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, ledger: LedgerId) -> ChannelId {
        let id = ChannelId::fresh();
        self.channels
            .lock()
            .insert((ledger, id), Channel::default());
        id
    }

    pub fn channels(&self, ledger: LedgerId) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self
            .channels
            .lock()
            .keys()
            .filter(|(l, _)| *l == ledger)
            .map(|(_, c)| *c)
            .collect();
        ids.sort_by_key(|id| id.to_string());
        ids
    }

    /// Subscribe a selector; the same canonical selector yields the same id.
    pub fn subscribe(
        &self,
        ledger: LedgerId,
        channel: ChannelId,
        selector: Selector,
    ) -> Result<SubscriptionId, NotifyError> {
        let selector = selector.canonicalize()?.without_limit();
        let token = codec::encode(&selector)?;
        let matcher = Matcher::compile(&selector)?;

        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(&(ledger, channel))
            .ok_or(NotifyError::ChannelNotFound)?;
        let subscription = entry.filters.entry(token).or_insert_with(|| Subscription {
            id: SubscriptionId::fresh(),
            selector,
            matcher,
        });
        Ok(subscription.id.clone())
    }

    pub fn unsubscribe(
        &self,
        ledger: LedgerId,
        channel: ChannelId,
        subscription: &SubscriptionId,
    ) -> Result<(), NotifyError> {
        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(&(ledger, channel))
            .ok_or(NotifyError::ChannelNotFound)?;
        let before = entry.filters.len();
        entry.filters.retain(|_, sub| sub.id != *subscription);
        if entry.filters.len() == before {
            return Err(NotifyError::SubscriptionNotFound);
        }
        Ok(())
    }

    pub fn subscriptions(
        &self,
        ledger: LedgerId,
        channel: ChannelId,
    ) -> Result<Vec<SubscriptionInfo>, NotifyError> {
        let channels = self.channels.lock();
        let entry = channels
            .get(&(ledger, channel))
            .ok_or(NotifyError::ChannelNotFound)?;
        Ok(entry
            .filters
            .values()
            .map(|sub| SubscriptionInfo {
                id: sub.id.clone(),
                selector: sub.selector.clone(),
            })
            .collect())
    }

    pub fn subscription(
        &self,
        ledger: LedgerId,
        channel: ChannelId,
        subscription: &SubscriptionId,
    ) -> Result<SubscriptionInfo, NotifyError> {
        self.subscriptions(ledger, channel)?
            .into_iter()
            .find(|info| info.id == *subscription)
            .ok_or(NotifyError::SubscriptionNotFound)
    }

    /// Attach an SSE stream to the channel.
    ///
    /// `last_event_id` is rejected: there is no notification cache to
    /// replay from yet.
    pub fn open_event_stream(
        &self,
        ledger: LedgerId,
        channel: ChannelId,
        last_event_id: Option<&str>,
    ) -> Result<MailboxStream<SseMessage>, NotifyError> {
        if last_event_id.is_some() {
            return Err(NotifyError::CatchUpUnsupported);
        }
        let mut channels = self.channels.lock();
        let entry = channels
            .get_mut(&(ledger, channel))
            .ok_or(NotifyError::ChannelNotFound)?;
        let (tx, rx) = mailbox();
        entry.streams.push(tx);
        Ok(rx)
    }

    /// Close the channel: attached streams terminate, state is removed.
    pub fn close(&self, ledger: LedgerId, channel: ChannelId) -> Result<(), NotifyError> {
        self.channels
            .lock()
            .remove(&(ledger, channel))
            .map(|_| ())
            .ok_or(NotifyError::ChannelNotFound)
    }

    /// Close every channel (process shutdown); all SSE streams end.
    pub fn close_all(&self) {
        self.channels.lock().clear();
    }

    /// Fan an appended event out to every matching subscription.
    ///
    /// One message per channel carries all matched subscription ids; a
    /// channel with no match stays silent.
    pub fn deliver(&self, event: &PersistedEvent) {
        let ledger = event.event_id.ledger();
        let mut channels = self.channels.lock();
        for ((channel_ledger, _), channel) in channels.iter_mut() {
            if *channel_ledger != ledger {
                continue;
            }
            let matched: Vec<&str> = channel
                .filters
                .values()
                .filter(|sub| sub.matcher.matches(event))
                .map(|sub| sub.id.as_str())
                .collect();
            if matched.is_empty() {
                channel.streams.retain(|tx| !tx.is_closed());
                continue;
            }
            let message = SseMessage {
                id: event.event_id.to_string(),
                data: matched.join(","),
            };
            channel.streams.retain(|tx| tx.push(message.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use evently_core::EventId;
    use futures::StreamExt;
    use serde_json::json;

    fn ledger() -> LedgerId {
        LedgerId::from_u32(7)
    }

    fn order_event(key: &str) -> PersistedEvent {
        PersistedEvent {
            event_id: EventId::new(10, 1, ledger()),
            timestamp: Utc::now(),
            event: "order-placed".into(),
            entities: serde_json::from_value(json!({"order": [key]})).unwrap(),
            meta: json!({}),
            data: json!({}),
        }
    }

    fn order_selector() -> Selector {
        serde_json::from_value(json!({"entities": {"order": ["o-1"]}})).unwrap()
    }

    #[test]
    fn subscribe_is_idempotent_by_canonical_selector() {
        let center = NotifyCenter::new();
        let channel = center.open(ledger());
        let first = center.subscribe(ledger(), channel, order_selector()).unwrap();

        // Same selector with a limit: the stored form strips it.
        let with_limit: Selector =
            serde_json::from_value(json!({"entities": {"order": ["o-1"]}, "limit": 9})).unwrap();
        let second = center.subscribe(ledger(), channel, with_limit).unwrap();
        assert_eq!(first, second);

        let different: Selector =
            serde_json::from_value(json!({"entities": {"order": ["o-2"]}})).unwrap();
        let third = center.subscribe(ledger(), channel, different).unwrap();
        assert_ne!(first, third);
    }

    #[test]
    fn unsubscribe_removes_only_the_named_subscription() {
        let center = NotifyCenter::new();
        let channel = center.open(ledger());
        let id = center.subscribe(ledger(), channel, order_selector()).unwrap();
        center.unsubscribe(ledger(), channel, &id).unwrap();
        assert_eq!(
            center.unsubscribe(ledger(), channel, &id),
            Err(NotifyError::SubscriptionNotFound)
        );
        assert!(center.subscriptions(ledger(), channel).unwrap().is_empty());
    }

    #[tokio::test]
    async fn matching_event_triggers_one_message_with_the_subscription_id() {
        let center = NotifyCenter::new();
        let channel = center.open(ledger());
        let sub = center.subscribe(ledger(), channel, order_selector()).unwrap();
        let mut stream = center.open_event_stream(ledger(), channel, None).unwrap();

        center.deliver(&order_event("o-1"));
        let message = stream.next().await.unwrap();
        assert_eq!(message.data, sub.to_string());
        assert_eq!(message.id, order_event("o-1").event_id.to_string());
    }

    #[tokio::test]
    async fn non_matching_event_stays_silent() {
        let center = NotifyCenter::new();
        let channel = center.open(ledger());
        center.subscribe(ledger(), channel, order_selector()).unwrap();
        let mut stream = center.open_event_stream(ledger(), channel, None).unwrap();

        center.deliver(&order_event("o-9"));
        center.close(ledger(), channel).unwrap();
        // Stream ends without ever producing a message.
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn events_for_other_ledgers_are_not_delivered() {
        let center = NotifyCenter::new();
        let channel = center.open(ledger());
        center.subscribe(ledger(), channel, order_selector()).unwrap();
        let mut stream = center.open_event_stream(ledger(), channel, None).unwrap();

        let mut foreign = order_event("o-1");
        foreign.event_id = EventId::new(10, 1, LedgerId::from_u32(99));
        center.deliver(&foreign);
        center.close(ledger(), channel).unwrap();
        assert_eq!(stream.next().await, None);
    }

    #[test]
    fn last_event_id_is_rejected() {
        let center = NotifyCenter::new();
        let channel = center.open(ledger());
        assert_eq!(
            center
                .open_event_stream(ledger(), channel, Some("0001"))
                .err(),
            Some(NotifyError::CatchUpUnsupported)
        );
    }

    #[test]
    fn dropped_streams_are_pruned_on_delivery() {
        let center = NotifyCenter::new();
        let channel = center.open(ledger());
        center.subscribe(ledger(), channel, order_selector()).unwrap();
        let stream = center.open_event_stream(ledger(), channel, None).unwrap();
        drop(stream);

        center.deliver(&order_event("o-1"));
        let channels = center.channels.lock();
        let entry = channels.get(&(ledger(), channel)).unwrap();
        assert!(entry.streams.is_empty());
    }

    #[test]
    fn operations_on_unknown_channels_fail() {
        let center = NotifyCenter::new();
        let channel = ChannelId::fresh();
        assert_eq!(
            center.subscribe(ledger(), channel, order_selector()).err(),
            Some(NotifyError::ChannelNotFound)
        );
        assert_eq!(
            center.close(ledger(), channel).err(),
            Some(NotifyError::ChannelNotFound)
        );
    }
}
