//! Notifications: selector matching, channels, SSE fan-out.

pub mod channels;
pub mod feed;
pub mod mailbox;
pub mod matcher;

pub use channels::{
    ChannelId, NotifyCenter, NotifyError, SseMessage, SubscriptionId, SubscriptionInfo, SSE_EVENT,
    SSE_RETRY_MS,
};
pub use feed::EventSink;
pub use mailbox::{mailbox, MailboxSender, MailboxStream};
pub use matcher::Matcher;
