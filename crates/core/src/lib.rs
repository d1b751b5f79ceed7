//! Core domain: identifiers, event records, selectors and their codecs.

pub mod codec;
pub mod error;
pub mod event;
pub mod event_id;
pub mod jsonpath;
pub mod ledger;
pub mod selector;
pub mod sql;

pub use error::{DomainError, DomainResult};
pub use event::{
    AppendEvent, EntityMap, PersistedEvent, EVENT_REGISTERED, EVENT_UNREGISTERED, GENESIS_EVENT,
    LEDGER_ENTITY,
};
pub use event_id::EventId;
pub use jsonpath::JsonPath;
pub use ledger::{Ledger, LedgerId};
pub use selector::{FilterSelector, JsonPathFilter, PlainSelector, Selector};
