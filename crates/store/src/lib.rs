//! Store layer: everything that talks to the database.
//!
//! The relational store owns the ledger tables and exposes stored
//! procedures for appending, selecting and listening; this crate mediates
//! every call to them and translates rows, errors and notifications into
//! the domain model.

pub mod append;
pub mod cache;
pub mod db;
pub mod error;
pub mod ledgers;
pub mod listener;
pub mod registry;
mod row;
pub mod source;

pub use append::{AppendOutcome, AppendReceipt, EventStore};
pub use db::DbConfig;
pub use error::{StoreError, StoreResult};
pub use ledgers::Ledgers;
pub use listener::{EventFeed, ALL_EVENTS_CHANNEL};
pub use registry::{EventType, Registry};
pub use source::{EventStream, PgEventSource, SelectorResult, SelectorSource, BATCH_SIZE};
