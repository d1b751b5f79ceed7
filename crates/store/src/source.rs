//! Selector execution against the store.
//!
//! `run_selector` returns a header row (the ledger position the query read
//! through) followed by at most one batch of events; longer results are
//! pulled with `fetch_selected` in rolling batches as the consumer drains
//! the stream. Dropping the stream cancels whatever batch is in flight,
//! which releases the database cursor.

use std::collections::VecDeque;
use std::pin::Pin;

use futures::stream::{self, Stream};
use sqlx::postgres::PgPool;

use evently_core::{sql, EventId, Ledger, LedgerId, PersistedEvent, Selector};

use crate::error::{from_sqlx, StoreError, StoreResult};
use crate::row::EventRow;

/// Rows requested per database round-trip.
pub const BATCH_SIZE: u32 = 100;

pub type EventStream = Pin<Box<dyn Stream<Item = StoreResult<PersistedEvent>> + Send + 'static>>;

/// Outcome of executing a selector: the position it read through and the
/// matched events in `(timestamp, checksum)` order.
pub struct SelectorResult {
    pub position: EventId,
    pub events: EventStream,
}

/// Executes selectors; the seam the registry and ledger components read
/// through, so their folds are testable without a database.
pub trait SelectorSource: Send + Sync {
    fn select(
        &self,
        ledger: LedgerId,
        selector: &Selector,
    ) -> impl core::future::Future<Output = StoreResult<SelectorResult>> + Send;
}

#[derive(Clone)]
pub struct PgEventSource {
    pool: PgPool,
}

impl PgEventSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn select(&self, ledger: LedgerId, selector: &Selector) -> StoreResult<SelectorResult> {
        let selector = selector.clone().canonicalize()?;
        if let Some(after) = selector.after() {
            if after.ledger() != ledger {
                return Err(StoreError::bad_request(format!(
                    "'after' {after} does not belong to ledger {ledger}"
                )));
            }
        }

        let predicate = sql::predicate_bytes(&selector);
        let after = selector.after();
        let after_ts = after.map(|a| a.timestamp() as i64).unwrap_or(0);
        let after_chk = after.map(|a| i64::from(a.checksum())).unwrap_or(0);
        // limit == 0 means unbounded.
        let limit = selector.limit().unwrap_or(0);

        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT timestamp, checksum, event, entities, meta, data \
             FROM run_selector($1, $2, $3, $4, $5, $6)",
        )
        .bind(ledger.to_string())
        .bind(after_ts)
        .bind(after_chk)
        .bind(i32::try_from(limit).unwrap_or(i32::MAX))
        .bind(&predicate)
        .bind(BATCH_SIZE as i32)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| from_sqlx("run_selector", e))?;

        let mut rows = rows.into_iter();
        let header = rows
            .next()
            .ok_or_else(|| StoreError::internal("run_selector", "missing header row"))?;
        let position = header.position(ledger);

        let first_batch: Vec<EventRow> = rows.collect();
        let first_want = batch_want(limit, 0);
        let drained = (first_batch.len() as u32) < first_want;

        let mut buffered = VecDeque::with_capacity(first_batch.len());
        let mut last_ts = after_ts;
        for row in first_batch {
            last_ts = row.timestamp;
            buffered.push_back(row.into_event(ledger)?);
        }

        let state = FetchState {
            pool: self.pool.clone(),
            ledger,
            predicate,
            limit,
            yielded: 0,
            last_ts,
            buffered,
            done: drained,
        };
        Ok(SelectorResult {
            position,
            events: Box::pin(stream::try_unfold(state, fetch_next)),
        })
    }

    /// The position a selector reads through right now, without the rows.
    pub async fn latest_event_id(
        &self,
        ledger: &Ledger,
        selector: &Selector,
    ) -> StoreResult<EventId> {
        let selector = selector.clone().canonicalize()?;
        if let Some(after) = selector.after() {
            if after.ledger() != ledger.id {
                return Err(StoreError::bad_request(format!(
                    "'after' {after} does not belong to ledger {}",
                    ledger.id
                )));
            }
        }
        let predicate = sql::predicate_bytes(&selector);
        let after = selector.after();
        let after_ts = after.map(|a| a.timestamp() as i64).unwrap_or(0);
        let limit = selector.limit().unwrap_or(0);

        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT timestamp, checksum FROM fetch_event_id($1, $2, $3, $4)",
        )
        .bind(ledger.id.to_string())
        .bind(&predicate)
        .bind(after_ts)
        .bind(i32::try_from(limit).unwrap_or(i32::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| from_sqlx("fetch_event_id", e))?;

        Ok(match row {
            Some((ts, chk)) => EventId::new(ts as u64, chk as u32, ledger.id),
            None => after.unwrap_or(ledger.genesis),
        })
    }
}

impl SelectorSource for PgEventSource {
    fn select(
        &self,
        ledger: LedgerId,
        selector: &Selector,
    ) -> impl core::future::Future<Output = StoreResult<SelectorResult>> + Send {
        PgEventSource::select(self, ledger, selector)
    }
}

struct FetchState {
    pool: PgPool,
    ledger: LedgerId,
    predicate: Vec<u8>,
    limit: u32,
    yielded: u32,
    last_ts: i64,
    buffered: VecDeque<PersistedEvent>,
    done: bool,
}

fn batch_want(limit: u32, yielded: u32) -> u32 {
    if limit == 0 {
        BATCH_SIZE
    } else {
        limit.saturating_sub(yielded).min(BATCH_SIZE)
    }
}

async fn fetch_next(
    mut state: FetchState,
) -> StoreResult<Option<(PersistedEvent, FetchState)>> {
    loop {
        if let Some(event) = state.buffered.pop_front() {
            state.yielded += 1;
            return Ok(Some((event, state)));
        }
        if state.done {
            return Ok(None);
        }
        let want = batch_want(state.limit, state.yielded);
        if want == 0 {
            return Ok(None);
        }

        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT timestamp, checksum, event, entities, meta, data \
             FROM fetch_selected($1, $2, $3, $4)",
        )
        .bind(state.ledger.to_string())
        .bind(state.last_ts)
        .bind(want as i32)
        .bind(&state.predicate)
        .fetch_all(&state.pool)
        .await
        .map_err(|e| from_sqlx("fetch_selected", e))?;

        if (rows.len() as u32) < want {
            state.done = true;
        }
        if rows.is_empty() {
            return Ok(None);
        }
        for row in rows {
            state.last_ts = row.timestamp;
            state.buffered.push_back(row.into_event(state.ledger)?);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_sizing_tracks_the_remaining_limit() {
        // Unbounded selectors always ask for a full batch.
        assert_eq!(batch_want(0, 0), BATCH_SIZE);
        assert_eq!(batch_want(0, 1_000), BATCH_SIZE);
        // Bounded selectors shrink the final batch.
        assert_eq!(batch_want(250, 0), 100);
        assert_eq!(batch_want(250, 200), 50);
        assert_eq!(batch_want(150, 100), 50);
        assert_eq!(batch_want(150, 150), 0);
    }
}
