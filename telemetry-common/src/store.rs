use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{Event, TimeWindow};

/// Enumeration of errors for operations with an EventStore.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("running migrations failed with: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Event and defect totals for a single machine over a window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct WindowCounts {
    pub events_count: i64,
    pub defects_count: i64,
}

/// Event and defect totals for one line (machine) over a window.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, sqlx::FromRow)]
pub struct LineCounts {
    pub line_id: String,
    pub event_count: i64,
    pub total_defects: i64,
}

/// A durable store of events, keyed by event id and indexed by machine and event time.
///
/// Every sum an implementation returns must treat the unknown defect sentinel as zero
/// before summing.
#[async_trait]
pub trait EventStore {
    /// Open a unit of work. Reads and writes made through the returned transaction become
    /// visible to others only once it is committed.
    async fn begin(&self) -> StoreResult<Box<dyn EventTransaction + Send>>;

    async fn machine_counts(&self, machine_id: &str, window: TimeWindow)
        -> StoreResult<WindowCounts>;

    /// Per line totals over the window, in no particular order.
    async fn line_counts(&self, window: TimeWindow) -> StoreResult<Vec<LineCounts>>;

    async fn get(&self, event_id: &str) -> StoreResult<Option<Event>>;

    async fn count(&self) -> StoreResult<i64>;

    /// Delete every event. Only meant for administration and tests.
    async fn clear(&self) -> StoreResult<()>;

    /// Check the store can serve requests.
    async fn ping(&self) -> StoreResult<()>;
}

/// A transaction against an EventStore.
///
/// Once `find_by_ids` returns, no other transaction can observe or write any of the requested
/// ids until this one is committed or dropped. Dropping a transaction without committing
/// discards every staged write.
#[async_trait]
pub trait EventTransaction {
    /// Bulk lookup of the currently stored version of each id. Ids with no stored event are
    /// absent from the returned map.
    async fn find_by_ids(&mut self, ids: &[String]) -> StoreResult<HashMap<String, Event>>;

    /// Insert or replace every event, keyed by event id.
    async fn upsert_all(&mut self, events: &[Event]) -> StoreResult<()>;

    async fn commit(self: Box<Self>) -> StoreResult<()>;
}
