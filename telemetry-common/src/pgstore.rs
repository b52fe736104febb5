//! An EventStore backed by a PostgreSQL table.
use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use crate::event::{Event, TimeWindow};
use crate::store::{
    EventStore, EventTransaction, LineCounts, StoreError, StoreResult, WindowCounts,
};

/// Sum of defects over the selected rows, with the unknown sentinel summed as zero.
const EFFECTIVE_DEFECTS_SUM: &str =
    "COALESCE(SUM(CASE WHEN defect_count = -1 THEN 0 ELSE defect_count END), 0)::BIGINT";

pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Initialize a new PgEventStore connecting to the database at `url`.
    pub async fn new(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    /// Initialize a new PgEventStore from an existing pool.
    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bring the schema up to date.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("../migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn begin(&self) -> StoreResult<Box<dyn EventTransaction + Send>> {
        let txn = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        Ok(Box::new(PgEventTransaction {
            txn,
            started_at: Instant::now(),
        }))
    }

    async fn machine_counts(
        &self,
        machine_id: &str,
        window: TimeWindow,
    ) -> StoreResult<WindowCounts> {
        let query = format!(
            r#"
SELECT
    COUNT(*) AS events_count,
    {EFFECTIVE_DEFECTS_SUM} AS defects_count
FROM
    machine_events
WHERE
    machine_id = $1
    AND event_time >= $2
    AND event_time < $3
            "#
        );

        sqlx::query_as::<_, WindowCounts>(&query)
            .bind(machine_id)
            .bind(window.start)
            .bind(window.end)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn line_counts(&self, window: TimeWindow) -> StoreResult<Vec<LineCounts>> {
        let query = format!(
            r#"
SELECT
    machine_id AS line_id,
    COUNT(*) AS event_count,
    {EFFECTIVE_DEFECTS_SUM} AS total_defects
FROM
    machine_events
WHERE
    event_time >= $1
    AND event_time < $2
GROUP BY
    machine_id
            "#
        );

        sqlx::query_as::<_, LineCounts>(&query)
            .bind(window.start)
            .bind(window.end)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn get(&self, event_id: &str) -> StoreResult<Option<Event>> {
        sqlx::query_as::<_, Event>(
            r#"
SELECT
    event_id, machine_id, event_time, received_time, duration_ms, defect_count
FROM
    machine_events
WHERE
    event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })
    }

    async fn count(&self) -> StoreResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM machine_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    async fn clear(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM machine_events")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(())
    }
}

/// A transaction on the machine_events table.
///
/// Isolation between concurrent batches comes from transaction scoped advisory locks, one per
/// event id, taken before reading. Row locks alone would not do: they cannot protect ids that
/// do not exist yet, which is exactly the case where two batches race to insert.
pub struct PgEventTransaction {
    txn: Transaction<'static, Postgres>,
    started_at: Instant,
}

#[async_trait]
impl EventTransaction for PgEventTransaction {
    async fn find_by_ids(&mut self, ids: &[String]) -> StoreResult<HashMap<String, Event>> {
        // Keys are locked in ascending order so concurrent batches cannot deadlock.
        sqlx::query(
            r#"
SELECT
    pg_advisory_xact_lock(lock_key)
FROM (
    SELECT DISTINCT hashtext(id) AS lock_key
    FROM UNNEST($1::text[]) AS id
    ORDER BY lock_key
) AS keys
            "#,
        )
        .bind(ids)
        .execute(&mut *self.txn)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "LOCK".to_owned(),
            error,
        })?;

        let events: Vec<Event> = sqlx::query_as(
            r#"
SELECT
    event_id, machine_id, event_time, received_time, duration_ms, defect_count
FROM
    machine_events
WHERE
    event_id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&mut *self.txn)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "SELECT".to_owned(),
            error,
        })?;

        Ok(events
            .into_iter()
            .map(|event| (event.event_id.clone(), event))
            .collect())
    }

    async fn upsert_all(&mut self, events: &[Event]) -> StoreResult<()> {
        if events.is_empty() {
            return Ok(());
        }

        let mut event_ids: Vec<&str> = Vec::with_capacity(events.len());
        let mut machine_ids: Vec<&str> = Vec::with_capacity(events.len());
        let mut event_times: Vec<DateTime<Utc>> = Vec::with_capacity(events.len());
        let mut received_times: Vec<DateTime<Utc>> = Vec::with_capacity(events.len());
        let mut durations: Vec<i64> = Vec::with_capacity(events.len());
        let mut defect_counts: Vec<i32> = Vec::with_capacity(events.len());

        for event in events {
            event_ids.push(&event.event_id);
            machine_ids.push(&event.machine_id);
            event_times.push(event.event_time);
            received_times.push(event.received_time);
            durations.push(event.duration_ms);
            defect_counts.push(event.defect_count);
        }

        sqlx::query(
            r#"
INSERT INTO machine_events
    (event_id, machine_id, event_time, received_time, duration_ms, defect_count)
SELECT * FROM UNNEST($1::text[], $2::text[], $3::timestamptz[], $4::timestamptz[], $5::int8[], $6::int4[])
ON CONFLICT (event_id) DO UPDATE SET
    machine_id = EXCLUDED.machine_id,
    event_time = EXCLUDED.event_time,
    received_time = EXCLUDED.received_time,
    duration_ms = EXCLUDED.duration_ms,
    defect_count = EXCLUDED.defect_count
            "#,
        )
        .bind(&event_ids)
        .bind(&machine_ids)
        .bind(&event_times)
        .bind(&received_times)
        .bind(&durations)
        .bind(&defect_counts)
        .execute(&mut *self.txn)
        .await
        .map_err(|error| StoreError::QueryError {
            command: "INSERT".to_owned(),
            error,
        })?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let started_at = self.started_at;

        self.txn
            .commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })?;

        metrics::histogram!("telemetry_store_transaction_seconds")
            .record(started_at.elapsed().as_secs_f64());

        Ok(())
    }
}
