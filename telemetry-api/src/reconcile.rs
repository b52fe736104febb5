//! Reconcile incoming batches of events against what is already stored.
//!
//! Every event in a batch ends up in exactly one bucket:
//! - rejected: it failed validation, nothing else happens to it.
//! - accepted: its id was unknown, it is inserted.
//! - updated: its id was known, its payload differs and it was received strictly later than the
//!   version we know of, so it replaces that version.
//! - deduped: its id was known and it either carries the same payload or is not newer.
//!
//! Events are walked in batch order, and each one becomes the version that later events with
//! the same id are compared against. Only `received_time` decides between conflicting payloads.
use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use telemetry_common::event::{same_payload, Event};
use telemetry_common::store::{EventStore, StoreResult};

use crate::validation::validate;

/// Outcome counters for one batch, returned to the caller as is.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BatchSummary {
    pub accepted: u64,
    pub deduped: u64,
    pub updated: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Dedupe,
    Update,
}

/// What to do with `incoming` given the version of its id we currently know of, if any.
pub fn decide(known: Option<&Event>, incoming: &Event) -> Decision {
    match known {
        None => Decision::Accept,
        Some(known) if same_payload(known, incoming) => Decision::Dedupe,
        Some(known) if incoming.received_time > known.received_time => Decision::Update,
        // A conflicting payload we received earlier than (or together with) the one we know
        // has been superseded already.
        Some(_) => Decision::Dedupe,
    }
}

/// The result of reconciling a validated batch: counters, and the events to persist.
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub summary: BatchSummary,
    /// At most one event per id, the last version decided on, in the order ids were first
    /// written.
    pub writes: Vec<Event>,
}

impl Reconciliation {
    fn stage(&mut self, positions: &mut HashMap<String, usize>, event: Event) {
        match positions.get(&event.event_id) {
            Some(&position) => self.writes[position] = event,
            None => {
                positions.insert(event.event_id.clone(), self.writes.len());
                self.writes.push(event);
            }
        }
    }
}

/// Walk an already validated batch in order against `existing`, the stored version of every
/// id in the batch that has one.
pub fn reconcile(batch: Vec<Event>, existing: HashMap<String, Event>) -> Reconciliation {
    let mut known = existing;
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut reconciliation = Reconciliation::default();

    for incoming in batch {
        match decide(known.get(&incoming.event_id), &incoming) {
            Decision::Accept => {
                reconciliation.summary.accepted += 1;
                known.insert(incoming.event_id.clone(), incoming.clone());
                reconciliation.stage(&mut positions, incoming);
            }
            Decision::Update => {
                if let Some(current) = known.get_mut(&incoming.event_id) {
                    current.apply(&incoming);
                    reconciliation.summary.updated += 1;
                    let updated = current.clone();
                    reconciliation.stage(&mut positions, updated);
                }
            }
            Decision::Dedupe => {
                debug!(event_id = %incoming.event_id, "deduplicated event");
                reconciliation.summary.deduped += 1;
            }
        }
    }

    reconciliation
}

/// Split a batch into the events that passed validation, in their original order, and the
/// number that did not.
pub fn partition_valid(batch: Vec<Event>, now: DateTime<Utc>) -> (Vec<Event>, u64) {
    let mut rejected = 0;
    let valid = batch
        .into_iter()
        .filter(|event| match validate(event, now) {
            Ok(()) => true,
            Err(error) => {
                debug!(event_id = %event.event_id, "rejected event: {}", error);
                metrics::counter!("telemetry_events_rejected_total", "reason" => error.reason())
                    .increment(1);
                rejected += 1;
                false
            }
        })
        .collect();

    (valid, rejected)
}

/// Validate, reconcile and persist one batch.
///
/// The lookup of stored versions and the write of the outcome happen in a single store
/// transaction. Any store error fails the whole batch and nothing from it is persisted.
#[instrument(skip_all, fields(batch_size = batch.len()))]
pub async fn ingest_batch(
    store: &(dyn EventStore + Send + Sync),
    batch: Vec<Event>,
    now: DateTime<Utc>,
) -> StoreResult<BatchSummary> {
    let start = Instant::now();
    metrics::counter!("telemetry_events_received_total").increment(batch.len() as u64);
    metrics::histogram!("telemetry_batch_size").record(batch.len() as f64);

    let (valid, rejected) = partition_valid(batch, now);
    if valid.is_empty() {
        return Ok(BatchSummary {
            rejected,
            ..Default::default()
        });
    }

    let mut seen = HashSet::with_capacity(valid.len());
    let ids: Vec<String> = valid
        .iter()
        .filter(|event| seen.insert(event.event_id.as_str()))
        .map(|event| event.event_id.clone())
        .collect();

    let mut txn = store.begin().await?;
    let existing = txn.find_by_ids(&ids).await?;
    let Reconciliation { mut summary, writes } = reconcile(valid, existing);
    txn.upsert_all(&writes).await?;
    txn.commit().await?;

    summary.rejected = rejected;

    metrics::counter!("telemetry_events_accepted_total").increment(summary.accepted);
    metrics::counter!("telemetry_events_deduped_total").increment(summary.deduped);
    metrics::counter!("telemetry_events_updated_total").increment(summary.updated);
    metrics::histogram!("telemetry_ingest_duration_seconds")
        .record(start.elapsed().as_secs_f64());

    Ok(summary)
}
