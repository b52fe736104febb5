//! An in-process EventStore, used in tests and for running the service without a database.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::event::{effective_defects, Event, TimeWindow};
use crate::store::{EventStore, EventTransaction, LineCounts, StoreResult, WindowCounts};

type Events = HashMap<String, Event>;

#[derive(Clone, Default)]
pub struct MemoryEventStore {
    events: Arc<Mutex<Events>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn begin(&self) -> StoreResult<Box<dyn EventTransaction + Send>> {
        // The whole table is locked for the lifetime of the transaction: coarse, but it gives
        // the same isolation guarantees as the per id locks in Postgres.
        let guard = self.events.clone().lock_owned().await;

        Ok(Box::new(MemoryEventTransaction {
            guard,
            staged: Vec::new(),
        }))
    }

    async fn machine_counts(
        &self,
        machine_id: &str,
        window: TimeWindow,
    ) -> StoreResult<WindowCounts> {
        let events = self.events.lock().await;

        Ok(events
            .values()
            .filter(|e| e.machine_id == machine_id && window.contains(e.event_time))
            .fold(WindowCounts::default(), |mut counts, e| {
                counts.events_count += 1;
                counts.defects_count += effective_defects(e.defect_count);
                counts
            }))
    }

    async fn line_counts(&self, window: TimeWindow) -> StoreResult<Vec<LineCounts>> {
        let events = self.events.lock().await;
        let mut lines: HashMap<&str, LineCounts> = HashMap::new();

        for event in events.values().filter(|e| window.contains(e.event_time)) {
            let line = lines
                .entry(event.machine_id.as_str())
                .or_insert_with(|| LineCounts {
                    line_id: event.machine_id.clone(),
                    event_count: 0,
                    total_defects: 0,
                });
            line.event_count += 1;
            line.total_defects += effective_defects(event.defect_count);
        }

        Ok(lines.into_values().collect())
    }

    async fn get(&self, event_id: &str) -> StoreResult<Option<Event>> {
        Ok(self.events.lock().await.get(event_id).cloned())
    }

    async fn count(&self) -> StoreResult<i64> {
        Ok(self.events.lock().await.len() as i64)
    }

    async fn clear(&self) -> StoreResult<()> {
        self.events.lock().await.clear();
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

pub struct MemoryEventTransaction {
    guard: OwnedMutexGuard<Events>,
    staged: Vec<Event>,
}

#[async_trait]
impl EventTransaction for MemoryEventTransaction {
    async fn find_by_ids(&mut self, ids: &[String]) -> StoreResult<HashMap<String, Event>> {
        Ok(ids
            .iter()
            .filter_map(|id| self.guard.get(id).map(|e| (id.clone(), e.clone())))
            .collect())
    }

    async fn upsert_all(&mut self, events: &[Event]) -> StoreResult<()> {
        self.staged.extend_from_slice(events);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryEventTransaction { mut guard, staged } = *self;

        for event in staged {
            guard.insert(event.event_id.clone(), event);
        }

        Ok(())
    }
}
