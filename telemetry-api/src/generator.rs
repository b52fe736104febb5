//! Synthetic machine telemetry, for load testing and seeding a fresh store.
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use uuid::Uuid;

use telemetry_common::event::{Event, UNKNOWN_DEFECT_COUNT};

/// Number of distinct machines events are spread over.
pub const MACHINE_COUNT: u32 = 10;

/// Generate `count` valid events with fresh ids, all received at `now` and occurring within the
/// hour before it. About one event in ten reports an unknown defect count.
pub fn generate_batch<R: Rng>(count: usize, now: DateTime<Utc>, rng: &mut R) -> Vec<Event> {
    (0..count)
        .map(|_| {
            let defect_count = if rng.gen_ratio(1, 10) {
                UNKNOWN_DEFECT_COUNT
            } else {
                rng.gen_range(0..5)
            };

            Event {
                event_id: Uuid::new_v4().to_string(),
                machine_id: format!("M-{:03}", rng.gen_range(1..=MACHINE_COUNT)),
                event_time: now - Duration::seconds(rng.gen_range(0..3600)),
                received_time: now,
                duration_ms: rng.gen_range(100..20_000_100),
                defect_count,
            }
            .normalized()
        })
        .collect()
}
