use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// A defect count of exactly -1 means the machine could not tell how many defects it saw.
/// Such events still count as observations, but contribute nothing to defect totals.
pub const UNKNOWN_DEFECT_COUNT: i32 = -1;

/// A single telemetry event reported by a machine.
///
/// `event_id` is the identity of the event: at most one version of it is stored at any time.
/// `received_time` is only used to decide which of two conflicting versions wins, it is never
/// used for querying.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub machine_id: String,
    pub event_time: DateTime<Utc>,
    pub received_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub defect_count: i32,
}

impl Event {
    /// Truncate both timestamps to microseconds, the precision we can persist.
    /// Without this, an identical resubmission could compare as a different payload after a
    /// round-trip through the database.
    pub fn normalized(mut self) -> Self {
        self.event_time = self.event_time.trunc_subsecs(6);
        self.received_time = self.received_time.trunc_subsecs(6);
        self
    }

    /// Overwrite every mutable field with the ones from `newer`, keeping our identity.
    pub fn apply(&mut self, newer: &Event) {
        self.machine_id.clone_from(&newer.machine_id);
        self.duration_ms = newer.duration_ms;
        self.defect_count = newer.defect_count;
        self.event_time = newer.event_time;
        self.received_time = newer.received_time;
    }
}

/// Two versions of an event carry the same payload when everything but `received_time` matches.
pub fn same_payload(a: &Event, b: &Event) -> bool {
    a.machine_id == b.machine_id
        && a.duration_ms == b.duration_ms
        && a.defect_count == b.defect_count
        && a.event_time == b.event_time
}

/// The amount a defect count contributes to any sum: the unknown sentinel counts as zero.
pub fn effective_defects(defect_count: i32) -> i64 {
    if defect_count == UNKNOWN_DEFECT_COUNT {
        0
    } else {
        i64::from(defect_count)
    }
}

/// A half-open interval of event times: `start` is included, `end` is not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Length of the window in hours, computed from whole seconds.
    /// Zero or negative for degenerate and inverted windows.
    pub fn hours(&self) -> f64 {
        (self.end - self.start).num_seconds() as f64 / 3600.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn event(id: &str) -> Event {
        let at = Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap();
        Event {
            event_id: id.to_owned(),
            machine_id: "M-1".to_owned(),
            event_time: at,
            received_time: at,
            duration_ms: 1000,
            defect_count: 0,
        }
    }

    #[test]
    fn payload_equality_ignores_received_time() {
        let a = event("E-1");
        let mut b = event("E-1");
        b.received_time += Duration::minutes(5);

        assert!(same_payload(&a, &b));

        b.defect_count = 3;
        assert!(!same_payload(&a, &b));
    }

    #[test]
    fn payload_equality_covers_every_field() {
        let a = event("E-1");

        let mut b = event("E-1");
        b.machine_id = "M-2".to_owned();
        assert!(!same_payload(&a, &b));

        let mut b = event("E-1");
        b.duration_ms = 1001;
        assert!(!same_payload(&a, &b));

        let mut b = event("E-1");
        b.event_time += Duration::milliseconds(1);
        assert!(!same_payload(&a, &b));
    }

    #[test]
    fn apply_keeps_identity() {
        let mut stored = event("E-1");
        let mut newer = event("E-2");
        newer.machine_id = "M-9".to_owned();
        newer.duration_ms = 9999;
        newer.defect_count = 5;
        newer.received_time += Duration::seconds(10);

        stored.apply(&newer);

        assert_eq!(stored.event_id, "E-1");
        assert_eq!(stored.machine_id, "M-9");
        assert_eq!(stored.duration_ms, 9999);
        assert_eq!(stored.defect_count, 5);
        assert_eq!(stored.received_time, newer.received_time);
    }

    #[test]
    fn sentinel_counts_as_zero() {
        assert_eq!(effective_defects(UNKNOWN_DEFECT_COUNT), 0);
        assert_eq!(effective_defects(0), 0);
        assert_eq!(effective_defects(7), 7);
    }

    #[test]
    fn window_is_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + Duration::hours(1));

        assert!(window.contains(start));
        assert!(window.contains(start + Duration::minutes(59)));
        assert!(!window.contains(start + Duration::hours(1)));
        assert!(!window.contains(start - Duration::nanoseconds(1)));
        assert_eq!(window.hours(), 1.0);
    }

    #[test]
    fn degenerate_windows_have_no_hours() {
        let start = Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap();

        assert_eq!(TimeWindow::new(start, start).hours(), 0.0);
        assert!(TimeWindow::new(start, start - Duration::hours(2)).hours() < 0.0);
    }

    #[test]
    fn deserializes_camel_case() {
        let event: Event = serde_json::from_str(
            r#"{
                "eventId": "E-1",
                "machineId": "M-1",
                "eventTime": "2024-10-01T12:00:00.123456789Z",
                "receivedTime": "2024-10-01T12:00:01Z",
                "durationMs": 1000,
                "defectCount": -1
            }"#,
        )
        .expect("failed to deserialize event");

        assert_eq!(event.defect_count, UNKNOWN_DEFECT_COUNT);

        let normalized = event.normalized();
        assert_eq!(normalized.event_time.timestamp_subsec_nanos(), 123_456_000);
    }
}
