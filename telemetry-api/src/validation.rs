use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use telemetry_common::event::Event;

/// Longest duration an event can report: 6 hours.
pub const MAX_DURATION_MS: i64 = 21_600_000;

/// How far ahead of our clock an event time may be, in minutes.
pub const MAX_FUTURE_SKEW_MINUTES: i64 = 15;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("duration {0}ms is outside of [0, {MAX_DURATION_MS}]")]
    DurationOutOfRange(i64),
    #[error("event time {0} is more than {MAX_FUTURE_SKEW_MINUTES} minutes in the future")]
    EventTimeInFuture(DateTime<Utc>),
}

impl ValidationError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::DurationOutOfRange(_) => "duration_out_of_range",
            ValidationError::EventTimeInFuture(_) => "event_time_in_future",
        }
    }
}

/// Check a single incoming event. Identity fields and defect counts are not checked here.
pub fn validate(event: &Event, now: DateTime<Utc>) -> Result<(), ValidationError> {
    if !(0..=MAX_DURATION_MS).contains(&event.duration_ms) {
        return Err(ValidationError::DurationOutOfRange(event.duration_ms));
    }

    if event.event_time > now + Duration::minutes(MAX_FUTURE_SKEW_MINUTES) {
        return Err(ValidationError::EventTimeInFuture(event.event_time));
    }

    Ok(())
}

pub fn is_valid(event: &Event, now: DateTime<Utc>) -> bool {
    validate(event, now).is_ok()
}
