use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use telemetry_common::event::TimeWindow;
use telemetry_common::store::{EventStore, LineCounts, StoreResult, WindowCounts};

/// Machines reporting this many defects per hour or more are flagged.
pub const HEALTHY_THRESHOLD: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum MachineStatus {
    Healthy,
    Warning,
}

impl MachineStatus {
    pub fn from_defect_rate(rate: f64) -> Self {
        if rate < HEALTHY_THRESHOLD {
            MachineStatus::Healthy
        } else {
            MachineStatus::Warning
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStats {
    pub machine_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub events_count: i64,
    pub defects_count: i64,
    pub avg_defect_rate: f64,
    pub status: MachineStatus,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopDefectLine {
    pub line_id: String,
    pub total_defects: i64,
    pub event_count: i64,
    pub defects_percent: f64,
}

/// Round half away from zero to the given number of decimal places.
pub fn round_half_up(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Build the statistics of a machine from its totals over `window`.
/// Degenerate and inverted windows yield a defect rate of zero.
pub fn machine_stats(machine_id: &str, window: TimeWindow, counts: WindowCounts) -> MachineStats {
    let hours = window.hours();
    let avg_defect_rate = if hours > 0.0 {
        counts.defects_count as f64 / hours
    } else {
        0.0
    };

    MachineStats {
        machine_id: machine_id.to_owned(),
        start: window.start,
        end: window.end,
        events_count: counts.events_count,
        defects_count: counts.defects_count,
        avg_defect_rate,
        status: MachineStatus::from_defect_rate(avg_defect_rate),
    }
}

#[instrument(skip(store))]
pub async fn compute_stats(
    store: &(dyn EventStore + Send + Sync),
    machine_id: &str,
    window: TimeWindow,
) -> StoreResult<MachineStats> {
    let counts = store.machine_counts(machine_id, window).await?;
    Ok(machine_stats(machine_id, window, counts))
}

fn defects_percent(line: &LineCounts) -> f64 {
    if line.event_count > 0 {
        round_half_up(
            line.total_defects as f64 / line.event_count as f64 * 100.0,
            2,
        )
    } else {
        0.0
    }
}

/// Rank lines by total defects, most first, ties broken by line id, and keep the first `limit`.
pub fn rank_lines(mut lines: Vec<LineCounts>, limit: i64) -> Vec<TopDefectLine> {
    let Ok(limit) = usize::try_from(limit) else {
        return Vec::new();
    };

    lines.sort_by(|a, b| match b.total_defects.cmp(&a.total_defects) {
        Ordering::Equal => a.line_id.cmp(&b.line_id),
        other => other,
    });

    lines
        .into_iter()
        .take(limit)
        .map(|line| TopDefectLine {
            defects_percent: defects_percent(&line),
            line_id: line.line_id,
            total_defects: line.total_defects,
            event_count: line.event_count,
        })
        .collect()
}

#[instrument(skip(store))]
pub async fn top_defect_lines(
    store: &(dyn EventStore + Send + Sync),
    window: TimeWindow,
    limit: i64,
) -> StoreResult<Vec<TopDefectLine>> {
    if limit <= 0 {
        return Ok(Vec::new());
    }

    let lines = store.line_counts(window).await?;
    Ok(rank_lines(lines, limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn window(hours: i64) -> TimeWindow {
        let start = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();
        TimeWindow::new(start, start + Duration::hours(hours))
    }

    fn line(id: &str, event_count: i64, total_defects: i64) -> LineCounts {
        LineCounts {
            line_id: id.to_owned(),
            event_count,
            total_defects,
        }
    }

    #[test]
    fn defect_rate_is_per_hour() {
        let stats = machine_stats(
            "M-1",
            window(4),
            WindowCounts {
                events_count: 10,
                defects_count: 6,
            },
        );

        assert_eq!(stats.avg_defect_rate, 1.5);
        assert_eq!(stats.status, MachineStatus::Healthy);
    }

    #[test]
    fn threshold_is_a_warning() {
        let stats = machine_stats(
            "M-1",
            window(1),
            WindowCounts {
                events_count: 2,
                defects_count: 2,
            },
        );

        assert_eq!(stats.avg_defect_rate, 2.0);
        assert_eq!(stats.status, MachineStatus::Warning);
    }

    #[test]
    fn degenerate_window_has_zero_rate() {
        let counts = WindowCounts {
            events_count: 3,
            defects_count: 30,
        };

        let empty = machine_stats("M-1", window(0), counts);
        assert_eq!(empty.avg_defect_rate, 0.0);
        assert_eq!(empty.status, MachineStatus::Healthy);

        let inverted = machine_stats("M-1", window(-2), counts);
        assert_eq!(inverted.avg_defect_rate, 0.0);
    }

    #[test]
    fn stats_serialize_with_expected_shape() {
        let stats = machine_stats("M-1", window(1), WindowCounts::default());

        let json = serde_json::to_value(&stats).unwrap();

        assert_eq!(json["machineId"], "M-1");
        assert_eq!(json["start"], "2024-10-01T00:00:00Z");
        assert_eq!(json["end"], "2024-10-01T01:00:00Z");
        assert_eq!(json["eventsCount"], 0);
        assert_eq!(json["avgDefectRate"], 0.0);
        assert_eq!(json["status"], "Healthy");
    }

    #[test]
    fn rounds_half_up() {
        assert_eq!(round_half_up(33.333_333, 2), 33.33);
        assert_eq!(round_half_up(66.666_666, 2), 66.67);
        assert_eq!(round_half_up(12.5, 0), 13.0);
        assert_eq!(round_half_up(0.125, 2), 0.13);
    }

    #[test]
    fn lines_are_ranked_by_defects_then_id() {
        let ranked = rank_lines(
            vec![
                line("M-3", 10, 5),
                line("M-1", 3, 9),
                line("M-2", 4, 5),
                line("M-4", 1, 0),
            ],
            10,
        );

        let ids: Vec<&str> = ranked.iter().map(|l| l.line_id.as_str()).collect();
        assert_eq!(ids, vec!["M-1", "M-2", "M-3", "M-4"]);
        assert_eq!(ranked[0].defects_percent, 300.0);
        assert_eq!(ranked[1].defects_percent, 125.0);
        assert_eq!(ranked[2].defects_percent, 50.0);
        assert_eq!(ranked[3].defects_percent, 0.0);
    }

    #[test]
    fn percent_is_rounded_to_two_decimals() {
        let ranked = rank_lines(vec![line("M-1", 3, 1)], 1);
        assert_eq!(ranked[0].defects_percent, 33.33);
    }

    #[test]
    fn empty_line_has_zero_percent() {
        assert_eq!(defects_percent(&line("M-1", 0, 0)), 0.0);
    }

    #[test]
    fn limit_truncates() {
        let lines = vec![line("M-1", 1, 3), line("M-2", 1, 2), line("M-3", 1, 1)];

        assert_eq!(rank_lines(lines.clone(), 2).len(), 2);
        assert_eq!(rank_lines(lines.clone(), 100).len(), 3);
        assert!(rank_lines(lines.clone(), 0).is_empty());
        assert!(rank_lines(lines, -1).is_empty());
    }

    #[test]
    fn top_line_serializes_with_expected_shape() {
        let ranked = rank_lines(vec![line("M-1", 4, 1)], 1);

        let json = serde_json::to_value(&ranked).unwrap();

        assert_eq!(
            json,
            serde_json::json!([{
                "lineId": "M-1",
                "totalDefects": 1,
                "eventCount": 4,
                "defectsPercent": 25.0,
            }])
        );
    }
}
