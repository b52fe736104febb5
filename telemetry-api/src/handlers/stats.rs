use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_derive::Deserialize;

use telemetry_common::event::TimeWindow;

use super::app::AppState;
use crate::aggregate::{compute_stats, top_defect_lines, MachineStats, TopDefectLine};
use crate::api::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsQuery {
    machine_id: String,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct TopDefectLinesQuery {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    10
}

pub async fn get_stats(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<MachineStats>, ApiError> {
    if query.machine_id.is_empty() {
        return Err(ApiError::InvalidQuery("machineId must not be empty".to_owned()));
    }

    let window = TimeWindow::new(query.start, query.end);
    let stats = compute_stats(state.store.as_ref(), &query.machine_id, window).await?;

    Ok(Json(stats))
}

pub async fn get_top_defect_lines(
    State(state): State<AppState>,
    Query(query): Query<TopDefectLinesQuery>,
) -> Result<Json<Vec<TopDefectLine>>, ApiError> {
    let window = TimeWindow::new(query.from, query.to);
    let lines = top_defect_lines(state.store.as_ref(), window, query.limit).await?;

    Ok(Json(lines))
}
