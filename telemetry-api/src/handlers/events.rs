use axum::{extract::State, Json};
use tracing::{info, instrument};

use telemetry_common::event::Event;

use super::app::AppState;
use crate::api::ApiError;
use crate::reconcile::{ingest_batch, BatchSummary};

/// Ingest a batch of events. Identity fields are required by deserialization; everything
/// else about an event is checked by the validator and counted, never reported per event.
#[instrument(skip_all)]
pub async fn post_batch(
    State(state): State<AppState>,
    Json(events): Json<Vec<Event>>,
) -> Result<Json<BatchSummary>, ApiError> {
    let batch: Vec<Event> = events.into_iter().map(Event::normalized).collect();
    let now = state.timesource.current_time();

    let summary = ingest_batch(state.store.as_ref(), batch, now).await?;

    info!(
        accepted = summary.accepted,
        deduped = summary.deduped,
        updated = summary.updated,
        rejected = summary.rejected,
        "ingested batch"
    );

    Ok(Json(summary))
}
