use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use telemetry_common::store::StoreError;

#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("event store unavailable, please retry")]
    StoreUnavailable(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
            ApiError::StoreUnavailable(err) => {
                error!("event store error: {}", err);
                StatusCode::SERVICE_UNAVAILABLE
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
