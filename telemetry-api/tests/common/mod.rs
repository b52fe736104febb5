#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{self, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use once_cell::sync::Lazy;
use serde::Serialize;
use serde_json::Value;
use tower::ServiceExt;

use telemetry_api::handlers::{app, AppState};
use telemetry_api::time::FixedTime;
use telemetry_common::event::Event;
use telemetry_common::health::HealthRegistry;
use telemetry_common::memory::MemoryEventStore;

static TRACING: Lazy<()> = Lazy::new(|| {
    tracing_subscriber::fmt()
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .init()
});

pub fn setup_tracing() {
    Lazy::force(&TRACING);
}

/// A telemetry app running on an in-memory store, with the clock fixed at `now`.
pub struct ServerHandle {
    pub store: MemoryEventStore,
    pub now: DateTime<Utc>,
    app: Router,
}

impl ServerHandle {
    pub fn new(now: DateTime<Utc>) -> Self {
        setup_tracing();

        let store = MemoryEventStore::new();
        let state = AppState {
            store: Arc::new(store.clone()),
            timesource: Arc::new(FixedTime { time: now }),
        };
        let app = app(state, HealthRegistry::new("liveness"), None, 10 * 1024 * 1024);

        Self { store, now, app }
    }

    pub async fn send_batch<T: Serialize>(&self, batch: &T) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(http::Method::POST)
            .uri("/events/batch")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                serde_json::to_string(batch).expect("failed to serialize batch"),
            ))
            .expect("failed to build request");

        self.call(request).await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("failed to build request");

        self.call(request).await
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("request failed");
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("failed to read body")
            .to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);

        (status, json)
    }
}

pub fn create_event(id: &str, machine_id: &str, duration_ms: i64, defects: i32, at: DateTime<Utc>) -> Event {
    Event {
        event_id: id.to_owned(),
        machine_id: machine_id.to_owned(),
        event_time: at,
        received_time: at,
        duration_ms,
        defect_count: defects,
    }
}

/// Format an instant for a query string. `Z` rather than `+00:00`, as `+` is not URL safe.
pub fn query_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
