use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use telemetry_api::config::{Config, StoreBackend};
use telemetry_api::generator::generate_batch;
use telemetry_api::handlers::{app, AppState};
use telemetry_api::reconcile::ingest_batch;
use telemetry_api::time::{SystemTime, TimeSource};
use telemetry_common::health::{watch_store, HealthRegistry};
use telemetry_common::memory::MemoryEventStore;
use telemetry_common::metrics::setup_metrics_recorder;
use telemetry_common::pgstore::PgEventStore;
use telemetry_common::store::EventStore;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
}

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await?;

    Ok(())
}

async fn build_store(config: &Config) -> Result<Arc<dyn EventStore + Send + Sync>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let store =
                PgEventStore::new(&config.database_url, config.max_pg_connections).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            tracing::warn!("using the in-memory event store, nothing will be persisted");
            Ok(Arc::new(MemoryEventStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = build_store(&config).await?;
    let timesource: Arc<dyn TimeSource + Send + Sync> = Arc::new(SystemTime {});

    let liveness = HealthRegistry::new("liveness");
    let store_health = liveness.register("event_store", time::Duration::seconds(30));
    tokio::spawn(watch_store(
        store.clone(),
        store_health,
        std::time::Duration::from_secs(10),
    ));

    if config.seed_events > 0 {
        let now = timesource.current_time();
        let batch = generate_batch(config.seed_events, now, &mut rand::thread_rng());
        let summary = ingest_batch(store.as_ref(), batch, now).await?;
        tracing::info!("seeded store with synthetic events: {:?}", summary);
    }

    let metrics = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };

    let state = AppState { store, timesource };
    let app = app(state, liveness, metrics, config.max_body_size);

    match listen(app, config.bind()).await {
        Ok(_) => Ok(()),
        Err(e) => {
            tracing::error!("failed to start telemetry http server, {}", e);
            Err(e)
        }
    }
}
