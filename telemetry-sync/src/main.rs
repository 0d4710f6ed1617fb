use axum::{routing::get, Router};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use telemetry_sync::alerts::{run_alert_sweep_loop, AlertEngine};
use telemetry_sync::clock::{Clock, SystemClock};
use telemetry_sync::config::{AppConfig, StoreBackend};
use telemetry_sync::metrics;
use telemetry_sync::provider::ProviderRegistry;
use telemetry_sync::rest::{self, AppState};
use telemetry_sync::retention::{run_retention_loop, RetentionJob};
use telemetry_sync::store::{AlertStore, MemoryStore, PgStore, SnapshotStore, VehicleDirectory};
use telemetry_sync::sync::{run_sync_loop, SyncScheduler};

struct Stores {
    vehicles: Arc<dyn VehicleDirectory>,
    snapshots: Arc<dyn SnapshotStore>,
    alerts: Arc<dyn AlertStore>,
}

async fn open_stores(config: &AppConfig) -> telemetry_sync::errors::Result<Stores> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let store =
                Arc::new(PgStore::connect(&config.database_url, config.db_max_connections).await?);
            Ok(Stores {
                vehicles: store.clone(),
                snapshots: store.clone(),
                alerts: store,
            })
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; nothing survives a restart");
            let store = Arc::new(MemoryStore::new());
            Ok(Stores {
                vehicles: store.clone(),
                snapshots: store.clone(),
                alerts: store,
            })
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let config = AppConfig::load();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting fleet telemetry sync");
    info!("HTTP server: {}", config.http_addr);
    info!("Store backend: {:?}", config.store_backend);
    if config.store_backend == StoreBackend::Postgres {
        info!("Database: {}", config.database_url.split('@').last().unwrap_or("***"));
    }

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
        std::process::exit(1);
    }

    let stores = match open_stores(&config).await {
        Ok(stores) => stores,
        Err(e) => {
            error!("Failed to open store: {}", e);
            std::process::exit(1);
        }
    };

    let providers = match ProviderRegistry::from_config(&config.providers) {
        Ok(registry) => registry,
        Err(e) => {
            error!("Failed to build telemetry providers: {}", e);
            std::process::exit(1);
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let alerts = Arc::new(AlertEngine::new(
        stores.alerts.clone(),
        stores.vehicles.clone(),
        clock.clone(),
        config.alerts.clone(),
    ));
    let sync = Arc::new(SyncScheduler::new(
        stores.vehicles.clone(),
        stores.snapshots.clone(),
        providers,
        alerts.clone(),
        clock.clone(),
        config.sync.clone(),
    ));
    let retention = Arc::new(RetentionJob::new(
        stores.snapshots.clone(),
        clock,
        config.retention.clone(),
    ));

    let sync_handle = if config.sync.enabled {
        tokio::spawn(run_sync_loop(sync.clone()))
    } else {
        info!("Telemetry sync is disabled");
        tokio::spawn(std::future::pending::<()>())
    };
    let sweep_handle = tokio::spawn(run_alert_sweep_loop(alerts.clone()));
    let retention_handle = tokio::spawn(run_retention_loop(retention.clone()));

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(AppState {
            sync,
            alerts,
            retention,
        }));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = sync_handle => {
            error!("Sync task terminated");
        }
        _ = sweep_handle => {
            error!("Alert sweep task terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    // The retention task exits immediately when disabled, so it is not raced above.
    retention_handle.abort();
    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
