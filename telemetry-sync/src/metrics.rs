use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref SYNC_SUCCESS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "fleet_sync_success_total",
        "Vehicle syncs that produced a snapshot"
    ))
    .unwrap();
    pub static ref SYNC_FAILURE_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "fleet_sync_failure_total",
            "Vehicle syncs that failed, by reason (error, no_data, timeout)"
        ),
        &["reason"]
    )
    .unwrap();
    pub static ref SYNC_SKIPPED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "fleet_sync_skipped_total",
        "Vehicles skipped because they were still backing off"
    ))
    .unwrap();
    pub static ref SNAPSHOTS_SAVED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "fleet_snapshots_saved_total",
        "Telemetry snapshots persisted"
    ))
    .unwrap();
    pub static ref LIVE_STATE_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "fleet_live_state_update_failures_total",
        "Snapshots saved whose vehicle live-state update failed"
    ))
    .unwrap();
    pub static ref SYNC_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "fleet_sync_duration_seconds",
            "Wall time of one full sync run"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0])
    )
    .unwrap();
    pub static ref VEHICLES_IN_BACKOFF: Gauge = Gauge::with_opts(Opts::new(
        "fleet_vehicles_in_backoff",
        "Vehicles with at least one consecutive sync failure"
    ))
    .unwrap();
    pub static ref ALERTS_CREATED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("fleet_alerts_created_total", "Alerts raised, by alert type"),
        &["alert_type"]
    )
    .unwrap();
    pub static ref ALERTS_SUPPRESSED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "fleet_alerts_suppressed_total",
        "Alerts not raised because an open one exists inside the cooldown"
    ))
    .unwrap();
    pub static ref ALERTS_EXPIRED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "fleet_alerts_expired_total",
        "Active alerts moved to EXPIRED by the sweep"
    ))
    .unwrap();
    pub static ref RETENTION_DELETED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "fleet_retention_deleted_total",
        "Snapshots purged by the retention job"
    ))
    .unwrap();
    pub static ref STORE_RETRIES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "fleet_store_retries_total",
        "Transient database failures that were retried"
    ))
    .unwrap();
}

pub fn init_metrics() -> prometheus::Result<()> {
    REGISTRY.register(Box::new(SYNC_SUCCESS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SYNC_FAILURE_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SYNC_SKIPPED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SNAPSHOTS_SAVED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(LIVE_STATE_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SYNC_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(VEHICLES_IN_BACKOFF.clone()))?;
    REGISTRY.register(Box::new(ALERTS_CREATED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ALERTS_SUPPRESSED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ALERTS_EXPIRED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RETENTION_DELETED_TOTAL.clone()))?;
    REGISTRY.register(Box::new(STORE_RETRIES_TOTAL.clone()))?;
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
