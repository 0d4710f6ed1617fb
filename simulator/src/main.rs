mod telemetry;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use rand::Rng;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use telemetry::{DeviceState, Position};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

const MAX_HISTORY_POINTS: usize = 1_440;

/// Serves simulated vehicle positions over the device gateway REST API.
#[derive(Parser, Debug)]
#[command(name = "gateway-simulator")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SIM_BIND", default_value = "0.0.0.0:9000")]
    bind: String,

    /// Number of simulated devices
    #[arg(long, env = "DEVICES", default_value_t = 100)]
    devices: usize,

    /// IMEI prefix; devices get `<prefix><4-digit index>` starting at 1
    #[arg(long, env = "IMEI_PREFIX", default_value = "35693803564")]
    imei_prefix: String,

    /// Fraction of latest-position requests answered with 503
    #[arg(long, env = "FAILURE_RATE", default_value_t = 0.0)]
    failure_rate: f64,

    /// Expected X-Api-Key header; unchecked when unset
    #[arg(long, env = "GATEWAY_API_KEY")]
    api_key: Option<String>,
}

struct Device {
    state: DeviceState,
    last_step: DateTime<Utc>,
}

#[derive(Clone)]
struct AppState {
    devices: Arc<Mutex<HashMap<String, Device>>>,
    failure_rate: f64,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting gateway simulator");
    info!(
        "Devices: {}, IMEI prefix: {}, failure rate: {:.2}",
        args.devices, args.imei_prefix, args.failure_rate
    );

    let mut rng = rand::thread_rng();
    let now = Utc::now();
    let devices: HashMap<String, Device> = (1..=args.devices)
        .map(|i| {
            let imei = format!("{}{:04}", args.imei_prefix, i);
            let device = Device {
                state: DeviceState::new(imei.clone(), &mut rng),
                last_step: now,
            };
            (imei, device)
        })
        .collect();

    let state = AppState {
        devices: Arc::new(Mutex::new(devices)),
        failure_rate: args.failure_rate.clamp(0.0, 1.0),
        api_key: args.api_key,
    };

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/devices/:imei/latest", get(latest))
        .route("/api/devices/:imei/history", get(history))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", args.bind, e);
            std::process::exit(1);
        });
    info!("Gateway simulator listening on {}", args.bind);

    if let Err(e) = axum::serve(listener, app).await {
        error!("HTTP server error: {}", e);
    }
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    match &state.api_key {
        Some(expected) => headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == expected),
        None => true,
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn latest(
    State(state): State<AppState>,
    Path(imei): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Position>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    let mut rng = rand::thread_rng();
    if rng.gen_bool(state.failure_rate) {
        debug!("Injecting failure for {}", imei);
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let mut devices = state.devices.lock().unwrap_or_else(|e| e.into_inner());
    let device = devices.get_mut(&imei).ok_or(StatusCode::NOT_FOUND)?;

    let now = Utc::now();
    let elapsed = (now - device.last_step).num_milliseconds().max(0) as f64 / 1000.0;
    device.state.step(&mut rng, elapsed);
    device.last_step = now;

    Ok(Json(device.state.position(&mut rng, now)))
}

/// One point per minute over `[from, to]`, walked forward from the current state.
async fn history(
    State(state): State<AppState>,
    Path(imei): Path<String>,
    Query(range): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<Position>>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    if range.to < range.from {
        return Err(StatusCode::BAD_REQUEST);
    }

    let mut walk = {
        let devices = state.devices.lock().unwrap_or_else(|e| e.into_inner());
        devices
            .get(&imei)
            .map(|d| d.state.clone())
            .ok_or(StatusCode::NOT_FOUND)?
    };

    let mut rng = rand::thread_rng();
    let mut points = Vec::new();
    let mut at = range.from;
    while at <= range.to && points.len() < MAX_HISTORY_POINTS {
        points.push(walk.position(&mut rng, at));
        walk.step(&mut rng, 60.0);
        at += Duration::minutes(1);
    }

    Ok(Json(points))
}
