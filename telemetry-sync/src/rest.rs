use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::alerts::types::Alert;
use crate::alerts::{AlertEngine, AlertStatistics};
use crate::errors::Error;
use crate::model::{CompanyId, UserId, VehicleId};
use crate::retention::{RetentionJob, RetentionRunSummary, RetentionStatistics};
use crate::sync::{SyncScheduler, SyncStatistics, VehicleSyncOutcome};

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncScheduler>,
    pub alerts: Arc<AlertEngine>,
    pub retention: Arc<RetentionJob>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AlertListResponse {
    pub data: Vec<Alert>,
    pub total: usize,
}

impl From<Vec<Alert>> for AlertListResponse {
    fn from(data: Vec<Alert>) -> Self {
        Self {
            total: data.len(),
            data,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    user_id: UserId,
    notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetBackoffResponse {
    pub vehicle_id: VehicleId,
    pub reset: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkAcknowledgeResponse {
    pub vehicle_id: VehicleId,
    pub acknowledged: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub update_interval_seconds: u64,
    pub supports_real_time_streaming: bool,
    pub supported_fields: BTreeSet<String>,
    pub connected: bool,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/sync/vehicles/:id", post(sync_vehicle))
        .route("/api/v1/sync/vehicles/:id/reset-backoff", post(reset_backoff))
        .route("/api/v1/sync/stats", get(sync_stats))
        .route("/api/v1/retention/run", post(run_retention))
        .route("/api/v1/retention/stats", get(retention_stats))
        .route("/api/v1/companies/:id/alerts/stats", get(alert_stats))
        .route("/api/v1/companies/:id/alerts/active", get(active_alerts))
        .route("/api/v1/companies/:id/alerts/urgent", get(urgent_alerts))
        .route("/api/v1/vehicles/:id/alerts", get(vehicle_alerts))
        .route("/api/v1/vehicles/:id/alerts/acknowledge", post(acknowledge_vehicle_alerts))
        .route("/api/v1/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/api/v1/alerts/:id/resolve", post(resolve_alert))
        .route("/api/v1/alerts/:id/suppress", post(suppress_alert))
        .route("/api/v1/providers", get(list_providers))
        .with_state(state)
}

async fn sync_vehicle(
    State(state): State<AppState>,
    Path(vehicle_id): Path<VehicleId>,
) -> Result<Json<VehicleSyncOutcome>, AppError> {
    Ok(Json(state.sync.sync_vehicle(vehicle_id).await?))
}

async fn reset_backoff(
    State(state): State<AppState>,
    Path(vehicle_id): Path<VehicleId>,
) -> Json<ResetBackoffResponse> {
    let reset = state.sync.reset_backoff(vehicle_id);
    Json(ResetBackoffResponse { vehicle_id, reset })
}

async fn sync_stats(State(state): State<AppState>) -> Json<SyncStatistics> {
    Json(state.sync.statistics())
}

async fn run_retention(
    State(state): State<AppState>,
) -> Result<Json<RetentionRunSummary>, AppError> {
    Ok(Json(state.retention.run_now().await?))
}

async fn retention_stats(
    State(state): State<AppState>,
) -> Result<Json<RetentionStatistics>, AppError> {
    Ok(Json(state.retention.statistics().await?))
}

async fn alert_stats(
    State(state): State<AppState>,
    Path(company_id): Path<CompanyId>,
) -> Result<Json<AlertStatistics>, AppError> {
    Ok(Json(state.alerts.statistics(company_id).await?))
}

async fn active_alerts(
    State(state): State<AppState>,
    Path(company_id): Path<CompanyId>,
) -> Result<Json<AlertListResponse>, AppError> {
    Ok(Json(state.alerts.active_alerts(company_id).await?.into()))
}

async fn urgent_alerts(
    State(state): State<AppState>,
    Path(company_id): Path<CompanyId>,
) -> Result<Json<AlertListResponse>, AppError> {
    Ok(Json(state.alerts.urgent_alerts(company_id).await?.into()))
}

async fn vehicle_alerts(
    State(state): State<AppState>,
    Path(vehicle_id): Path<VehicleId>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<AlertListResponse>, AppError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    Ok(Json(state.alerts.vehicle_history(vehicle_id, limit).await?.into()))
}

async fn acknowledge_vehicle_alerts(
    State(state): State<AppState>,
    Path(vehicle_id): Path<VehicleId>,
    Json(body): Json<AcknowledgeRequest>,
) -> Result<Json<BulkAcknowledgeResponse>, AppError> {
    let acknowledged = state
        .alerts
        .acknowledge_all_for_vehicle(vehicle_id, body.user_id)
        .await?;
    Ok(Json(BulkAcknowledgeResponse {
        vehicle_id,
        acknowledged,
    }))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
    Json(body): Json<AcknowledgeRequest>,
) -> Result<Json<Alert>, AppError> {
    Ok(Json(state.alerts.acknowledge(alert_id, body.user_id).await?))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
    Json(body): Json<ResolveRequest>,
) -> Result<Json<Alert>, AppError> {
    Ok(Json(
        state
            .alerts
            .resolve(alert_id, body.user_id, body.notes)
            .await?,
    ))
}

async fn suppress_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
) -> Result<Json<Alert>, AppError> {
    Ok(Json(state.alerts.suppress(alert_id).await?))
}

async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderInfo>> {
    let mut providers = Vec::new();
    for provider in state.sync.providers().providers() {
        providers.push(ProviderInfo {
            id: provider.id().to_string(),
            update_interval_seconds: provider.update_interval_seconds(),
            supports_real_time_streaming: provider.supports_real_time_streaming(),
            supported_fields: provider
                .supported_fields()
                .into_iter()
                .map(str::to_string)
                .collect(),
            connected: provider.test_connection().await,
        });
    }
    Json(providers)
}

pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.downcast_ref::<Error>() {
            Some(Error::NotFound { .. }) => StatusCode::NOT_FOUND,
            Some(Error::InvalidTransition { .. }) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("API error: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
