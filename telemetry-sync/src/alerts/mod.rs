//! Alert engine: rule evaluation, dedup and lifecycle.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::AlertConfig;
use crate::errors::{Error, Result};
use crate::metrics::{ALERTS_CREATED_TOTAL, ALERTS_EXPIRED_TOTAL, ALERTS_SUPPRESSED_TOTAL};
use crate::model::{CompanyId, Reading, TelemetrySource, UserId, Vehicle, VehicleId};
use crate::store::{AlertStore, VehicleDirectory};

pub mod rules;
pub mod types;

use rules::AlertCandidate;
use types::{Alert, AlertPriority, AlertQuery, AlertStatus, AlertType};

/// What one evaluation did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationOutcome {
    pub created: Vec<Alert>,
    pub suppressed: Vec<AlertType>,
}

impl EvaluationOutcome {
    fn merge(&mut self, other: EvaluationOutcome) {
        self.created.extend(other.created);
        self.suppressed.extend(other.suppressed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertStatistics {
    pub company_id: CompanyId,
    pub total: u64,
    pub active: u64,
    pub urgent: u64,
    pub by_status: BTreeMap<AlertStatus, u64>,
    pub by_priority: BTreeMap<AlertPriority, u64>,
    pub by_type: BTreeMap<AlertType, u64>,
}

pub struct AlertEngine {
    store: Arc<dyn AlertStore>,
    vehicles: Arc<dyn VehicleDirectory>,
    clock: Arc<dyn Clock>,
    config: AlertConfig,
    /// Held across the dedup lookup and the insert for one vehicle.
    raise_locks: Mutex<HashMap<VehicleId, Arc<tokio::sync::Mutex<()>>>>,
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn AlertStore>,
        vehicles: Arc<dyn VehicleDirectory>,
        clock: Arc<dyn Clock>,
        config: AlertConfig,
    ) -> Self {
        Self {
            store,
            vehicles,
            clock,
            config,
            raise_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Evaluate a fresh reading against the rule table.
    pub async fn evaluate(
        &self,
        vehicle: &Vehicle,
        reading: &Reading,
    ) -> Result<EvaluationOutcome> {
        let candidates = rules::evaluate_reading(vehicle, reading, &self.config.thresholds);
        let mut outcome = EvaluationOutcome::default();
        for candidate in candidates {
            outcome.merge(self.raise(vehicle, candidate, Some(reading)).await?);
        }
        Ok(outcome)
    }

    /// Raise CONNECTION_LOST for polled vehicles that went silent.
    pub async fn check_connection_lost(&self) -> Result<EvaluationOutcome> {
        let now = self.clock.now();
        let vehicles = self.vehicles.list_by_sources(&TelemetrySource::POLLED).await?;
        let mut outcome = EvaluationOutcome::default();

        for vehicle in vehicles.iter().filter(|v| v.is_sync_eligible()) {
            let gap = self.config.connection_gap;
            if let Some(candidate) = rules::connection_lost(vehicle, now, gap) {
                match self.raise(vehicle, candidate, None).await {
                    Ok(o) => outcome.merge(o),
                    Err(e) => warn!("Connection check failed for vehicle {}: {}", vehicle.id, e),
                }
            }
        }
        Ok(outcome)
    }

    fn raise_lock(&self, vehicle_id: VehicleId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.raise_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(vehicle_id).or_default())
    }

    async fn raise(
        &self,
        vehicle: &Vehicle,
        candidate: AlertCandidate,
        reading: Option<&Reading>,
    ) -> Result<EvaluationOutcome> {
        let lock = self.raise_lock(vehicle.id);
        let _guard = lock.lock().await;

        let now = self.clock.now();
        let since = now - self.config.cooldown;
        let mut outcome = EvaluationOutcome::default();

        if let Some(existing) = self
            .store
            .find_recent_open(vehicle.id, candidate.alert_type, since)
            .await?
        {
            debug!(
                "Suppressing {} for vehicle {}: alert {} still open",
                candidate.alert_type, vehicle.id, existing.id
            );
            ALERTS_SUPPRESSED_TOTAL.inc();
            outcome.suppressed.push(candidate.alert_type);
            return Ok(outcome);
        }

        let location = reading
            .and_then(|r| r.location.as_ref())
            .map(|l| (l.latitude, l.longitude))
            .or(vehicle.live.latitude.zip(vehicle.live.longitude));

        let alert = Alert {
            id: Uuid::new_v4(),
            vehicle_id: vehicle.id,
            company_id: vehicle.company_id,
            driver_id: vehicle.driver_id,
            alert_type: candidate.alert_type,
            priority: candidate.priority,
            status: AlertStatus::Active,
            title: candidate.alert_type.title().to_string(),
            message: candidate.message,
            current_value: candidate.current_value,
            threshold_value: candidate.threshold_value,
            latitude: location.map(|(lat, _)| lat),
            longitude: location.map(|(_, lon)| lon),
            triggered_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            resolution_notes: None,
            notification_sent: false,
            notification_sent_at: None,
        };

        self.store.insert(&alert).await?;
        ALERTS_CREATED_TOTAL
            .with_label_values(&[alert.alert_type.as_str()])
            .inc();
        info!(
            "Raised {} ({}) for vehicle {}: {}",
            alert.alert_type, alert.priority, alert.vehicle_id, alert.message
        );
        outcome.created.push(alert);
        Ok(outcome)
    }

    async fn load(&self, alert_id: Uuid) -> Result<Alert> {
        self.store
            .get(alert_id)
            .await?
            .ok_or_else(|| Error::not_found("alert", alert_id))
    }

    fn invalid(from: AlertStatus, to: AlertStatus) -> Error {
        Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Stores `next` only if the row still has status `from`; a concurrent
    /// writer that got there first turns this into an invalid transition.
    async fn transition(&self, next: Alert, from: AlertStatus) -> Result<Alert> {
        if self.store.update_if_status(&next, from).await? {
            return Ok(next);
        }
        let current = self.load(next.id).await?;
        Err(Self::invalid(current.status, next.status))
    }

    /// ACTIVE -> ACKNOWLEDGED.
    pub async fn acknowledge(&self, alert_id: Uuid, user_id: UserId) -> Result<Alert> {
        let mut alert = self.load(alert_id).await?;
        let from = alert.status;
        if from != AlertStatus::Active {
            return Err(Self::invalid(from, AlertStatus::Acknowledged));
        }
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_at = Some(self.clock.now());
        alert.acknowledged_by = Some(user_id);
        self.transition(alert, from).await
    }

    /// ACTIVE | ACKNOWLEDGED -> RESOLVED.
    pub async fn resolve(
        &self,
        alert_id: Uuid,
        user_id: UserId,
        notes: Option<String>,
    ) -> Result<Alert> {
        let mut alert = self.load(alert_id).await?;
        let from = alert.status;
        if !from.is_open() {
            return Err(Self::invalid(from, AlertStatus::Resolved));
        }
        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(self.clock.now());
        alert.resolved_by = Some(user_id);
        alert.resolution_notes = notes;
        self.transition(alert, from).await
    }

    /// ACTIVE | ACKNOWLEDGED -> SUPPRESSED.
    pub async fn suppress(&self, alert_id: Uuid) -> Result<Alert> {
        let mut alert = self.load(alert_id).await?;
        let from = alert.status;
        if !from.is_open() {
            return Err(Self::invalid(from, AlertStatus::Suppressed));
        }
        alert.status = AlertStatus::Suppressed;
        let suppressed = self.transition(alert, from).await?;
        info!(
            "Alert {} suppressed for vehicle {}",
            suppressed.id, suppressed.vehicle_id
        );
        Ok(suppressed)
    }

    pub async fn acknowledge_all_for_vehicle(
        &self,
        vehicle_id: VehicleId,
        user_id: UserId,
    ) -> Result<u64> {
        let updated = self
            .store
            .acknowledge_active_for_vehicle(vehicle_id, user_id, self.clock.now())
            .await?;
        info!(
            "User {} acknowledged {} alert(s) for vehicle {}",
            user_id, updated, vehicle_id
        );
        Ok(updated)
    }

    /// ACTIVE alerts older than the configured max age become EXPIRED.
    pub async fn expire_stale(&self) -> Result<u64> {
        let cutoff = self.clock.now() - self.config.max_age;
        let expired = self
            .store
            .update_active_before(cutoff, AlertStatus::Expired)
            .await?;
        if expired > 0 {
            ALERTS_EXPIRED_TOTAL.inc_by(expired as f64);
            info!("Expired {} stale alert(s) triggered before {}", expired, cutoff);
        }
        Ok(expired)
    }

    /// Set-once: a second call keeps the first timestamp.
    pub async fn mark_notification_sent(&self, alert_id: Uuid) -> Result<Alert> {
        if self
            .store
            .mark_notification_sent(alert_id, self.clock.now())
            .await?
        {
            debug!("Notification recorded for alert {}", alert_id);
        }
        self.load(alert_id).await
    }

    pub async fn active_alerts(&self, company_id: CompanyId) -> Result<Vec<Alert>> {
        self.store
            .query(&AlertQuery {
                company_id: Some(company_id),
                statuses: vec![AlertStatus::Active],
                ..Default::default()
            })
            .await
    }

    pub async fn urgent_alerts(&self, company_id: CompanyId) -> Result<Vec<Alert>> {
        self.store
            .query(&AlertQuery {
                company_id: Some(company_id),
                statuses: vec![AlertStatus::Active],
                priorities: AlertPriority::URGENT.to_vec(),
                ..Default::default()
            })
            .await
    }

    pub async fn vehicle_history(
        &self,
        vehicle_id: VehicleId,
        limit: usize,
    ) -> Result<Vec<Alert>> {
        self.store
            .query(&AlertQuery {
                vehicle_id: Some(vehicle_id),
                limit: Some(limit),
                ..Default::default()
            })
            .await
    }

    pub async fn statistics(&self, company_id: CompanyId) -> Result<AlertStatistics> {
        let rows = self.store.count_by_company(company_id).await?;
        let mut stats = AlertStatistics {
            company_id,
            ..Default::default()
        };
        for row in rows {
            stats.total += row.count;
            *stats.by_status.entry(row.status).or_default() += row.count;
            *stats.by_priority.entry(row.priority).or_default() += row.count;
            *stats.by_type.entry(row.alert_type).or_default() += row.count;
            if row.status == AlertStatus::Active {
                stats.active += row.count;
                if row.priority.is_urgent() {
                    stats.urgent += row.count;
                }
            }
        }
        Ok(stats)
    }

    /// One pass of the periodic sweep: connection check, then expiry.
    pub async fn sweep(&self) -> Result<(EvaluationOutcome, u64)> {
        let outcome = self.check_connection_lost().await?;
        let expired = self.expire_stale().await?;
        Ok((outcome, expired))
    }
}

pub async fn run_alert_sweep_loop(engine: Arc<AlertEngine>) {
    let period = engine.config().sweep_interval;
    info!("Starting alert sweep every {:?}", period);

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match engine.sweep().await {
            Ok((outcome, expired)) => debug!(
                "Alert sweep: {} connection alert(s), {} suppressed, {} expired",
                outcome.created.len(),
                outcome.suppressed.len(),
                expired
            ),
            Err(e) => error!("Alert sweep failed: {}", e),
        }
    }
}
