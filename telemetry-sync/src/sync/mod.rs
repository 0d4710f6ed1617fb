//! Periodic telemetry sync.
//!
//! Every run walks the polled vehicles one at a time, asks the resolved
//! provider for the latest reading and turns it into a snapshot, a live-state
//! update and an alert evaluation. A failing vehicle only backs itself off.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::alerts::AlertEngine;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::errors::{Error, Result};
use crate::metrics::{
    LIVE_STATE_FAILURES_TOTAL, SNAPSHOTS_SAVED_TOTAL, SYNC_DURATION_SECONDS, SYNC_FAILURE_TOTAL,
    SYNC_SKIPPED_TOTAL, SYNC_SUCCESS_TOTAL, VEHICLES_IN_BACKOFF,
};
use crate::model::{DataQuality, Reading, Snapshot, TelemetrySource, Vehicle, VehicleId};
use crate::provider::ProviderRegistry;
use crate::store::{SnapshotStore, VehicleDirectory};

pub mod backoff;

pub use backoff::{BackoffPolicy, BackoffTracker, VehicleSyncState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Error,
    NoData,
    Timeout,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Error => "error",
            FailureReason::NoData => "no_data",
            FailureReason::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VehicleSyncOutcome {
    Synced {
        vehicle_id: VehicleId,
        provider: String,
        snapshot_id: i64,
        data_quality: DataQuality,
        /// False when the snapshot was saved but the vehicle record was not.
        live_state_updated: bool,
        alerts_created: usize,
    },
    Failed {
        vehicle_id: VehicleId,
        provider: String,
        reason: FailureReason,
        error: String,
        retry_after: DateTime<Utc>,
    },
    Skipped {
        vehicle_id: VehicleId,
    },
}

/// What got written for one successful fetch.
struct Persisted {
    snapshot_id: i64,
    data_quality: DataQuality,
    live_state_updated: bool,
    alerts_created: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncRunSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub eligible: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
struct SyncTotals {
    runs: u64,
    succeeded: u64,
    failed: u64,
    skipped: u64,
    last_run: Option<SyncRunSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailingVehicle {
    pub vehicle_id: VehicleId,
    #[serde(flatten)]
    pub state: VehicleSyncState,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatistics {
    pub enabled: bool,
    pub interval_secs: u64,
    pub total_runs: u64,
    pub total_succeeded: u64,
    pub total_failed: u64,
    pub total_skipped: u64,
    pub vehicles_in_backoff: usize,
    pub last_run: Option<SyncRunSummary>,
    pub failing_vehicles: Vec<FailingVehicle>,
}

pub struct SyncScheduler {
    vehicles: Arc<dyn VehicleDirectory>,
    snapshots: Arc<dyn SnapshotStore>,
    providers: ProviderRegistry,
    alerts: Arc<AlertEngine>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    backoff: BackoffTracker,
    totals: Mutex<SyncTotals>,
}

impl SyncScheduler {
    pub fn new(
        vehicles: Arc<dyn VehicleDirectory>,
        snapshots: Arc<dyn SnapshotStore>,
        providers: ProviderRegistry,
        alerts: Arc<AlertEngine>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let backoff = BackoffTracker::new(BackoffPolicy::from(&config));
        Self {
            vehicles,
            snapshots,
            providers,
            alerts,
            clock,
            config,
            backoff,
            totals: Mutex::new(SyncTotals::default()),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn backoff_state(&self, vehicle_id: VehicleId) -> Option<VehicleSyncState> {
        self.backoff.state(vehicle_id)
    }

    /// One pass over every eligible vehicle.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started = Instant::now();
        let started_at = self.clock.now();

        let vehicles: Vec<Vehicle> = self
            .vehicles
            .list_by_sources(&TelemetrySource::POLLED)
            .await?
            .into_iter()
            .filter(Vehicle::is_sync_eligible)
            .collect();

        let mut summary = SyncRunSummary {
            started_at: Some(started_at),
            eligible: vehicles.len(),
            ..Default::default()
        };
        let batch_size = self.config.batch_size.max(1);

        for (index, vehicle) in vehicles.iter().enumerate() {
            let outcome = if self.backoff.should_skip(vehicle.id, self.clock.now()) {
                debug!("Vehicle {} is in backoff, skipping", vehicle.id);
                SYNC_SKIPPED_TOTAL.inc();
                VehicleSyncOutcome::Skipped {
                    vehicle_id: vehicle.id,
                }
            } else {
                self.attempt(vehicle).await
            };
            match outcome {
                VehicleSyncOutcome::Synced { .. } => summary.succeeded += 1,
                VehicleSyncOutcome::Failed { .. } => summary.failed += 1,
                VehicleSyncOutcome::Skipped { .. } => summary.skipped += 1,
            }

            if (index + 1) % batch_size == 0 && index + 1 < vehicles.len() {
                debug!("Sync progress: {}/{} vehicles", index + 1, vehicles.len());
            }
        }

        let elapsed = started.elapsed();
        SYNC_DURATION_SECONDS.observe(elapsed.as_secs_f64());
        VEHICLES_IN_BACKOFF.set(self.backoff.in_backoff_count(self.clock.now()) as f64);
        summary.duration_ms = elapsed.as_millis() as u64;

        info!(
            "Sync run finished in {}ms: {} eligible, {} synced, {} failed, {} skipped",
            summary.duration_ms,
            summary.eligible,
            summary.succeeded,
            summary.failed,
            summary.skipped
        );

        let mut totals = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        totals.runs += 1;
        totals.succeeded += summary.succeeded as u64;
        totals.failed += summary.failed as u64;
        totals.skipped += summary.skipped as u64;
        totals.last_run = Some(summary.clone());

        Ok(summary)
    }

    /// Sync one vehicle now, regardless of its backoff window.
    pub async fn sync_vehicle(&self, vehicle_id: VehicleId) -> Result<VehicleSyncOutcome> {
        let vehicle = self
            .vehicles
            .get(vehicle_id)
            .await?
            .ok_or_else(|| Error::not_found("vehicle", vehicle_id))?;
        let outcome = self.attempt(&vehicle).await;
        VEHICLES_IN_BACKOFF.set(self.backoff.in_backoff_count(self.clock.now()) as f64);
        Ok(outcome)
    }

    /// Clears failure state so the next run tries the vehicle again.
    pub fn reset_backoff(&self, vehicle_id: VehicleId) -> bool {
        let had_state = self.backoff.reset(vehicle_id);
        if had_state {
            info!("Backoff reset for vehicle {}", vehicle_id);
        }
        VEHICLES_IN_BACKOFF.set(self.backoff.in_backoff_count(self.clock.now()) as f64);
        had_state
    }

    pub fn statistics(&self) -> SyncStatistics {
        let totals = self
            .totals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        SyncStatistics {
            enabled: self.config.enabled,
            interval_secs: self.config.interval.as_secs(),
            total_runs: totals.runs,
            total_succeeded: totals.succeeded,
            total_failed: totals.failed,
            total_skipped: totals.skipped,
            vehicles_in_backoff: self.backoff.in_backoff_count(self.clock.now()),
            last_run: totals.last_run,
            failing_vehicles: self
                .backoff
                .failing()
                .into_iter()
                .map(|(vehicle_id, state)| FailingVehicle { vehicle_id, state })
                .collect(),
        }
    }

    async fn attempt(&self, vehicle: &Vehicle) -> VehicleSyncOutcome {
        let provider = self.providers.resolve(vehicle);
        let provider_id = provider.id();

        let fetched = timeout(self.config.provider_timeout, provider.fetch_latest(vehicle)).await;
        let result = match fetched {
            Err(_) => Err((
                FailureReason::Timeout,
                Error::Timeout {
                    provider: provider_id,
                    timeout_ms: self.config.provider_timeout.as_millis() as u64,
                }
                .to_string(),
            )),
            Ok(Err(e)) => Err((FailureReason::Error, e.to_string())),
            Ok(Ok(None)) => Err((
                FailureReason::NoData,
                format!("Provider {} returned no data", provider_id),
            )),
            Ok(Ok(Some(reading))) => self
                .persist(vehicle, provider_id, reading)
                .await
                .map_err(|e| (FailureReason::Error, e.to_string())),
        };

        let now = self.clock.now();
        match result {
            Ok(persisted) => {
                self.backoff.record_success(vehicle.id, now);
                SYNC_SUCCESS_TOTAL.inc();
                debug!(
                    "Vehicle {} synced via {} (snapshot {}, {})",
                    vehicle.id, provider_id, persisted.snapshot_id, persisted.data_quality
                );
                VehicleSyncOutcome::Synced {
                    vehicle_id: vehicle.id,
                    provider: provider_id.to_string(),
                    snapshot_id: persisted.snapshot_id,
                    data_quality: persisted.data_quality,
                    live_state_updated: persisted.live_state_updated,
                    alerts_created: persisted.alerts_created,
                }
            }
            Err((reason, message)) => {
                let delay = self.backoff.record_failure(vehicle.id, now, message.clone());
                SYNC_FAILURE_TOTAL.with_label_values(&[reason.as_str()]).inc();
                warn!(
                    "Sync failed for vehicle {} via {} ({}): {}; retry in {}s",
                    vehicle.id,
                    provider_id,
                    reason.as_str(),
                    message,
                    delay.num_seconds()
                );
                VehicleSyncOutcome::Failed {
                    vehicle_id: vehicle.id,
                    provider: provider_id.to_string(),
                    reason,
                    error: message,
                    retry_after: now + delay,
                }
            }
        }
    }

    async fn persist(
        &self,
        vehicle: &Vehicle,
        provider_id: &str,
        reading: Reading,
    ) -> Result<Persisted> {
        let now = self.clock.now();
        let mut snapshot = Snapshot::from_reading(reading, vehicle.company_id, provider_id, now);
        snapshot.id = self.snapshots.insert(&snapshot).await?;
        SNAPSHOTS_SAVED_TOTAL.inc();

        // The snapshot is stored from here on, so nothing below fails the attempt.
        let mut updated = vehicle.clone();
        updated.live = vehicle
            .live
            .merged_with(&snapshot.reading, snapshot.data_quality, now);
        let live_state_updated =
            match self.vehicles.update_live_state(vehicle.id, &updated.live).await {
                Ok(()) => true,
                Err(e) => {
                    LIVE_STATE_FAILURES_TOTAL.inc();
                    warn!(
                        "Snapshot {} saved but live state update failed for vehicle {}: {}",
                        snapshot.id, vehicle.id, e
                    );
                    false
                }
            };

        let alerts_created = match self.alerts.evaluate(&updated, &snapshot.reading).await {
            Ok(outcome) => outcome.created.len(),
            Err(e) => {
                warn!("Alert evaluation failed for vehicle {}: {}", vehicle.id, e);
                0
            }
        };

        Ok(Persisted {
            snapshot_id: snapshot.id,
            data_quality: snapshot.data_quality,
            live_state_updated,
            alerts_created,
        })
    }
}

pub async fn run_sync_loop(scheduler: Arc<SyncScheduler>) {
    let period = scheduler.config().interval;
    info!("Starting telemetry sync every {:?}", period);

    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = scheduler.run_once().await {
            error!("Sync run failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::AlertConfig;
    use crate::model::{BatteryStatus, LiveState, VehicleStatus};
    use crate::provider::TelemetryProvider;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::time::Duration;

    /// Answers every fetch the same way, optionally after a delay.
    struct FixedProvider {
        soc: Option<f64>,
        fail: bool,
        delay: Duration,
    }

    #[async_trait]
    impl TelemetryProvider for FixedProvider {
        fn id(&self) -> &'static str {
            "fixed"
        }

        fn supports(&self, vehicle: &Vehicle) -> bool {
            vehicle.telemetry_source == TelemetrySource::Device
        }

        async fn fetch_latest(&self, vehicle: &Vehicle) -> Result<Option<Reading>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::provider("fixed", "boom"));
            }
            Ok(self.soc.map(|soc| {
                let mut reading = Reading::new(vehicle.id, TelemetrySource::Device);
                reading.battery = Some(BatteryStatus {
                    soc: Some(soc),
                    ..Default::default()
                });
                reading
            }))
        }

        async fn fetch_historical(
            &self,
            _vehicle: &Vehicle,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<Reading>> {
            Ok(Vec::new())
        }

        async fn test_connection(&self) -> bool {
            true
        }

        fn update_interval_seconds(&self) -> u64 {
            1
        }

        fn supported_fields(&self) -> BTreeSet<&'static str> {
            BTreeSet::from(["battery.soc"])
        }
    }

    fn vehicle(id: VehicleId, status: VehicleStatus) -> Vehicle {
        Vehicle {
            id,
            company_id: 1,
            driver_id: None,
            license_plate: format!("S-{}", id),
            status,
            telemetry_source: TelemetrySource::Device,
            device_id: Some(format!("{}", 860_000 + id)),
            oem_vehicle_id: None,
            make: None,
            model: None,
            speed_limit_kph: None,
            live: LiveState::default(),
        }
    }

    fn scheduler(
        store: Arc<MemoryStore>,
        provider: FixedProvider,
        config: SyncConfig,
    ) -> SyncScheduler {
        scheduler_with_directory(store.clone(), store, provider, config)
    }

    fn scheduler_with_directory(
        directory: Arc<dyn VehicleDirectory>,
        store: Arc<MemoryStore>,
        provider: FixedProvider,
        config: SyncConfig,
    ) -> SyncScheduler {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let engine = Arc::new(AlertEngine::new(
            store.clone(),
            directory.clone(),
            clock.clone(),
            AlertConfig::default(),
        ));
        SyncScheduler::new(
            directory,
            store,
            ProviderRegistry::new(vec![Arc::new(provider)]),
            engine,
            clock,
            config,
        )
    }

    /// Reads from the wrapped store but refuses every live-state write.
    struct ReadOnlyVehicles(Arc<MemoryStore>);

    #[async_trait]
    impl VehicleDirectory for ReadOnlyVehicles {
        async fn get(&self, id: VehicleId) -> Result<Option<Vehicle>> {
            VehicleDirectory::get(self.0.as_ref(), id).await
        }

        async fn list_by_sources(&self, sources: &[TelemetrySource]) -> Result<Vec<Vehicle>> {
            self.0.list_by_sources(sources).await
        }

        async fn update_live_state(&self, id: VehicleId, _live: &LiveState) -> Result<()> {
            Err(Error::InvalidValue(format!("vehicle {} is read-only", id)))
        }
    }

    #[tokio::test]
    async fn test_inactive_vehicles_not_eligible() {
        let store = Arc::new(MemoryStore::with_vehicles([
            vehicle(1, VehicleStatus::Active),
            vehicle(2, VehicleStatus::Inactive),
            vehicle(3, VehicleStatus::Maintenance),
        ]));
        let provider = FixedProvider {
            soc: Some(80.0),
            fail: false,
            delay: Duration::ZERO,
        };
        let scheduler = scheduler(store.clone(), provider, SyncConfig::default());

        let summary = scheduler.run_once().await.unwrap();
        assert_eq!(summary.eligible, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(SnapshotStore::count_all(store.as_ref()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let store = Arc::new(MemoryStore::with_vehicles([vehicle(1, VehicleStatus::Active)]));
        let provider = FixedProvider {
            soc: Some(80.0),
            fail: false,
            delay: Duration::from_millis(500),
        };
        let config = SyncConfig {
            provider_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let scheduler = scheduler(store.clone(), provider, config);

        match scheduler.sync_vehicle(1).await.unwrap() {
            VehicleSyncOutcome::Failed { reason, .. } => assert_eq!(reason, FailureReason::Timeout),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(scheduler.backoff_state(1).unwrap().consecutive_failures, 1);
        assert_eq!(SnapshotStore::count_all(store.as_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_error_and_empty_share_backoff() {
        let store = Arc::new(MemoryStore::with_vehicles([vehicle(1, VehicleStatus::Active)]));
        let failing = scheduler(
            store.clone(),
            FixedProvider {
                soc: None,
                fail: true,
                delay: Duration::ZERO,
            },
            SyncConfig::default(),
        );
        let empty = scheduler(
            store.clone(),
            FixedProvider {
                soc: None,
                fail: false,
                delay: Duration::ZERO,
            },
            SyncConfig::default(),
        );

        let a = failing.sync_vehicle(1).await.unwrap();
        let b = empty.sync_vehicle(1).await.unwrap();
        match (a, b) {
            (
                VehicleSyncOutcome::Failed { reason: ra, .. },
                VehicleSyncOutcome::Failed { reason: rb, .. },
            ) => {
                assert_eq!(ra, FailureReason::Error);
                assert_eq!(rb, FailureReason::NoData);
            }
            other => panic!("expected two failures, got {:?}", other),
        }
        let retry_in = |state: VehicleSyncState| {
            state.next_allowed_attempt.unwrap() - state.last_attempt.unwrap()
        };
        assert_eq!(
            retry_in(failing.backoff_state(1).unwrap()),
            retry_in(empty.backoff_state(1).unwrap())
        );
    }

    #[tokio::test]
    async fn test_sync_vehicle_unknown_id() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = scheduler(
            store,
            FixedProvider {
                soc: Some(50.0),
                fail: false,
                delay: Duration::ZERO,
            },
            SyncConfig::default(),
        );
        assert!(matches!(
            scheduler.sync_vehicle(404).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_success_updates_live_state_and_alerts() {
        let store = Arc::new(MemoryStore::with_vehicles([vehicle(1, VehicleStatus::InUse)]));
        let scheduler = scheduler(
            store.clone(),
            FixedProvider {
                soc: Some(12.0),
                fail: false,
                delay: Duration::ZERO,
            },
            SyncConfig::default(),
        );

        match scheduler.sync_vehicle(1).await.unwrap() {
            VehicleSyncOutcome::Synced {
                provider,
                alerts_created,
                data_quality,
                ..
            } => {
                assert_eq!(provider, "fixed");
                assert_eq!(alerts_created, 1);
                assert_eq!(data_quality, DataQuality::Unknown);
            }
            other => panic!("expected success, got {:?}", other),
        }

        let live = VehicleDirectory::get(store.as_ref(), 1).await.unwrap().unwrap().live;
        assert_eq!(live.battery_level, Some(12.0));
        assert!(live.last_telemetry_update.is_some());

        let stats = scheduler.statistics();
        assert!(stats.failing_vehicles.is_empty());
        assert_eq!(stats.total_runs, 0);
    }

    #[tokio::test]
    async fn test_live_state_failure_keeps_snapshot_without_backoff() {
        let store = Arc::new(MemoryStore::with_vehicles([vehicle(1, VehicleStatus::Active)]));
        let scheduler = scheduler_with_directory(
            Arc::new(ReadOnlyVehicles(store.clone())),
            store.clone(),
            FixedProvider {
                soc: Some(15.0),
                fail: false,
                delay: Duration::ZERO,
            },
            SyncConfig::default(),
        );

        match scheduler.sync_vehicle(1).await.unwrap() {
            VehicleSyncOutcome::Synced {
                live_state_updated,
                alerts_created,
                ..
            } => {
                assert!(!live_state_updated);
                assert_eq!(alerts_created, 1);
            }
            other => panic!("expected success, got {:?}", other),
        }

        assert_eq!(SnapshotStore::count_all(store.as_ref()).await.unwrap(), 1);
        let state = scheduler.backoff_state(1).unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.next_allowed_attempt.is_none());
        let live = VehicleDirectory::get(store.as_ref(), 1).await.unwrap().unwrap().live;
        assert_eq!(live, LiveState::default());
    }
}
