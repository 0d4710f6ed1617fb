use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use super::{AlertStore, SnapshotStore, VehicleDirectory};
use crate::alerts::types::{Alert, AlertCount, AlertPriority, AlertQuery, AlertStatus, AlertType};
use crate::errors::{Error, Result};
use crate::model::{CompanyId, LiveState, Snapshot, TelemetrySource, UserId, Vehicle, VehicleId};

#[derive(Debug, Default)]
struct Inner {
    vehicles: BTreeMap<VehicleId, Vehicle>,
    snapshots: Vec<Snapshot>,
    next_snapshot_id: i64,
    alerts: HashMap<Uuid, Alert>,
}

/// In-process implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vehicles(vehicles: impl IntoIterator<Item = Vehicle>) -> Self {
        let store = Self::new();
        for vehicle in vehicles {
            store.upsert_vehicle(vehicle);
        }
        store
    }

    pub fn upsert_vehicle(&self, vehicle: Vehicle) {
        self.lock().vehicles.insert(vehicle.id, vehicle);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl VehicleDirectory for MemoryStore {
    async fn get(&self, id: VehicleId) -> Result<Option<Vehicle>> {
        Ok(self.lock().vehicles.get(&id).cloned())
    }

    async fn list_by_sources(&self, sources: &[TelemetrySource]) -> Result<Vec<Vehicle>> {
        Ok(self
            .lock()
            .vehicles
            .values()
            .filter(|v| sources.contains(&v.telemetry_source))
            .cloned()
            .collect())
    }

    async fn update_live_state(&self, id: VehicleId, live: &LiveState) -> Result<()> {
        let mut inner = self.lock();
        let vehicle = inner
            .vehicles
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("vehicle", id))?;
        vehicle.live = live.clone();
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn insert(&self, snapshot: &Snapshot) -> Result<i64> {
        let mut inner = self.lock();
        inner.next_snapshot_id += 1;
        let id = inner.next_snapshot_id;
        let mut stored = snapshot.clone();
        stored.id = id;
        inner.snapshots.push(stored);
        Ok(id)
    }

    async fn latest_by_vehicle(&self, vehicle_id: VehicleId) -> Result<Option<Snapshot>> {
        Ok(self
            .lock()
            .snapshots
            .iter()
            .filter(|s| s.vehicle_id() == vehicle_id)
            .max_by_key(|s| (s.timestamp, s.id))
            .cloned())
    }

    async fn range(
        &self,
        vehicle_id: VehicleId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>> {
        let mut found: Vec<Snapshot> = self
            .lock()
            .snapshots
            .iter()
            .filter(|s| s.vehicle_id() == vehicle_id && s.timestamp >= start && s.timestamp <= end)
            .cloned()
            .collect();
        found.sort_by_key(|s| (s.timestamp, s.id));
        Ok(found)
    }

    async fn count_all(&self) -> Result<u64> {
        Ok(self.lock().snapshots.len() as u64)
    }

    async fn count_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(self
            .lock()
            .snapshots
            .iter()
            .filter(|s| s.timestamp < cutoff)
            .count() as u64)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64> {
        let mut inner = self.lock();
        let mut deleted = 0u64;
        inner.snapshots.retain(|s| {
            if deleted < limit && s.timestamp < cutoff {
                deleted += 1;
                false
            } else {
                true
            }
        });
        Ok(deleted)
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn insert(&self, alert: &Alert) -> Result<()> {
        self.lock().alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Alert>> {
        Ok(self.lock().alerts.get(&id).cloned())
    }

    async fn update_if_status(&self, alert: &Alert, expected: AlertStatus) -> Result<bool> {
        let mut inner = self.lock();
        match inner.alerts.get_mut(&alert.id) {
            Some(existing) if existing.status == expected => {
                *existing = alert.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_notification_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock();
        match inner.alerts.get_mut(&id) {
            Some(existing) if !existing.notification_sent => {
                existing.notification_sent = true;
                existing.notification_sent_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_recent_open(
        &self,
        vehicle_id: VehicleId,
        alert_type: AlertType,
        since: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        Ok(self
            .lock()
            .alerts
            .values()
            .filter(|a| {
                a.vehicle_id == vehicle_id
                    && a.alert_type == alert_type
                    && a.status.is_open()
                    && a.triggered_at > since
            })
            .max_by_key(|a| a.triggered_at)
            .cloned())
    }

    async fn query(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let mut found: Vec<Alert> = self
            .lock()
            .alerts
            .values()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn acknowledge_active_for_vehicle(
        &self,
        vehicle_id: VehicleId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.lock();
        let mut updated = 0;
        for alert in inner.alerts.values_mut() {
            if alert.vehicle_id == vehicle_id && alert.status == AlertStatus::Active {
                alert.status = AlertStatus::Acknowledged;
                alert.acknowledged_at = Some(at);
                alert.acknowledged_by = Some(user_id);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn update_active_before(
        &self,
        cutoff: DateTime<Utc>,
        status: AlertStatus,
    ) -> Result<u64> {
        let mut inner = self.lock();
        let mut updated = 0;
        for alert in inner.alerts.values_mut() {
            if alert.status == AlertStatus::Active && alert.triggered_at < cutoff {
                alert.status = status;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn count_by_company(&self, company_id: CompanyId) -> Result<Vec<AlertCount>> {
        let mut grouped: BTreeMap<(AlertType, AlertPriority, AlertStatus), u64> = BTreeMap::new();
        for alert in self.lock().alerts.values().filter(|a| a.company_id == company_id) {
            *grouped
                .entry((alert.alert_type, alert.priority, alert.status))
                .or_default() += 1;
        }
        Ok(grouped
            .into_iter()
            .map(|((alert_type, priority, status), count)| AlertCount {
                alert_type,
                priority,
                status,
                count,
            })
            .collect())
    }
}
