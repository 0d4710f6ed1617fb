//! Persistence collaborators used by the pipeline.
//!
//! The scheduler, alert engine and retention job only see these traits.
//! [`PgStore`] backs them with PostgreSQL; [`MemoryStore`] keeps everything in
//! process and is what the tests and `STORE_BACKEND=memory` use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::alerts::types::{Alert, AlertCount, AlertQuery, AlertStatus, AlertType};
use crate::errors::Result;
use crate::model::{CompanyId, LiveState, Snapshot, TelemetrySource, UserId, Vehicle, VehicleId};

pub mod memory;
pub mod postgres;
mod queries;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait VehicleDirectory: Send + Sync {
    async fn get(&self, id: VehicleId) -> Result<Option<Vehicle>>;

    async fn list_by_sources(&self, sources: &[TelemetrySource]) -> Result<Vec<Vehicle>>;

    async fn update_live_state(&self, id: VehicleId, live: &LiveState) -> Result<()>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Returns the id assigned to the snapshot.
    async fn insert(&self, snapshot: &Snapshot) -> Result<i64>;

    async fn latest_by_vehicle(&self, vehicle_id: VehicleId) -> Result<Option<Snapshot>>;

    async fn range(
        &self,
        vehicle_id: VehicleId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>>;

    async fn count_all(&self) -> Result<u64>;

    async fn count_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Deletes at most `limit` snapshots timestamped strictly before `cutoff`.
    async fn delete_before(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert(&self, alert: &Alert) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Alert>>;

    /// Writes the mutable lifecycle fields of `alert`, but only while the
    /// stored row still has status `expected`. Returns false otherwise.
    async fn update_if_status(&self, alert: &Alert, expected: AlertStatus) -> Result<bool>;

    /// Set-once. Returns false when the flag was already set or the alert is gone.
    async fn mark_notification_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Most recent ACTIVE/ACKNOWLEDGED alert of `alert_type` triggered after `since`.
    async fn find_recent_open(
        &self,
        vehicle_id: VehicleId,
        alert_type: AlertType,
        since: DateTime<Utc>,
    ) -> Result<Option<Alert>>;

    async fn query(&self, query: &AlertQuery) -> Result<Vec<Alert>>;

    /// Bulk ACTIVE -> ACKNOWLEDGED for one vehicle.
    async fn acknowledge_active_for_vehicle(
        &self,
        vehicle_id: VehicleId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Bulk ACTIVE -> `status` for alerts triggered before `cutoff`.
    async fn update_active_before(
        &self,
        cutoff: DateTime<Utc>,
        status: AlertStatus,
    ) -> Result<u64>;

    async fn count_by_company(&self, company_id: CompanyId) -> Result<Vec<AlertCount>>;
}
