use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::queries;
use super::{AlertStore, SnapshotStore, VehicleDirectory};
use crate::alerts::types::{Alert, AlertCount, AlertQuery, AlertStatus, AlertType};
use crate::errors::{Error, Result};
use crate::metrics::STORE_RETRIES_TOTAL;
use crate::model::{
    Acceleration, BatteryStatus, CompanyId, EngineStatus, FuelStatus, LiveState, Location,
    Reading, Snapshot, TelemetrySource, UserId, Vehicle, VehicleId,
};

const MAX_INSERT_ATTEMPTS: u32 = 5;

/// PostgreSQL-backed vehicle directory, snapshot store and alert store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = make_pool(database_url, max_connections).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_snapshot_inner(&self, snapshot: &Snapshot) -> Result<i64> {
        let r = &snapshot.reading;
        let loc = r.location.clone().unwrap_or_default();
        let has_loc = r.location.is_some();
        let battery = r.battery.clone().unwrap_or_default();
        let fuel = r.fuel.clone().unwrap_or_default();
        let engine = r.engine.clone().unwrap_or_default();
        let accel = r.acceleration.as_ref();

        let row = sqlx::query(queries::INSERT_SNAPSHOT)
            .bind(r.vehicle_id)
            .bind(snapshot.company_id)
            .bind(r.device_id.as_deref())
            .bind(r.source.as_str())
            .bind(&snapshot.provider_name)
            .bind(snapshot.timestamp)
            .bind(snapshot.data_quality.as_str())
            .bind(has_loc.then_some(loc.latitude))
            .bind(has_loc.then_some(loc.longitude))
            .bind(loc.altitude)
            .bind(loc.heading)
            .bind(loc.speed)
            .bind(loc.satellites)
            .bind(r.odometer)
            .bind(battery.soc)
            .bind(battery.soh)
            .bind(battery.voltage)
            .bind(battery.current)
            .bind(battery.temperature)
            .bind(battery.is_charging)
            .bind(battery.estimated_range)
            .bind(fuel.level)
            .bind(fuel.percentage)
            .bind(engine.rpm)
            .bind(engine.ignition_on)
            .bind(engine.check_engine_light)
            .bind(accel.map(|a| a.x))
            .bind(accel.map(|a| a.y))
            .bind(accel.map(|a| a.z))
            .bind(r.signal_strength)
            .bind(r.is_estimated)
            .bind(snapshot.created_at)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("id")?)
    }
}

pub async fn make_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| {
            code == "08000" || // connection_exception
            code == "08003" || // connection_does_not_exist
            code == "08006" || // connection_failure
            code == "57P03" || // cannot_connect_now
            code == "53300" // too_many_connections
        }),
        _ => false,
    }
}

fn text<T>(row: &PgRow, column: &str) -> Result<T>
where
    T: FromStr<Err = Error>,
{
    row.try_get::<String, _>(column)?.parse()
}

fn vehicle_from_row(row: &PgRow) -> Result<Vehicle> {
    Ok(Vehicle {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        driver_id: row.try_get("driver_id")?,
        license_plate: row.try_get("license_plate")?,
        status: text(row, "status")?,
        telemetry_source: text(row, "telemetry_source")?,
        device_id: row.try_get("device_id")?,
        oem_vehicle_id: row.try_get("oem_vehicle_id")?,
        make: row.try_get("make")?,
        model: row.try_get("model")?,
        speed_limit_kph: row.try_get("speed_limit_kph")?,
        live: LiveState {
            latitude: row.try_get("latitude")?,
            longitude: row.try_get("longitude")?,
            speed: row.try_get("speed")?,
            battery_level: row.try_get("battery_level")?,
            fuel_level: row.try_get("fuel_level")?,
            odometer: row.try_get("odometer")?,
            last_telemetry_update: row.try_get("last_telemetry_update")?,
            data_quality: text(row, "data_quality")?,
        },
    })
}

fn snapshot_from_row(row: &PgRow) -> Result<Snapshot> {
    let latitude: Option<f64> = row.try_get("latitude")?;
    let longitude: Option<f64> = row.try_get("longitude")?;
    let location = match (latitude, longitude) {
        (Some(latitude), Some(longitude)) => Some(Location {
            latitude,
            longitude,
            altitude: row.try_get("altitude")?,
            heading: row.try_get("heading")?,
            speed: row.try_get("speed")?,
            satellites: row.try_get("satellites")?,
        }),
        _ => None,
    };

    let battery = BatteryStatus {
        soc: row.try_get("battery_soc")?,
        soh: row.try_get("battery_soh")?,
        voltage: row.try_get("battery_voltage")?,
        current: row.try_get("battery_current")?,
        temperature: row.try_get("battery_temperature")?,
        is_charging: row.try_get("battery_is_charging")?,
        estimated_range: row.try_get("battery_estimated_range")?,
    };
    let fuel = FuelStatus {
        level: row.try_get("fuel_level")?,
        percentage: row.try_get("fuel_percentage")?,
    };
    let engine = EngineStatus {
        rpm: row.try_get("engine_rpm")?,
        ignition_on: row.try_get("engine_ignition_on")?,
        check_engine_light: row.try_get("engine_check_light")?,
    };
    let acceleration = match (
        row.try_get::<Option<f64>, _>("accel_x")?,
        row.try_get::<Option<f64>, _>("accel_y")?,
        row.try_get::<Option<f64>, _>("accel_z")?,
    ) {
        (Some(x), Some(y), Some(z)) => Some(Acceleration { x, y, z }),
        _ => None,
    };

    let timestamp: DateTime<Utc> = row.try_get("ts")?;
    let reading = Reading {
        vehicle_id: row.try_get("vehicle_id")?,
        device_id: row.try_get("device_id")?,
        source: text(row, "source")?,
        timestamp: Some(timestamp),
        location,
        odometer: row.try_get("odometer")?,
        battery: (battery != BatteryStatus::default()).then_some(battery),
        fuel: (fuel != FuelStatus::default()).then_some(fuel),
        engine: (engine != EngineStatus::default()).then_some(engine),
        acceleration,
        signal_strength: row.try_get("signal_strength")?,
        is_estimated: row.try_get("is_estimated")?,
    };

    Ok(Snapshot {
        id: row.try_get("id")?,
        company_id: row.try_get("company_id")?,
        provider_name: row.try_get("provider_name")?,
        timestamp,
        data_quality: text(row, "data_quality")?,
        created_at: row.try_get("created_at")?,
        reading,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert> {
    Ok(Alert {
        id: row.try_get("id")?,
        vehicle_id: row.try_get("vehicle_id")?,
        company_id: row.try_get("company_id")?,
        driver_id: row.try_get("driver_id")?,
        alert_type: text(row, "alert_type")?,
        priority: text(row, "priority")?,
        status: text(row, "status")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        current_value: row.try_get("current_value")?,
        threshold_value: row.try_get("threshold_value")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        triggered_at: row.try_get("triggered_at")?,
        acknowledged_at: row.try_get("acknowledged_at")?,
        acknowledged_by: row.try_get("acknowledged_by")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
        resolution_notes: row.try_get("resolution_notes")?,
        notification_sent: row.try_get("notification_sent")?,
        notification_sent_at: row.try_get("notification_sent_at")?,
    })
}

#[async_trait]
impl VehicleDirectory for PgStore {
    async fn get(&self, id: VehicleId) -> Result<Option<Vehicle>> {
        let sql = format!("SELECT {} FROM vehicles WHERE id = $1", queries::VEHICLE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(vehicle_from_row).transpose()
    }

    async fn list_by_sources(&self, sources: &[TelemetrySource]) -> Result<Vec<Vehicle>> {
        let sql = format!(
            "SELECT {} FROM vehicles WHERE telemetry_source = ANY($1) ORDER BY id",
            queries::VEHICLE_COLUMNS
        );
        let sources: Vec<String> = sources.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&sql).bind(&sources).fetch_all(&self.pool).await?;
        rows.iter().map(vehicle_from_row).collect()
    }

    async fn update_live_state(&self, id: VehicleId, live: &LiveState) -> Result<()> {
        let result = sqlx::query(queries::UPDATE_VEHICLE_LIVE_STATE)
            .bind(id)
            .bind(live.latitude)
            .bind(live.longitude)
            .bind(live.speed)
            .bind(live.battery_level)
            .bind(live.fuel_level)
            .bind(live.odometer)
            .bind(live.last_telemetry_update)
            .bind(live.data_quality.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("vehicle", id));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn insert(&self, snapshot: &Snapshot) -> Result<i64> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.insert_snapshot_inner(snapshot).await {
                Ok(id) => return Ok(id),
                Err(Error::Database(db_err))
                    if attempts < MAX_INSERT_ATTEMPTS && is_transient_error(&db_err) =>
                {
                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Snapshot insert failed (attempt {}/{}), retrying in {}ms: {}",
                        attempts, MAX_INSERT_ATTEMPTS, wait_ms, db_err
                    );
                    STORE_RETRIES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                Err(e) => {
                    error!("Snapshot insert failed after {} attempts: {}", attempts, e);
                    return Err(e);
                }
            }
        }
    }

    async fn latest_by_vehicle(&self, vehicle_id: VehicleId) -> Result<Option<Snapshot>> {
        let sql = format!(
            "SELECT {} FROM telemetry_snapshots WHERE vehicle_id = $1 \
             ORDER BY ts DESC, id DESC LIMIT 1",
            queries::SNAPSHOT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(vehicle_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(snapshot_from_row).transpose()
    }

    async fn range(
        &self,
        vehicle_id: VehicleId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>> {
        let sql = format!(
            "SELECT {} FROM telemetry_snapshots \
             WHERE vehicle_id = $1 AND ts >= $2 AND ts <= $3 ORDER BY ts, id",
            queries::SNAPSHOT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(vehicle_id)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn count_all(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(queries::COUNT_SNAPSHOTS)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn count_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(queries::COUNT_SNAPSHOTS_BEFORE)
            .bind(cutoff)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>, limit: u64) -> Result<u64> {
        let result = sqlx::query(queries::DELETE_SNAPSHOTS_BEFORE)
            .bind(cutoff)
            .bind(limit as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AlertStore for PgStore {
    async fn insert(&self, alert: &Alert) -> Result<()> {
        sqlx::query(queries::INSERT_ALERT)
            .bind(alert.id)
            .bind(alert.vehicle_id)
            .bind(alert.company_id)
            .bind(alert.driver_id)
            .bind(alert.alert_type.as_str())
            .bind(alert.priority.as_str())
            .bind(alert.status.as_str())
            .bind(&alert.title)
            .bind(&alert.message)
            .bind(alert.current_value)
            .bind(alert.threshold_value)
            .bind(alert.latitude)
            .bind(alert.longitude)
            .bind(alert.triggered_at)
            .bind(alert.acknowledged_at)
            .bind(alert.acknowledged_by)
            .bind(alert.resolved_at)
            .bind(alert.resolved_by)
            .bind(alert.resolution_notes.as_deref())
            .bind(alert.notification_sent)
            .bind(alert.notification_sent_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Alert>> {
        let sql = format!("SELECT {} FROM vehicle_alerts WHERE id = $1", queries::ALERT_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn update_if_status(&self, alert: &Alert, expected: AlertStatus) -> Result<bool> {
        let result = sqlx::query(queries::UPDATE_ALERT)
            .bind(alert.id)
            .bind(alert.status.as_str())
            .bind(alert.acknowledged_at)
            .bind(alert.acknowledged_by)
            .bind(alert.resolved_at)
            .bind(alert.resolved_by)
            .bind(alert.resolution_notes.as_deref())
            .bind(alert.notification_sent)
            .bind(alert.notification_sent_at)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_notification_sent(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(queries::MARK_NOTIFICATION_SENT)
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_recent_open(
        &self,
        vehicle_id: VehicleId,
        alert_type: AlertType,
        since: DateTime<Utc>,
    ) -> Result<Option<Alert>> {
        let sql = format!(
            "SELECT {} FROM vehicle_alerts \
             WHERE vehicle_id = $1 AND alert_type = $2 AND status IN ('ACTIVE', 'ACKNOWLEDGED') \
             AND triggered_at > $3 ORDER BY triggered_at DESC LIMIT 1",
            queries::ALERT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(vehicle_id)
            .bind(alert_type.as_str())
            .bind(since)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn query(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {} FROM vehicle_alerts WHERE TRUE",
            queries::ALERT_COLUMNS
        ));
        if let Some(company_id) = query.company_id {
            builder.push(" AND company_id = ").push_bind(company_id);
        }
        if let Some(vehicle_id) = query.vehicle_id {
            builder.push(" AND vehicle_id = ").push_bind(vehicle_id);
        }
        if !query.statuses.is_empty() {
            let statuses: Vec<String> =
                query.statuses.iter().map(|s| s.as_str().to_string()).collect();
            builder.push(" AND status = ANY(").push_bind(statuses).push(")");
        }
        if !query.priorities.is_empty() {
            let priorities: Vec<String> =
                query.priorities.iter().map(|p| p.as_str().to_string()).collect();
            builder.push(" AND priority = ANY(").push_bind(priorities).push(")");
        }
        builder.push(" ORDER BY triggered_at DESC");
        if let Some(limit) = query.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn acknowledge_active_for_vehicle(
        &self,
        vehicle_id: VehicleId,
        user_id: UserId,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(queries::ACKNOWLEDGE_ACTIVE_FOR_VEHICLE)
            .bind(vehicle_id)
            .bind(at)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update_active_before(
        &self,
        cutoff: DateTime<Utc>,
        status: AlertStatus,
    ) -> Result<u64> {
        let result = sqlx::query(queries::UPDATE_ACTIVE_BEFORE)
            .bind(cutoff)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_by_company(&self, company_id: CompanyId) -> Result<Vec<AlertCount>> {
        let rows = sqlx::query(queries::COUNT_ALERTS_BY_COMPANY)
            .bind(company_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(AlertCount {
                    alert_type: text(row, "alert_type")?,
                    priority: text(row, "priority")?,
                    status: text(row, "status")?,
                    count: row.try_get::<i64, _>("count")? as u64,
                })
            })
            .collect()
    }
}
