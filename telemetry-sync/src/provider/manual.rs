use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

use super::TelemetryProvider;
use crate::errors::Result;
use crate::model::{BatteryStatus, FuelStatus, Location, Reading, TelemetrySource, Vehicle};

/// Reads the last known values stored on the vehicle itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct ManualProvider;

impl ManualProvider {
    pub fn new() -> Self {
        Self
    }

    fn reading_from_vehicle(vehicle: &Vehicle) -> Option<Reading> {
        let live = &vehicle.live;
        if !live.has_values() {
            return None;
        }

        let mut reading = Reading::new(vehicle.id, TelemetrySource::Manual);
        reading.device_id = vehicle.device_id.clone();
        reading.timestamp = live.last_telemetry_update;
        reading.is_estimated = true;
        reading.odometer = live.odometer;
        if let (Some(latitude), Some(longitude)) = (live.latitude, live.longitude) {
            reading.location = Some(Location {
                latitude,
                longitude,
                speed: live.speed,
                ..Default::default()
            });
        }
        if live.battery_level.is_some() {
            reading.battery = Some(BatteryStatus {
                soc: live.battery_level,
                ..Default::default()
            });
        }
        if live.fuel_level.is_some() {
            reading.fuel = Some(FuelStatus {
                level: None,
                percentage: live.fuel_level,
            });
        }
        Some(reading)
    }
}

#[async_trait]
impl TelemetryProvider for ManualProvider {
    fn id(&self) -> &'static str {
        "manual"
    }

    fn supports(&self, _vehicle: &Vehicle) -> bool {
        true
    }

    async fn fetch_latest(&self, vehicle: &Vehicle) -> Result<Option<Reading>> {
        Ok(Self::reading_from_vehicle(vehicle))
    }

    async fn fetch_historical(
        &self,
        vehicle: &Vehicle,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        // Only one value is ever known: the current one.
        Ok(Self::reading_from_vehicle(vehicle)
            .filter(|r| r.timestamp.is_some_and(|ts| ts >= start && ts <= end))
            .into_iter()
            .collect())
    }

    async fn test_connection(&self) -> bool {
        true
    }

    fn update_interval_seconds(&self) -> u64 {
        0
    }

    fn supported_fields(&self) -> BTreeSet<&'static str> {
        ["location", "odometer", "battery.soc", "fuel.percentage"]
            .into_iter()
            .collect()
    }
}
