use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub type VehicleId = i64;
pub type CompanyId = i64;
pub type UserId = i64;

text_enum! {
    /// Where a vehicle's telemetry comes from.
    pub enum TelemetrySource {
        Device => "DEVICE",
        OemApi => "OEM_API",
        Manual => "MANUAL",
        None => "NONE",
    }
}

impl TelemetrySource {
    /// Sources the scheduler polls. Manual vehicles have nothing external to poll.
    pub const POLLED: [TelemetrySource; 2] = [TelemetrySource::Device, TelemetrySource::OemApi];

    pub fn is_polled(&self) -> bool {
        Self::POLLED.contains(self)
    }
}

text_enum! {
    pub enum VehicleStatus {
        Active => "ACTIVE",
        Inactive => "INACTIVE",
        Maintenance => "MAINTENANCE",
        Charging => "CHARGING",
        InUse => "IN_USE",
    }
}

text_enum! {
    /// Freshness of a reading relative to the moment it was synced.
    pub enum DataQuality {
        RealTime => "REAL_TIME",
        Recent => "RECENT",
        Stale => "STALE",
        Unknown => "UNKNOWN",
    }
}

impl DataQuality {
    pub fn classify(timestamp: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let Some(ts) = timestamp else {
            return DataQuality::Unknown;
        };
        let age = now.signed_duration_since(ts);
        if age < Duration::minutes(5) {
            DataQuality::RealTime
        } else if age < Duration::minutes(30) {
            DataQuality::Recent
        } else {
            DataQuality::Stale
        }
    }
}

impl Default for DataQuality {
    fn default() -> Self {
        DataQuality::Unknown
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    /// km/h
    pub speed: Option<f64>,
    pub satellites: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    pub soc: Option<f64>,
    pub soh: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub temperature: Option<f64>,
    pub is_charging: Option<bool>,
    pub estimated_range: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FuelStatus {
    /// Litres.
    pub level: Option<f64>,
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub rpm: Option<f64>,
    pub ignition_on: Option<bool>,
    pub check_engine_light: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acceleration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Normalized telemetry produced by any provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub vehicle_id: VehicleId,
    pub device_id: Option<String>,
    pub source: TelemetrySource,
    pub timestamp: Option<DateTime<Utc>>,
    pub location: Option<Location>,
    /// km
    pub odometer: Option<f64>,
    pub battery: Option<BatteryStatus>,
    pub fuel: Option<FuelStatus>,
    pub engine: Option<EngineStatus>,
    pub acceleration: Option<Acceleration>,
    pub signal_strength: Option<i32>,
    pub is_estimated: bool,
}

impl Reading {
    pub fn new(vehicle_id: VehicleId, source: TelemetrySource) -> Self {
        Self {
            vehicle_id,
            device_id: None,
            source,
            timestamp: None,
            location: None,
            odometer: None,
            battery: None,
            fuel: None,
            engine: None,
            acceleration: None,
            signal_strength: None,
            is_estimated: false,
        }
    }

    pub fn soc(&self) -> Option<f64> {
        self.battery.as_ref().and_then(|b| b.soc)
    }

    pub fn speed(&self) -> Option<f64> {
        self.location.as_ref().and_then(|l| l.speed)
    }

    pub fn fuel_percentage(&self) -> Option<f64> {
        self.fuel.as_ref().and_then(|f| f.percentage)
    }
}

/// Immutable historical record written once per successful sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Assigned by the store on insert.
    pub id: i64,
    pub company_id: CompanyId,
    pub provider_name: String,
    pub timestamp: DateTime<Utc>,
    pub data_quality: DataQuality,
    pub created_at: DateTime<Utc>,
    pub reading: Reading,
}

impl Snapshot {
    pub fn from_reading(
        reading: Reading,
        company_id: CompanyId,
        provider_name: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            company_id,
            provider_name: provider_name.to_string(),
            timestamp: reading.timestamp.unwrap_or(now),
            data_quality: DataQuality::classify(reading.timestamp, now),
            created_at: now,
            reading,
        }
    }

    pub fn vehicle_id(&self) -> VehicleId {
        self.reading.vehicle_id
    }
}

/// Last known values kept on the vehicle record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveState {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<f64>,
    pub battery_level: Option<f64>,
    pub fuel_level: Option<f64>,
    pub odometer: Option<f64>,
    pub last_telemetry_update: Option<DateTime<Utc>>,
    pub data_quality: DataQuality,
}

impl LiveState {
    /// Overlay the fields a reading carries; fields it lacks keep their last value.
    /// Estimated readings never advance `last_telemetry_update`.
    pub fn merged_with(
        &self,
        reading: &Reading,
        quality: DataQuality,
        synced_at: DateTime<Utc>,
    ) -> Self {
        let mut next = self.clone();
        if let Some(loc) = &reading.location {
            next.latitude = Some(loc.latitude);
            next.longitude = Some(loc.longitude);
            if loc.speed.is_some() {
                next.speed = loc.speed;
            }
        }
        if let Some(soc) = reading.soc() {
            next.battery_level = Some(soc);
        }
        if let Some(pct) = reading.fuel_percentage() {
            next.fuel_level = Some(pct);
        }
        if reading.odometer.is_some() {
            next.odometer = reading.odometer;
        }
        if !reading.is_estimated {
            next.last_telemetry_update = Some(reading.timestamp.unwrap_or(synced_at));
        }
        next.data_quality = quality;
        next
    }

    pub fn has_values(&self) -> bool {
        self.latitude.is_some()
            || self.battery_level.is_some()
            || self.fuel_level.is_some()
            || self.odometer.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: VehicleId,
    pub company_id: CompanyId,
    pub driver_id: Option<UserId>,
    pub license_plate: String,
    pub status: VehicleStatus,
    pub telemetry_source: TelemetrySource,
    /// IMEI of the on-board device.
    pub device_id: Option<String>,
    pub oem_vehicle_id: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub speed_limit_kph: Option<f64>,
    pub live: LiveState,
}

impl Vehicle {
    pub fn is_sync_eligible(&self) -> bool {
        self.telemetry_source.is_polled() && self.status != VehicleStatus::Inactive
    }

    pub fn has_device(&self) -> bool {
        self.device_id.as_deref().is_some_and(|d| !d.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn vehicle(source: TelemetrySource, status: VehicleStatus) -> Vehicle {
        Vehicle {
            id: 1,
            company_id: 10,
            driver_id: None,
            license_plate: "AB-123".to_string(),
            status,
            telemetry_source: source,
            device_id: Some("356938035643809".to_string()),
            oem_vehicle_id: None,
            make: None,
            model: None,
            speed_limit_kph: None,
            live: LiveState::default(),
        }
    }

    #[test]
    fn test_data_quality_by_age() {
        let now = Utc::now();
        assert_eq!(DataQuality::classify(Some(now), now), DataQuality::RealTime);
        assert_eq!(
            DataQuality::classify(Some(now - Duration::minutes(4)), now),
            DataQuality::RealTime
        );
        assert_eq!(
            DataQuality::classify(Some(now - Duration::minutes(5)), now),
            DataQuality::Recent
        );
        assert_eq!(
            DataQuality::classify(Some(now - Duration::minutes(29)), now),
            DataQuality::Recent
        );
        assert_eq!(
            DataQuality::classify(Some(now - Duration::minutes(30)), now),
            DataQuality::Stale
        );
        assert_eq!(DataQuality::classify(None, now), DataQuality::Unknown);
    }

    #[test]
    fn test_manual_vehicles_are_never_eligible() {
        for status in [
            VehicleStatus::Active,
            VehicleStatus::Inactive,
            VehicleStatus::Maintenance,
            VehicleStatus::Charging,
            VehicleStatus::InUse,
        ] {
            assert!(!vehicle(TelemetrySource::Manual, status).is_sync_eligible());
        }
    }

    #[test]
    fn test_inactive_vehicles_are_not_eligible() {
        assert!(!vehicle(TelemetrySource::Device, VehicleStatus::Inactive).is_sync_eligible());
        assert!(vehicle(TelemetrySource::Device, VehicleStatus::InUse).is_sync_eligible());
        assert!(vehicle(TelemetrySource::OemApi, VehicleStatus::Charging).is_sync_eligible());
    }

    #[test]
    fn test_live_state_keeps_missing_fields() {
        let now = Utc::now();
        let previous = LiveState {
            fuel_level: Some(40.0),
            odometer: Some(1200.0),
            ..Default::default()
        };
        let mut reading = Reading::new(1, TelemetrySource::Device);
        reading.timestamp = Some(now);
        reading.battery = Some(BatteryStatus {
            soc: Some(55.0),
            ..Default::default()
        });

        let next = previous.merged_with(&reading, DataQuality::RealTime, now);
        assert_eq!(next.battery_level, Some(55.0));
        assert_eq!(next.fuel_level, Some(40.0));
        assert_eq!(next.odometer, Some(1200.0));
        assert_eq!(next.last_telemetry_update, Some(now));
        assert_eq!(next.data_quality, DataQuality::RealTime);
    }

    #[test]
    fn test_estimated_reading_keeps_last_report_time() {
        let now = Utc::now();
        let reported = now - Duration::hours(3);
        let previous = LiveState {
            battery_level: Some(30.0),
            last_telemetry_update: Some(reported),
            ..Default::default()
        };

        let mut estimate = Reading::new(1, TelemetrySource::Manual);
        estimate.is_estimated = true;
        estimate.battery = Some(BatteryStatus {
            soc: Some(30.0),
            ..Default::default()
        });
        let next = previous.merged_with(&estimate, DataQuality::Unknown, now);
        assert_eq!(next.last_telemetry_update, Some(reported));

        let never_reported = LiveState::default().merged_with(&estimate, DataQuality::Unknown, now);
        assert_eq!(never_reported.last_telemetry_update, None);
    }

    #[test]
    fn test_snapshot_uses_sync_time_without_timestamp() {
        let now = Utc::now();
        let reading = Reading::new(7, TelemetrySource::OemApi);
        let snapshot = Snapshot::from_reading(reading, 3, "oem-api", now);
        assert_eq!(snapshot.timestamp, now);
        assert_eq!(snapshot.data_quality, DataQuality::Unknown);
        assert_eq!(snapshot.vehicle_id(), 7);
    }

    #[test]
    fn test_source_text_round_trip() {
        assert_eq!(TelemetrySource::OemApi.as_str(), "OEM_API");
        assert_eq!(TelemetrySource::from_str("DEVICE").unwrap(), TelemetrySource::Device);
        assert!(TelemetrySource::from_str("satellite").is_err());
    }
}
