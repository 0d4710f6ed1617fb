use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

use super::{endpoint, parse_base_url, TelemetryProvider};
use crate::config::GatewayConfig;
use crate::errors::{Error, Result};
use crate::model::{
    Acceleration, BatteryStatus, EngineStatus, FuelStatus, Location, Reading, TelemetrySource,
    Vehicle, VehicleId,
};

const PROVIDER_ID: &str = "device-gateway";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayBattery {
    pub soc: Option<f64>,
    pub soh: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub temperature: Option<f64>,
    pub charging: Option<bool>,
    pub range_km: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayFuel {
    pub level_l: Option<f64>,
    pub percentage: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayEngine {
    pub rpm: Option<f64>,
    pub ignition: Option<bool>,
    pub check_engine: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayAccel {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Position report as served by the device gateway, keyed by IMEI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayPosition {
    pub imei: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub heading: Option<f64>,
    pub speed_kph: Option<f64>,
    pub satellites: Option<i32>,
    pub odometer_km: Option<f64>,
    #[serde(default)]
    pub battery: Option<GatewayBattery>,
    #[serde(default)]
    pub fuel: Option<GatewayFuel>,
    #[serde(default)]
    pub engine: Option<GatewayEngine>,
    #[serde(default)]
    pub accel: Option<GatewayAccel>,
    pub gsm_signal: Option<i32>,
}

impl GatewayPosition {
    pub fn into_reading(self, vehicle_id: VehicleId) -> Reading {
        let mut reading = Reading::new(vehicle_id, TelemetrySource::Device);
        reading.device_id = Some(self.imei);
        reading.timestamp = self.timestamp;
        if let (Some(latitude), Some(longitude)) = (self.latitude, self.longitude) {
            reading.location = Some(Location {
                latitude,
                longitude,
                altitude: self.altitude,
                heading: self.heading,
                speed: self.speed_kph,
                satellites: self.satellites,
            });
        }
        reading.odometer = self.odometer_km;
        reading.battery = self.battery.map(|b| BatteryStatus {
            soc: b.soc,
            soh: b.soh,
            voltage: b.voltage,
            current: b.current,
            temperature: b.temperature,
            is_charging: b.charging,
            estimated_range: b.range_km,
        });
        reading.fuel = self.fuel.map(|f| FuelStatus {
            level: f.level_l,
            percentage: f.percentage,
        });
        reading.engine = self.engine.map(|e| EngineStatus {
            rpm: e.rpm,
            ignition_on: e.ignition,
            check_engine_light: e.check_engine,
        });
        reading.acceleration = self.accel.map(|a| Acceleration { x: a.x, y: a.y, z: a.z });
        reading.signal_strength = self.gsm_signal;
        reading
    }
}

/// Polls the device middleware REST API for vehicles with an on-board unit.
#[derive(Debug, Clone)]
pub struct DeviceGatewayProvider {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    update_interval_secs: u64,
}

impl DeviceGatewayProvider {
    pub fn new(config: &GatewayConfig, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: parse_base_url(&config.base_url)?,
            api_key: config.api_key.clone(),
            update_interval_secs: config.update_interval_secs,
        })
    }

    fn get(&self, segments: &[&str]) -> RequestBuilder {
        let request = self.client.get(endpoint(&self.base_url, segments));
        match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        }
    }

    fn imei<'a>(&self, vehicle: &'a Vehicle) -> Result<&'a str> {
        vehicle
            .device_id
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| {
                Error::provider(PROVIDER_ID, format!("vehicle {} has no device id", vehicle.id))
            })
    }
}

#[async_trait]
impl TelemetryProvider for DeviceGatewayProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn supports(&self, vehicle: &Vehicle) -> bool {
        vehicle.telemetry_source == TelemetrySource::Device && vehicle.has_device()
    }

    async fn fetch_latest(&self, vehicle: &Vehicle) -> Result<Option<Reading>> {
        let imei = self.imei(vehicle)?;
        let response = self.get(&["api", "devices", imei, "latest"]).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Gateway has no position for IMEI {}", imei);
            return Ok(None);
        }
        let position: GatewayPosition = response.error_for_status()?.json().await?;
        Ok(Some(position.into_reading(vehicle.id)))
    }

    async fn fetch_historical(
        &self,
        vehicle: &Vehicle,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        let imei = self.imei(vehicle)?;
        let response = self
            .get(&["api", "devices", imei, "history"])
            .query(&[("from", start.to_rfc3339()), ("to", end.to_rfc3339())])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let positions: Vec<GatewayPosition> = response.error_for_status()?.json().await?;
        Ok(positions
            .into_iter()
            .map(|p| p.into_reading(vehicle.id))
            .collect())
    }

    async fn test_connection(&self) -> bool {
        match self.get(&["api", "health"]).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Device gateway health check failed: {}", e);
                false
            }
        }
    }

    fn update_interval_seconds(&self) -> u64 {
        self.update_interval_secs
    }

    fn supported_fields(&self) -> BTreeSet<&'static str> {
        [
            "location",
            "odometer",
            "battery",
            "fuel",
            "engine",
            "acceleration",
            "signal_strength",
        ]
        .into_iter()
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_maps_to_reading() {
        let json = r#"{
            "imei": "356938035643809",
            "timestamp": "2025-03-01T10:00:00Z",
            "latitude": 19.43,
            "longitude": -99.13,
            "speed_kph": 87.5,
            "satellites": 9,
            "odometer_km": 10234.5,
            "battery": {"soc": 18.0, "charging": false},
            "engine": {"ignition": true, "check_engine": false},
            "gsm_signal": 21
        }"#;
        let position: GatewayPosition = serde_json::from_str(json).unwrap();
        let reading = position.into_reading(5);

        assert_eq!(reading.vehicle_id, 5);
        assert_eq!(reading.source, TelemetrySource::Device);
        assert_eq!(reading.device_id.as_deref(), Some("356938035643809"));
        assert_eq!(reading.speed(), Some(87.5));
        assert_eq!(reading.soc(), Some(18.0));
        assert_eq!(reading.location.as_ref().unwrap().satellites, Some(9));
        assert_eq!(reading.engine.unwrap().ignition_on, Some(true));
        assert!(reading.fuel.is_none());
        assert!(!reading.is_estimated);
    }

    #[test]
    fn test_position_without_coordinates_has_no_location() {
        let position: GatewayPosition =
            serde_json::from_str(r#"{"imei": "1", "latitude": 1.0}"#).unwrap();
        assert!(position.into_reading(1).location.is_none());
    }
}
