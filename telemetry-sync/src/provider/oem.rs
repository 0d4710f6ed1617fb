use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

use super::{endpoint, parse_base_url, TelemetryProvider};
use crate::config::OemVendorConfig;
use crate::errors::{Error, Result};
use crate::model::{
    BatteryStatus, EngineStatus, FuelStatus, Location, Reading, TelemetrySource, Vehicle,
    VehicleId,
};

const PROVIDER_ID: &str = "oem-api";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OemLocation {
    pub lat: f64,
    pub lng: f64,
    pub heading: Option<f64>,
}

/// Normalized vehicle telemetry exposed by the vendor integrations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OemTelemetry {
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub location: Option<OemLocation>,
    pub speed_kph: Option<f64>,
    pub odometer_km: Option<f64>,
    pub battery_level: Option<f64>,
    pub battery_health: Option<f64>,
    pub charging_state: Option<String>,
    pub range_km: Option<f64>,
    pub fuel_level_percent: Option<f64>,
    pub ignition: Option<bool>,
}

impl OemTelemetry {
    pub fn into_reading(self, vehicle_id: VehicleId) -> Reading {
        let mut reading = Reading::new(vehicle_id, TelemetrySource::OemApi);
        reading.timestamp = self.recorded_at;
        reading.location = self.location.map(|l| Location {
            latitude: l.lat,
            longitude: l.lng,
            heading: l.heading,
            speed: self.speed_kph,
            ..Default::default()
        });
        reading.odometer = self.odometer_km;
        if self.battery_level.is_some() || self.charging_state.is_some() {
            reading.battery = Some(BatteryStatus {
                soc: self.battery_level,
                soh: self.battery_health,
                is_charging: self
                    .charging_state
                    .as_deref()
                    .map(|s| s.eq_ignore_ascii_case("charging")),
                estimated_range: self.range_km,
                ..Default::default()
            });
        }
        if self.fuel_level_percent.is_some() {
            reading.fuel = Some(FuelStatus {
                level: None,
                percentage: self.fuel_level_percent,
            });
        }
        if self.ignition.is_some() {
            reading.engine = Some(EngineStatus {
                ignition_on: self.ignition,
                ..Default::default()
            });
        }
        reading
    }
}

#[derive(Debug, Clone)]
struct VendorEndpoint {
    base_url: Url,
    api_key: Option<String>,
}

/// Vendor cloud integrations, registered per vehicle make.
#[derive(Debug, Clone)]
pub struct OemApiProvider {
    client: Client,
    vendors: HashMap<String, VendorEndpoint>,
    update_interval_secs: u64,
}

impl OemApiProvider {
    pub fn new(
        vendors: &[OemVendorConfig],
        update_interval_secs: u64,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let vendors: HashMap<String, VendorEndpoint> = vendors
            .iter()
            .map(|v| {
                let endpoint = VendorEndpoint {
                    base_url: parse_base_url(&v.base_url)?,
                    api_key: v.api_key.clone(),
                };
                Ok((v.make.to_ascii_lowercase(), endpoint))
            })
            .collect::<Result<_>>()?;
        Ok(Self {
            client,
            vendors,
            update_interval_secs,
        })
    }

    fn vendor_for(&self, vehicle: &Vehicle) -> Option<&VendorEndpoint> {
        let make = vehicle.make.as_deref()?.trim().to_ascii_lowercase();
        self.vendors.get(&make)
    }

    fn request(&self, vehicle: &Vehicle, history: bool) -> Result<RequestBuilder> {
        let vendor = self.vendor_for(vehicle).ok_or_else(|| {
            Error::provider(
                PROVIDER_ID,
                format!("no vendor registered for vehicle {}", vehicle.id),
            )
        })?;
        let oem_id = vehicle
            .oem_vehicle_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                Error::provider(PROVIDER_ID, format!("vehicle {} has no OEM id", vehicle.id))
            })?;

        let mut segments = vec!["vehicles", oem_id, "telemetry"];
        if history {
            segments.push("history");
        }
        let request = self.client.get(endpoint(&vendor.base_url, &segments));
        Ok(match &vendor.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        })
    }
}

#[async_trait]
impl TelemetryProvider for OemApiProvider {
    fn id(&self) -> &'static str {
        PROVIDER_ID
    }

    fn supports(&self, vehicle: &Vehicle) -> bool {
        vehicle.telemetry_source == TelemetrySource::OemApi
            && vehicle.oem_vehicle_id.as_deref().is_some_and(|id| !id.trim().is_empty())
            && self.vendor_for(vehicle).is_some()
    }

    async fn fetch_latest(&self, vehicle: &Vehicle) -> Result<Option<Reading>> {
        let response = self.request(vehicle, false)?.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("OEM API has no telemetry for vehicle {}", vehicle.id);
            return Ok(None);
        }
        let telemetry: OemTelemetry = response.error_for_status()?.json().await?;
        Ok(Some(telemetry.into_reading(vehicle.id)))
    }

    async fn fetch_historical(
        &self,
        vehicle: &Vehicle,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        let response = self
            .request(vehicle, true)?
            .query(&[("from", start.to_rfc3339()), ("to", end.to_rfc3339())])
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let records: Vec<OemTelemetry> = response.error_for_status()?.json().await?;
        Ok(records
            .into_iter()
            .map(|t| t.into_reading(vehicle.id))
            .collect())
    }

    /// True only when every registered vendor answers its health endpoint.
    async fn test_connection(&self) -> bool {
        for (make, vendor) in &self.vendors {
            let health = endpoint(&vendor.base_url, &["health"]);
            let ok = match self.client.get(health).send().await {
                Ok(response) => response.status().is_success(),
                Err(e) => {
                    warn!("OEM vendor {} health check failed: {}", make, e);
                    false
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }

    fn update_interval_seconds(&self) -> u64 {
        self.update_interval_secs
    }

    fn supported_fields(&self) -> BTreeSet<&'static str> {
        ["location", "odometer", "battery", "fuel", "engine.ignition_on"]
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LiveState, VehicleStatus};
    use axum::extract::{Path, Query};
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};

    fn provider() -> OemApiProvider {
        OemApiProvider::new(
            &[OemVendorConfig {
                make: "Tesla".to_string(),
                base_url: "http://oem.test/".to_string(),
                api_key: Some("k".to_string()),
            }],
            300,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn vehicle(make: &str, oem_id: Option<&str>) -> Vehicle {
        Vehicle {
            id: 3,
            company_id: 1,
            driver_id: None,
            license_plate: "EV-3".to_string(),
            status: VehicleStatus::Active,
            telemetry_source: TelemetrySource::OemApi,
            device_id: None,
            oem_vehicle_id: oem_id.map(str::to_string),
            make: Some(make.to_string()),
            model: None,
            speed_limit_kph: None,
            live: LiveState::default(),
        }
    }

    #[test]
    fn test_supports_registered_make_case_insensitively() {
        let p = provider();
        assert!(p.supports(&vehicle("TESLA", Some("5YJ3E1EA7KF317000"))));
        assert!(!p.supports(&vehicle("Tesla", None)));
        assert!(!p.supports(&vehicle("Rivian", Some("7FCTGAAL0NN000001"))));
    }

    #[test]
    fn test_telemetry_maps_charging_state() {
        let telemetry: OemTelemetry = serde_json::from_str(
            r#"{
                "recorded_at": "2025-03-01T10:00:00Z",
                "battery_level": 100.0,
                "charging_state": "Charging",
                "location": {"lat": 52.5, "lng": 13.4},
                "speed_kph": 0.0
            }"#,
        )
        .unwrap();
        let reading = telemetry.into_reading(3);
        let battery = reading.battery.clone().unwrap();
        assert_eq!(battery.is_charging, Some(true));
        assert_eq!(reading.soc(), Some(100.0));
        assert_eq!(reading.source, TelemetrySource::OemApi);
        assert_eq!(reading.location.unwrap().longitude, 13.4);
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Bearer k")
    }

    fn sample(soc: f64) -> OemTelemetry {
        OemTelemetry {
            recorded_at: Some(Utc::now()),
            location: Some(OemLocation {
                lat: 52.52,
                lng: 13.40,
                heading: Some(90.0),
            }),
            speed_kph: Some(42.0),
            battery_level: Some(soc),
            ..Default::default()
        }
    }

    async fn latest(
        Path(id): Path<String>,
        headers: HeaderMap,
    ) -> std::result::Result<Json<OemTelemetry>, axum::http::StatusCode> {
        if !authorized(&headers) {
            return Err(axum::http::StatusCode::UNAUTHORIZED);
        }
        match id.as_str() {
            "VIN/1" => Ok(Json(sample(64.0))),
            _ => Err(axum::http::StatusCode::NOT_FOUND),
        }
    }

    async fn history(
        Path(id): Path<String>,
        Query(range): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> std::result::Result<Json<Vec<OemTelemetry>>, axum::http::StatusCode> {
        if !authorized(&headers) || !range.contains_key("from") || !range.contains_key("to") {
            return Err(axum::http::StatusCode::BAD_REQUEST);
        }
        match id.as_str() {
            "VIN/1" => Ok(Json(vec![sample(70.0), sample(69.5)])),
            _ => Err(axum::http::StatusCode::NOT_FOUND),
        }
    }

    async fn serve_vendor() -> String {
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/vehicles/:id/telemetry", get(latest))
            .route("/vehicles/:id/telemetry/history", get(history));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn provider_at(base_url: &str, api_key: &str) -> OemApiProvider {
        OemApiProvider::new(
            &[OemVendorConfig {
                make: "Tesla".to_string(),
                base_url: base_url.to_string(),
                api_key: Some(api_key.to_string()),
            }],
            300,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_vendor_latest_history_and_health() {
        let base_url = serve_vendor().await;
        let p = provider_at(&base_url, "k");
        let known = vehicle("Tesla", Some("VIN/1"));

        let reading = p.fetch_latest(&known).await.unwrap().unwrap();
        assert_eq!(reading.vehicle_id, 3);
        assert_eq!(reading.soc(), Some(64.0));
        assert_eq!(reading.speed(), Some(42.0));

        let unknown = vehicle("Tesla", Some("VIN-404"));
        assert!(p.fetch_latest(&unknown).await.unwrap().is_none());

        let end = Utc::now();
        let start = end - chrono::Duration::hours(1);
        let history = p.fetch_historical(&known, start, end).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].soc(), Some(69.5));
        assert!(p.fetch_historical(&unknown, start, end).await.unwrap().is_empty());

        assert!(p.test_connection().await);
    }

    #[tokio::test]
    async fn test_vendor_rejects_wrong_key() {
        let base_url = serve_vendor().await;
        let p = provider_at(&base_url, "wrong");
        let result = p.fetch_latest(&vehicle("Tesla", Some("VIN/1"))).await;
        assert!(matches!(result, Err(Error::Http(_))));
    }

    #[tokio::test]
    async fn test_unreachable_vendor_fails_health_check() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let p = provider_at(&format!("http://{}", addr), "k");
        assert!(!p.test_connection().await);
    }
}
