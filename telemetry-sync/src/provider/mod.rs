//! Telemetry providers.
//!
//! A provider knows how to pull a [`Reading`] for the vehicles it supports.
//! The [`ProviderRegistry`] holds the configured providers in priority order
//! and always ends with the manual fallback, so resolution never fails.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use crate::config::ProviderConfig;
use crate::errors::{Error, Result};
use crate::model::{Reading, Vehicle};

pub mod device_gateway;
pub mod manual;
pub mod oem;

pub use device_gateway::DeviceGatewayProvider;
pub use manual::ManualProvider;
pub use oem::OemApiProvider;

#[async_trait]
pub trait TelemetryProvider: Send + Sync {
    /// Stable identifier, stored on every snapshot as `provider_name`.
    fn id(&self) -> &'static str;

    fn supports(&self, vehicle: &Vehicle) -> bool;

    /// Latest reading, or `None` when the source has nothing for this vehicle.
    async fn fetch_latest(&self, vehicle: &Vehicle) -> Result<Option<Reading>>;

    async fn fetch_historical(
        &self,
        vehicle: &Vehicle,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;

    async fn test_connection(&self) -> bool;

    /// How often the source itself refreshes its data.
    fn update_interval_seconds(&self) -> u64;

    fn supports_real_time_streaming(&self) -> bool {
        false
    }

    fn supported_fields(&self) -> BTreeSet<&'static str>;
}

/// Base URLs must be hierarchical so ids can be appended as path segments.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url> {
    let url =
        Url::parse(raw).map_err(|e| Error::InvalidValue(format!("base url {:?}: {}", raw, e)))?;
    if url.cannot_be_a_base() {
        return Err(Error::InvalidValue(format!("base url {:?} cannot carry a path", raw)));
    }
    Ok(url)
}

/// Appends `segments` to the base path, percent-encoding each one.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Priority-ordered providers plus the always-matching fallback.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn TelemetryProvider>>,
    fallback: Arc<dyn TelemetryProvider>,
}

impl ProviderRegistry {
    /// `providers` are consulted in the given order; the manual fallback is
    /// appended after them.
    pub fn new(providers: Vec<Arc<dyn TelemetryProvider>>) -> Self {
        Self {
            providers,
            fallback: Arc::new(ManualProvider::new()),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let mut providers: Vec<Arc<dyn TelemetryProvider>> = Vec::new();

        if let Some(gateway) = &config.gateway {
            info!("Registering device gateway provider at {}", gateway.base_url);
            providers.push(Arc::new(DeviceGatewayProvider::new(
                gateway,
                config.request_timeout,
            )?));
        }

        if !config.oem_vendors.is_empty() {
            let makes: Vec<&str> = config.oem_vendors.iter().map(|v| v.make.as_str()).collect();
            info!("Registering OEM API provider for {:?}", makes);
            providers.push(Arc::new(OemApiProvider::new(
                &config.oem_vendors,
                config.oem_update_interval_secs,
                config.request_timeout,
            )?));
        }

        Ok(Self::new(providers))
    }

    /// First provider whose `supports()` matches; the fallback otherwise.
    pub fn resolve(&self, vehicle: &Vehicle) -> Arc<dyn TelemetryProvider> {
        self.providers
            .iter()
            .find(|p| p.supports(vehicle))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// All providers in resolution order, fallback last.
    pub fn providers(&self) -> impl Iterator<Item = &Arc<dyn TelemetryProvider>> {
        self.providers.iter().chain(std::iter::once(&self.fallback))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, OemVendorConfig};
    use crate::model::{LiveState, TelemetrySource, VehicleStatus};

    fn vehicle(source: TelemetrySource, device_id: Option<&str>, make: Option<&str>) -> Vehicle {
        Vehicle {
            id: 42,
            company_id: 1,
            driver_id: None,
            license_plate: "FLEET-42".to_string(),
            status: VehicleStatus::Active,
            telemetry_source: source,
            device_id: device_id.map(str::to_string),
            oem_vehicle_id: Some("VIN123".to_string()),
            make: make.map(str::to_string),
            model: None,
            speed_limit_kph: None,
            live: LiveState::default(),
        }
    }

    fn full_registry() -> ProviderRegistry {
        ProviderRegistry::from_config(&ProviderConfig {
            gateway: Some(GatewayConfig {
                base_url: "http://gateway.test".to_string(),
                api_key: None,
                update_interval_secs: 30,
            }),
            oem_vendors: vec![OemVendorConfig {
                make: "Tesla".to_string(),
                base_url: "http://oem.test".to_string(),
                api_key: None,
            }],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_priority_order() {
        let registry = full_registry();
        let ids: Vec<&str> = registry.providers().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["device-gateway", "oem-api", "manual"]);
    }

    #[test]
    fn test_resolution_picks_first_match() {
        let registry = full_registry();

        let device = vehicle(TelemetrySource::Device, Some("356938035643809"), None);
        assert_eq!(registry.resolve(&device).id(), "device-gateway");

        let oem = vehicle(TelemetrySource::OemApi, None, Some("tesla"));
        assert_eq!(registry.resolve(&oem).id(), "oem-api");
    }

    #[test]
    fn test_resolution_falls_back_to_manual() {
        let registry = full_registry();

        let no_imei = vehicle(TelemetrySource::Device, Some("  "), None);
        assert_eq!(registry.resolve(&no_imei).id(), "manual");

        let unknown_make = vehicle(TelemetrySource::OemApi, None, Some("Lada"));
        assert_eq!(registry.resolve(&unknown_make).id(), "manual");

        let empty = ProviderRegistry::new(Vec::new());
        assert_eq!(empty.resolve(&no_imei).id(), "manual");
    }

    #[test]
    fn test_ids_are_encoded_as_one_segment() {
        let base = parse_base_url("http://gateway.test/v2/").unwrap();
        let url = endpoint(&base, &["api", "devices", "35/69?x 1", "latest"]);
        assert_eq!(url.as_str(), "http://gateway.test/v2/api/devices/35%2F69%3Fx%201/latest");
        assert_eq!(url.query(), None);

        let root = parse_base_url("http://oem.test").unwrap();
        assert_eq!(endpoint(&root, &["health"]).as_str(), "http://oem.test/health");
    }

    #[test]
    fn test_rejects_unusable_base_url() {
        assert!(matches!(parse_base_url("not a url"), Err(Error::InvalidValue(_))));
        assert!(matches!(parse_base_url("mailto:ops@fleet.test"), Err(Error::InvalidValue(_))));
    }
}
