//! Threshold rules that turn a reading into alert candidates.
//!
//! Each rule looks at one concern and is independent of the others, so a
//! single reading can produce several candidates. New rules are added to
//! [`READING_RULES`].

use chrono::{DateTime, Duration, Utc};

use super::types::{AlertPriority, AlertType};
use crate::config::AlertThresholds;
use crate::model::{Reading, Vehicle};

#[derive(Debug, Clone, PartialEq)]
pub struct AlertCandidate {
    pub alert_type: AlertType,
    pub priority: AlertPriority,
    pub message: String,
    pub current_value: Option<f64>,
    pub threshold_value: Option<f64>,
}

type ReadingRule = fn(&Vehicle, &Reading, &AlertThresholds) -> Option<AlertCandidate>;

/// Rule table. The flag marks rules that also apply to estimated readings.
const READING_RULES: &[(ReadingRule, bool)] = &[
    (battery_level, true),
    (excessive_speed, false),
    (gps_signal, false),
    (charging_complete, false),
    (low_fuel, true),
    (check_engine, false),
    (battery_overheat, false),
];

pub fn evaluate_reading(
    vehicle: &Vehicle,
    reading: &Reading,
    thresholds: &AlertThresholds,
) -> Vec<AlertCandidate> {
    READING_RULES
        .iter()
        .filter(|(_, on_estimated)| *on_estimated || !reading.is_estimated)
        .filter_map(|(rule, _)| rule(vehicle, reading, thresholds))
        .collect()
}

/// CONNECTION_LOST when the vehicle has not reported within `gap`.
///
/// Vehicles that never reported are left alone; there is no connection to lose.
pub fn connection_lost(
    vehicle: &Vehicle,
    now: DateTime<Utc>,
    gap: Duration,
) -> Option<AlertCandidate> {
    let last = vehicle.live.last_telemetry_update?;
    let silent = now.signed_duration_since(last);
    if silent <= gap {
        return None;
    }
    let minutes = silent.num_minutes();
    Some(AlertCandidate {
        alert_type: AlertType::ConnectionLost,
        priority: AlertPriority::High,
        message: format!(
            "{}: no telemetry for {} minutes (last update {})",
            vehicle.license_plate,
            minutes,
            last.to_rfc3339()
        ),
        current_value: Some(minutes as f64),
        threshold_value: Some(gap.num_minutes() as f64),
    })
}

/// Critical and low tiers are exclusive: the most severe one wins.
fn battery_level(
    vehicle: &Vehicle,
    reading: &Reading,
    t: &AlertThresholds,
) -> Option<AlertCandidate> {
    let soc = reading.soc()?;
    let (alert_type, priority, threshold) = if soc < t.critical_battery_soc {
        (AlertType::CriticalBattery, AlertPriority::Critical, t.critical_battery_soc)
    } else if soc < t.low_battery_soc {
        (AlertType::LowBattery, AlertPriority::Medium, t.low_battery_soc)
    } else {
        return None;
    };
    Some(AlertCandidate {
        alert_type,
        priority,
        message: format!(
            "{}: battery at {:.0}% (threshold {:.0}%)",
            vehicle.license_plate, soc, threshold
        ),
        current_value: Some(soc),
        threshold_value: Some(threshold),
    })
}

fn excessive_speed(
    vehicle: &Vehicle,
    reading: &Reading,
    t: &AlertThresholds,
) -> Option<AlertCandidate> {
    let speed = reading.speed()?;
    let limit = vehicle.speed_limit_kph.unwrap_or(t.default_speed_limit_kph);
    (speed > limit).then(|| AlertCandidate {
        alert_type: AlertType::ExcessiveSpeed,
        priority: AlertPriority::High,
        message: format!(
            "{}: travelling at {:.0} km/h (limit {:.0} km/h)",
            vehicle.license_plate, speed, limit
        ),
        current_value: Some(speed),
        threshold_value: Some(limit),
    })
}

fn gps_signal(vehicle: &Vehicle, reading: &Reading, t: &AlertThresholds) -> Option<AlertCandidate> {
    let satellites = reading.location.as_ref()?.satellites?;
    (satellites < t.min_gps_satellites).then(|| AlertCandidate {
        alert_type: AlertType::GpsSignalLost,
        priority: AlertPriority::Medium,
        message: format!(
            "{}: only {} satellites in view",
            vehicle.license_plate, satellites
        ),
        current_value: Some(satellites as f64),
        threshold_value: Some(t.min_gps_satellites as f64),
    })
}

fn charging_complete(
    vehicle: &Vehicle,
    reading: &Reading,
    t: &AlertThresholds,
) -> Option<AlertCandidate> {
    let battery = reading.battery.as_ref()?;
    let soc = battery.soc?;
    (battery.is_charging == Some(true) && soc >= t.charging_complete_soc).then(|| AlertCandidate {
        alert_type: AlertType::ChargingComplete,
        priority: AlertPriority::Low,
        message: format!("{}: charging complete at {:.0}%", vehicle.license_plate, soc),
        current_value: Some(soc),
        threshold_value: Some(t.charging_complete_soc),
    })
}

fn low_fuel(vehicle: &Vehicle, reading: &Reading, t: &AlertThresholds) -> Option<AlertCandidate> {
    let pct = reading.fuel_percentage()?;
    (pct < t.low_fuel_percentage).then(|| AlertCandidate {
        alert_type: AlertType::LowFuel,
        priority: AlertPriority::Medium,
        message: format!("{}: fuel at {:.0}%", vehicle.license_plate, pct),
        current_value: Some(pct),
        threshold_value: Some(t.low_fuel_percentage),
    })
}

fn check_engine(
    vehicle: &Vehicle,
    reading: &Reading,
    _t: &AlertThresholds,
) -> Option<AlertCandidate> {
    let engine = reading.engine.as_ref()?;
    (engine.check_engine_light == Some(true)).then(|| AlertCandidate {
        alert_type: AlertType::CheckEngine,
        priority: AlertPriority::High,
        message: format!("{}: check engine light is on", vehicle.license_plate),
        current_value: None,
        threshold_value: None,
    })
}

fn battery_overheat(
    vehicle: &Vehicle,
    reading: &Reading,
    t: &AlertThresholds,
) -> Option<AlertCandidate> {
    let temperature = reading.battery.as_ref()?.temperature?;
    (temperature > t.battery_overheat_celsius).then(|| AlertCandidate {
        alert_type: AlertType::BatteryOverheat,
        priority: AlertPriority::High,
        message: format!(
            "{}: battery temperature {:.1}°C",
            vehicle.license_plate, temperature
        ),
        current_value: Some(temperature),
        threshold_value: Some(t.battery_overheat_celsius),
    })
}
