use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{CompanyId, UserId, VehicleId};

text_enum! {
    pub enum AlertType {
        LowBattery => "LOW_BATTERY",
        CriticalBattery => "CRITICAL_BATTERY",
        ExcessiveSpeed => "EXCESSIVE_SPEED",
        ConnectionLost => "CONNECTION_LOST",
        GpsSignalLost => "GPS_SIGNAL_LOST",
        ChargingComplete => "CHARGING_COMPLETE",
        LowFuel => "LOW_FUEL",
        CheckEngine => "CHECK_ENGINE",
        BatteryOverheat => "BATTERY_OVERHEAT",
    }
}

impl AlertType {
    pub fn title(&self) -> &'static str {
        match self {
            AlertType::LowBattery => "Low battery",
            AlertType::CriticalBattery => "Critical battery level",
            AlertType::ExcessiveSpeed => "Excessive speed",
            AlertType::ConnectionLost => "Telemetry connection lost",
            AlertType::GpsSignalLost => "GPS signal lost",
            AlertType::ChargingComplete => "Charging complete",
            AlertType::LowFuel => "Low fuel",
            AlertType::CheckEngine => "Check engine light on",
            AlertType::BatteryOverheat => "Battery overheating",
        }
    }
}

text_enum! {
    pub enum AlertPriority {
        Low => "LOW",
        Medium => "MEDIUM",
        High => "HIGH",
        Critical => "CRITICAL",
    }
}

impl AlertPriority {
    pub const URGENT: [AlertPriority; 2] = [AlertPriority::High, AlertPriority::Critical];

    pub fn is_urgent(&self) -> bool {
        Self::URGENT.contains(self)
    }
}

text_enum! {
    pub enum AlertStatus {
        Active => "ACTIVE",
        Acknowledged => "ACKNOWLEDGED",
        Resolved => "RESOLVED",
        Expired => "EXPIRED",
        Suppressed => "SUPPRESSED",
    }
}

impl AlertStatus {
    /// Statuses that block a duplicate of the same type inside the cooldown.
    pub const OPEN: [AlertStatus; 2] = [AlertStatus::Active, AlertStatus::Acknowledged];

    pub fn is_open(&self) -> bool {
        Self::OPEN.contains(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub vehicle_id: VehicleId,
    pub company_id: CompanyId,
    pub driver_id: Option<UserId>,
    pub alert_type: AlertType,
    pub priority: AlertPriority,
    pub status: AlertStatus,
    pub title: String,
    pub message: String,
    pub current_value: Option<f64>,
    pub threshold_value: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<UserId>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
    pub resolution_notes: Option<String>,
    pub notification_sent: bool,
    pub notification_sent_at: Option<DateTime<Utc>>,
}

/// Filter for alert listings. Results come back newest first.
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub company_id: Option<CompanyId>,
    pub vehicle_id: Option<VehicleId>,
    pub statuses: Vec<AlertStatus>,
    pub priorities: Vec<AlertPriority>,
    pub limit: Option<usize>,
}

impl AlertQuery {
    pub fn matches(&self, alert: &Alert) -> bool {
        self.company_id.map_or(true, |c| alert.company_id == c)
            && self.vehicle_id.map_or(true, |v| alert.vehicle_id == v)
            && (self.statuses.is_empty() || self.statuses.contains(&alert.status))
            && (self.priorities.is_empty() || self.priorities.contains(&alert.priority))
    }
}

/// One grouped count row as returned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertCount {
    pub alert_type: AlertType,
    pub priority: AlertPriority,
    pub status: AlertStatus,
    pub count: u64,
}
