pub const VEHICLE_COLUMNS: &str = r#"
id, company_id, driver_id, license_plate, status, telemetry_source, device_id, oem_vehicle_id,
make, model, speed_limit_kph, latitude, longitude, speed, battery_level, fuel_level, odometer,
last_telemetry_update, data_quality
"#;

pub const UPDATE_VEHICLE_LIVE_STATE: &str = r#"
UPDATE vehicles
SET latitude = $2,
    longitude = $3,
    speed = $4,
    battery_level = $5,
    fuel_level = $6,
    odometer = $7,
    last_telemetry_update = $8,
    data_quality = $9
WHERE id = $1;
"#;

pub const INSERT_SNAPSHOT: &str = r#"
INSERT INTO telemetry_snapshots (
    vehicle_id, company_id, device_id, source, provider_name, ts, data_quality,
    latitude, longitude, altitude, heading, speed, satellites, odometer,
    battery_soc, battery_soh, battery_voltage, battery_current, battery_temperature,
    battery_is_charging, battery_estimated_range, fuel_level, fuel_percentage,
    engine_rpm, engine_ignition_on, engine_check_light, accel_x, accel_y, accel_z,
    signal_strength, is_estimated, created_at
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
    $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $28, $29, $30, $31, $32
)
RETURNING id;
"#;

pub const SNAPSHOT_COLUMNS: &str = r#"
id, vehicle_id, company_id, device_id, source, provider_name, ts, data_quality,
latitude, longitude, altitude, heading, speed, satellites, odometer,
battery_soc, battery_soh, battery_voltage, battery_current, battery_temperature,
battery_is_charging, battery_estimated_range, fuel_level, fuel_percentage,
engine_rpm, engine_ignition_on, engine_check_light, accel_x, accel_y, accel_z,
signal_strength, is_estimated, created_at
"#;

pub const COUNT_SNAPSHOTS: &str = "SELECT COUNT(*) FROM telemetry_snapshots;";

pub const COUNT_SNAPSHOTS_BEFORE: &str = "SELECT COUNT(*) FROM telemetry_snapshots WHERE ts < $1;";

pub const DELETE_SNAPSHOTS_BEFORE: &str = r#"
DELETE FROM telemetry_snapshots
WHERE id IN (
    SELECT id FROM telemetry_snapshots
    WHERE ts < $1
    ORDER BY ts
    LIMIT $2
);
"#;

pub const ALERT_COLUMNS: &str = r#"
id, vehicle_id, company_id, driver_id, alert_type, priority, status, title, message,
current_value, threshold_value, latitude, longitude, triggered_at, acknowledged_at,
acknowledged_by, resolved_at, resolved_by, resolution_notes, notification_sent,
notification_sent_at
"#;

pub const INSERT_ALERT: &str = r#"
INSERT INTO vehicle_alerts (
    id, vehicle_id, company_id, driver_id, alert_type, priority, status, title, message,
    current_value, threshold_value, latitude, longitude, triggered_at, acknowledged_at,
    acknowledged_by, resolved_at, resolved_by, resolution_notes, notification_sent,
    notification_sent_at
) VALUES (
    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19,
    $20, $21
);
"#;

pub const UPDATE_ALERT: &str = r#"
UPDATE vehicle_alerts
SET status = $2,
    acknowledged_at = $3,
    acknowledged_by = $4,
    resolved_at = $5,
    resolved_by = $6,
    resolution_notes = $7,
    notification_sent = $8,
    notification_sent_at = $9
WHERE id = $1 AND status = $10;
"#;

pub const MARK_NOTIFICATION_SENT: &str = r#"
UPDATE vehicle_alerts
SET notification_sent = TRUE,
    notification_sent_at = $2
WHERE id = $1 AND NOT notification_sent;
"#;

pub const ACKNOWLEDGE_ACTIVE_FOR_VEHICLE: &str = r#"
UPDATE vehicle_alerts
SET status = 'ACKNOWLEDGED',
    acknowledged_at = $2,
    acknowledged_by = $3
WHERE vehicle_id = $1 AND status = 'ACTIVE';
"#;

pub const UPDATE_ACTIVE_BEFORE: &str = r#"
UPDATE vehicle_alerts
SET status = $2
WHERE status = 'ACTIVE' AND triggered_at < $1;
"#;

pub const COUNT_ALERTS_BY_COMPANY: &str = r#"
SELECT alert_type, priority, status, COUNT(*) AS count
FROM vehicle_alerts
WHERE company_id = $1
GROUP BY alert_type, priority, status;
"#;
