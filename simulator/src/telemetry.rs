use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Battery {
    pub soc: f64,
    pub soh: f64,
    pub voltage: f64,
    pub temperature: f64,
    pub charging: bool,
    pub range_km: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fuel {
    pub level_l: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub rpm: f64,
    pub ignition: bool,
    pub check_engine: bool,
}

/// Position report in the format the gateway API serves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub imei: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub heading: f64,
    pub speed_kph: f64,
    pub satellites: i32,
    pub odometer_km: f64,
    pub battery: Option<Battery>,
    pub fuel: Option<Fuel>,
    pub engine: Engine,
    pub gsm_signal: i32,
}

const FUEL_TANK_LITRES: f64 = 60.0;

/// Random-walk state of one simulated vehicle.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub imei: String,
    latitude: f64,
    longitude: f64,
    heading: f64,
    speed_kph: f64,
    odometer_km: f64,
    electric: bool,
    soc: f64,
    charging: bool,
    fuel_pct: f64,
}

impl DeviceState {
    pub fn new(imei: String, rng: &mut impl Rng) -> Self {
        Self {
            imei,
            latitude: rng.gen_range(19.2..19.6),
            longitude: rng.gen_range(-99.3..-98.9),
            heading: rng.gen_range(0.0..360.0),
            speed_kph: rng.gen_range(0.0..60.0),
            odometer_km: rng.gen_range(1_000.0..80_000.0),
            electric: rng.gen_bool(0.6),
            soc: rng.gen_range(15.0..100.0),
            charging: false,
            fuel_pct: rng.gen_range(10.0..100.0),
        }
    }

    /// Advance the walk by `secs` seconds.
    pub fn step(&mut self, rng: &mut impl Rng, secs: f64) {
        if self.charging {
            self.speed_kph = 0.0;
            self.soc = (self.soc + secs / 60.0 * 0.8).min(100.0);
            if self.soc >= 100.0 && rng.gen_bool(0.3) {
                self.charging = false;
            }
            return;
        }

        self.heading = (self.heading + rng.gen_range(-20.0..20.0)).rem_euclid(360.0);
        self.speed_kph = (self.speed_kph + rng.gen_range(-12.0..12.0)).clamp(0.0, 150.0);

        let distance_km = self.speed_kph * secs / 3600.0;
        let heading = self.heading.to_radians();
        self.latitude += distance_km * heading.cos() / 111.0;
        self.longitude += distance_km * heading.sin() / (111.0 * self.latitude.to_radians().cos());
        self.odometer_km += distance_km;

        if self.electric {
            self.soc = (self.soc - distance_km * 0.25).max(0.0);
            if self.soc < 8.0 && rng.gen_bool(0.5) {
                self.charging = true;
            }
        } else {
            self.fuel_pct = (self.fuel_pct - distance_km * 0.12).max(0.0);
            if self.fuel_pct < 5.0 && rng.gen_bool(0.5) {
                self.fuel_pct = 100.0;
            }
        }
    }

    pub fn position(&self, rng: &mut impl Rng, at: DateTime<Utc>) -> Position {
        // 2% of reports come from a poor sky view
        let satellites = if rng.gen_bool(0.02) {
            rng.gen_range(0..3)
        } else {
            rng.gen_range(6..14)
        };

        let battery = self.electric.then(|| Battery {
            soc: (self.soc * 10.0).round() / 10.0,
            soh: 96.0,
            voltage: 350.0 + self.soc * 0.5,
            temperature: if rng.gen_bool(0.01) {
                rng.gen_range(56.0..70.0)
            } else {
                rng.gen_range(20.0..40.0)
            },
            charging: self.charging,
            range_km: self.soc * 4.2,
        });
        let fuel = (!self.electric).then(|| Fuel {
            level_l: self.fuel_pct / 100.0 * FUEL_TANK_LITRES,
            percentage: (self.fuel_pct * 10.0).round() / 10.0,
        });

        Position {
            imei: self.imei.clone(),
            timestamp: at,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: rng.gen_range(2_200.0..2_300.0),
            heading: self.heading,
            speed_kph: (self.speed_kph * 10.0).round() / 10.0,
            satellites,
            odometer_km: (self.odometer_km * 10.0).round() / 10.0,
            battery,
            fuel,
            engine: Engine {
                rpm: if self.speed_kph > 0.0 { 800.0 + self.speed_kph * 20.0 } else { 0.0 },
                ignition: self.speed_kph > 0.0,
                check_engine: rng.gen_bool(0.01),
            },
            gsm_signal: rng.gen_range(8..31),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_stays_in_bounds() {
        let mut rng = rand::thread_rng();
        let mut device = DeviceState::new("356938035640001".to_string(), &mut rng);
        let start_odometer = device.odometer_km;

        for _ in 0..1_000 {
            device.step(&mut rng, 30.0);
            let p = device.position(&mut rng, Utc::now());
            assert!((0.0..=150.0).contains(&p.speed_kph));
            if let Some(b) = &p.battery {
                assert!((0.0..=100.0).contains(&b.soc));
            }
            if let Some(f) = &p.fuel {
                assert!((0.0..=100.0).contains(&f.percentage));
            }
        }
        assert!(device.odometer_km >= start_odometer);
    }
}
