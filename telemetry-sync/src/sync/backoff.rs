use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::SyncConfig;
use crate::model::VehicleId;

/// Exponential backoff applied to a vehicle after consecutive failed syncs.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

impl From<&SyncConfig> for BackoffPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            // below 1.0 the delay would shrink with every failure
            multiplier: config.backoff_multiplier.max(1.0),
            max_backoff: config.max_backoff,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `failures`-th consecutive failure.
    ///
    /// `multiplier ^ min(failures, max_retries + 1)` minutes, capped at
    /// `max_backoff`. With the defaults: 2, 4, 8, 16, 16... minutes.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.max_retries.saturating_add(1));
        let minutes = self.multiplier.powi(exponent as i32);
        let max_minutes = self.max_backoff.num_minutes() as f64;
        if !minutes.is_finite() || minutes >= max_minutes {
            return self.max_backoff;
        }
        Duration::milliseconds((minutes * 60_000.0).round() as i64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VehicleSyncState {
    pub consecutive_failures: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_allowed_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl VehicleSyncState {
    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.next_allowed_attempt.is_some_and(|next| now < next)
    }
}

/// Per-vehicle failure bookkeeping, shared across sync runs.
#[derive(Debug)]
pub struct BackoffTracker {
    policy: BackoffPolicy,
    states: Mutex<HashMap<VehicleId, VehicleSyncState>>,
}

impl BackoffTracker {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<VehicleId, VehicleSyncState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn should_skip(&self, vehicle_id: VehicleId, now: DateTime<Utc>) -> bool {
        self.states()
            .get(&vehicle_id)
            .is_some_and(|s| s.in_backoff(now))
    }

    pub fn record_success(&self, vehicle_id: VehicleId, now: DateTime<Utc>) {
        let mut states = self.states();
        let state = states.entry(vehicle_id).or_default();
        state.consecutive_failures = 0;
        state.last_attempt = Some(now);
        state.next_allowed_attempt = None;
        state.last_error = None;
    }

    /// Returns the backoff delay that now applies.
    pub fn record_failure(
        &self,
        vehicle_id: VehicleId,
        now: DateTime<Utc>,
        error: String,
    ) -> Duration {
        let mut states = self.states();
        let state = states.entry(vehicle_id).or_default();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let delay = self.policy.delay(state.consecutive_failures);
        state.last_attempt = Some(now);
        state.next_allowed_attempt = Some(now + delay);
        state.last_error = Some(error);
        delay
    }

    /// Returns false when the vehicle had no state.
    pub fn reset(&self, vehicle_id: VehicleId) -> bool {
        self.states().remove(&vehicle_id).is_some()
    }

    pub fn state(&self, vehicle_id: VehicleId) -> Option<VehicleSyncState> {
        self.states().get(&vehicle_id).cloned()
    }

    pub fn in_backoff_count(&self, now: DateTime<Utc>) -> usize {
        self.states().values().filter(|s| s.in_backoff(now)).count()
    }

    /// Vehicles with at least one failure since their last success.
    pub fn failing(&self) -> Vec<(VehicleId, VehicleSyncState)> {
        let mut failing: Vec<_> = self
            .states()
            .iter()
            .filter(|(_, s)| s.consecutive_failures > 0)
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        failing.sort_by_key(|(id, _)| *id);
        failing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::from(&SyncConfig::default())
    }

    #[test]
    fn test_delay_sequence() {
        let p = policy();
        let minutes: Vec<i64> = (1..=6).map(|n| p.delay(n).num_minutes()).collect();
        assert_eq!(minutes, vec![2, 4, 8, 16, 16, 16]);
    }

    #[test]
    fn test_delay_capped_at_max_backoff() {
        let p = BackoffPolicy {
            max_retries: 10,
            multiplier: 3.0,
            max_backoff: Duration::minutes(30),
        };
        assert_eq!(p.delay(3), Duration::minutes(27));
        assert_eq!(p.delay(4), Duration::minutes(30));
        assert_eq!(p.delay(u32::MAX), Duration::minutes(30));
    }

    #[test]
    fn test_shrinking_multiplier_is_floored() {
        let p = BackoffPolicy::from(&SyncConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        });
        let delays: Vec<Duration> = (1..=5).map(|n| p.delay(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|d| *d == Duration::minutes(1)));
    }

    #[test]
    fn test_tracker_skip_and_reset() {
        let tracker = BackoffTracker::new(policy());
        let now = Utc::now();

        assert!(!tracker.should_skip(1, now));
        let delay = tracker.record_failure(1, now, "timeout".to_string());
        assert_eq!(delay, Duration::minutes(2));
        assert!(tracker.should_skip(1, now + Duration::minutes(1)));
        assert!(!tracker.should_skip(1, now + Duration::minutes(2)));
        assert_eq!(tracker.in_backoff_count(now), 1);

        assert!(tracker.reset(1));
        assert!(!tracker.reset(1));
        assert!(!tracker.should_skip(1, now));
    }

    #[test]
    fn test_success_clears_failures() {
        let tracker = BackoffTracker::new(policy());
        let now = Utc::now();
        tracker.record_failure(4, now, "no data".to_string());
        tracker.record_failure(4, now, "no data".to_string());
        tracker.record_success(4, now);

        let state = tracker.state(4).unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.next_allowed_attempt, None);
        assert_eq!(state.last_error, None);
        assert_eq!(state.last_attempt, Some(now));
        assert_eq!(tracker.record_failure(4, now, "no data".to_string()), Duration::minutes(2));
    }
}
