//! Daily purge of snapshots older than the retention window.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::RetentionConfig;
use crate::errors::Result;
use crate::metrics::RETENTION_DELETED_TOTAL;
use crate::store::SnapshotStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetentionRunSummary {
    pub started_at: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub deleted: u64,
    pub batches: u32,
    /// True when the run stopped at the iteration cap with rows possibly left.
    pub hit_iteration_cap: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionStatistics {
    pub enabled: bool,
    pub retention_days: i64,
    pub cutoff_date: DateTime<Utc>,
    pub total_records: u64,
    pub expired_records: u64,
    pub last_run: Option<RetentionRunSummary>,
}

pub struct RetentionJob {
    snapshots: Arc<dyn SnapshotStore>,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
    last_run: Mutex<Option<RetentionRunSummary>>,
}

impl RetentionJob {
    pub fn new(
        snapshots: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            snapshots,
            clock,
            config,
            last_run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Always at least one day in the past.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.config.retention_days.max(1))
    }

    /// Delete expired snapshots in batches until a short batch or the iteration cap.
    pub async fn run(&self) -> Result<RetentionRunSummary> {
        let started = Instant::now();
        let started_at = self.clock.now();
        let cutoff = self.cutoff(started_at);
        let batch_size = self.config.batch_size.max(1);

        info!(
            "Retention run started: deleting snapshots before {} ({} days)",
            cutoff, self.config.retention_days
        );

        let mut deleted = 0u64;
        let mut batches = 0u32;
        let mut hit_iteration_cap = true;

        while batches < self.config.max_iterations {
            let removed = self.snapshots.delete_before(cutoff, batch_size).await?;
            batches += 1;
            deleted += removed;
            RETENTION_DELETED_TOTAL.inc_by(removed as f64);
            debug!("Retention batch {}: deleted {} snapshots", batches, removed);

            if removed < batch_size {
                hit_iteration_cap = false;
                break;
            }
            if !self.config.batch_pause.is_zero() {
                tokio::time::sleep(self.config.batch_pause).await;
            }
        }

        let summary = RetentionRunSummary {
            started_at,
            cutoff,
            deleted,
            batches,
            hit_iteration_cap,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Retention run finished in {}ms: {} snapshots deleted in {} batches",
            summary.duration_ms, summary.deleted, summary.batches
        );
        if summary.hit_iteration_cap {
            info!(
                "Retention stopped after {} batches; remaining rows wait for the next run",
                batches
            );
        }

        *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(summary.clone());
        Ok(summary)
    }

    /// Manual trigger. Runs even when the daily schedule is disabled.
    pub async fn run_now(&self) -> Result<RetentionRunSummary> {
        info!("Manual retention run requested");
        self.run().await
    }

    pub async fn statistics(&self) -> Result<RetentionStatistics> {
        let cutoff = self.cutoff(self.clock.now());
        let total_records = self.snapshots.count_all().await?;
        let expired_records = self.snapshots.count_before(cutoff).await?;
        Ok(RetentionStatistics {
            enabled: self.config.enabled,
            retention_days: self.config.retention_days,
            cutoff_date: cutoff,
            total_records,
            expired_records,
            last_run: self.last_run.lock().unwrap_or_else(|e| e.into_inner()).clone(),
        })
    }
}

/// Time left until the next `hour:00` UTC strictly after `now`.
pub fn duration_until_next_run(now: DateTime<Utc>, hour: u32) -> std::time::Duration {
    let today = now
        .date_naive()
        .and_hms_opt(hour.min(23), 0, 0)
        .map(|t| t.and_utc());
    let next = match today {
        Some(t) if t > now => t,
        Some(t) => t + Duration::days(1),
        None => now + Duration::days(1),
    };
    (next - now).to_std().unwrap_or_default()
}

pub async fn run_retention_loop(job: Arc<RetentionJob>) {
    if !job.config().enabled {
        info!("Scheduled retention is disabled");
        return;
    }

    loop {
        let wait = duration_until_next_run(job.clock.now(), job.config().run_hour);
        info!("Next retention run in {}s", wait.as_secs());
        tokio::time::sleep(wait).await;

        if let Err(e) = job.run().await {
            error!("Retention run failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Reading, Snapshot, TelemetrySource};
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn config(batch_size: u64, max_iterations: u32) -> RetentionConfig {
        RetentionConfig {
            batch_size,
            max_iterations,
            batch_pause: std::time::Duration::ZERO,
            ..Default::default()
        }
    }

    async fn seed(store: &MemoryStore, at: DateTime<Utc>, count: usize) {
        for _ in 0..count {
            let mut reading = Reading::new(1, TelemetrySource::Device);
            reading.timestamp = Some(at);
            let snapshot = Snapshot::from_reading(reading, 1, "device-gateway", at);
            SnapshotStore::insert(store, &snapshot).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_deletes_only_past_window_and_is_idempotent() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        seed(&store, now - Duration::days(91), 1).await;
        seed(&store, now - Duration::days(89), 1).await;

        let job = RetentionJob::new(store.clone(), Arc::new(ManualClock::new(now)), config(10, 10));
        let first = job.run().await.unwrap();
        assert_eq!(first.deleted, 1);
        assert_eq!(first.batches, 1);
        assert!(!first.hit_iteration_cap);
        assert_eq!(SnapshotStore::count_all(store.as_ref()).await.unwrap(), 1);

        let second = job.run().await.unwrap();
        assert_eq!(second.deleted, 0);
        assert_eq!(SnapshotStore::count_all(store.as_ref()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_positive_window_keeps_fresh_snapshots() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        seed(&store, now, 2).await;
        seed(&store, now - Duration::days(2), 1).await;

        let job = RetentionJob::new(
            store.clone(),
            Arc::new(ManualClock::new(now)),
            RetentionConfig {
                retention_days: -1,
                ..config(10, 10)
            },
        );
        assert!(job.cutoff(now) < now);
        assert_eq!(job.run().await.unwrap().deleted, 1);
        assert_eq!(SnapshotStore::count_all(store.as_ref()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_batches_until_short_batch() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        seed(&store, now - Duration::days(120), 25).await;

        let clock = Arc::new(ManualClock::new(now));
        let job = RetentionJob::new(store.clone(), clock, config(10, 100));
        let summary = job.run().await.unwrap();
        assert_eq!(summary.deleted, 25);
        assert_eq!(summary.batches, 3);
    }

    #[tokio::test]
    async fn test_iteration_cap() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        seed(&store, now - Duration::days(120), 25).await;

        let job = RetentionJob::new(store.clone(), Arc::new(ManualClock::new(now)), config(10, 2));
        let summary = job.run().await.unwrap();
        assert_eq!(summary.deleted, 20);
        assert!(summary.hit_iteration_cap);

        let stats = job.statistics().await.unwrap();
        assert_eq!(stats.total_records, 5);
        assert_eq!(stats.expired_records, 5);
        assert_eq!(stats.last_run.unwrap().deleted, 20);
    }

    #[tokio::test]
    async fn test_run_now_ignores_disabled_schedule() {
        let now = Utc::now();
        let store = Arc::new(MemoryStore::new());
        seed(&store, now - Duration::days(100), 3).await;

        let mut cfg = config(10, 10);
        cfg.enabled = false;
        let job = RetentionJob::new(store.clone(), Arc::new(ManualClock::new(now)), cfg);
        assert_eq!(job.run_now().await.unwrap().deleted, 3);
        assert!(!job.statistics().await.unwrap().enabled);
    }

    #[test]
    fn test_duration_until_next_run() {
        let before = Utc.with_ymd_and_hms(2025, 6, 1, 1, 30, 0).unwrap();
        assert_eq!(
            duration_until_next_run(before, 2),
            std::time::Duration::from_secs(30 * 60)
        );

        let exactly = Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap();
        assert_eq!(
            duration_until_next_run(exactly, 2),
            std::time::Duration::from_secs(24 * 3600)
        );

        let after = Utc.with_ymd_and_hms(2025, 6, 1, 23, 0, 0).unwrap();
        assert_eq!(
            duration_until_next_run(after, 2),
            std::time::Duration::from_secs(3 * 3600)
        );
    }
}
