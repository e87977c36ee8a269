use prospector_core::context::slugify;
use thiserror::Error;

use crate::models::{ProspectorConfig, StorageConfig};

/// Every problem found in a configuration, reported together.
#[derive(Debug, Error)]
#[error("invalid configuration: {}", problems.join("; "))]
pub struct ConfigValidationError {
    pub problems: Vec<String>,
}

impl ProspectorConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let mut problems = Vec::new();

        match &self.storage {
            StorageConfig::Local { root } if root.as_os_str().is_empty() => {
                problems.push("storage.root must not be empty".to_string());
            }
            StorageConfig::S3 { bucket, .. } if bucket.trim().is_empty() => {
                problems.push("storage.bucket must not be empty".to_string());
            }
            _ => {}
        }

        let lease = &self.queue.lease;
        if lease.lease_ttl_secs <= 0 {
            problems.push("queue.lease.lease_ttl_secs must be positive".to_string());
        }
        if !(lease.renew_at_fraction > 0.0 && lease.renew_at_fraction < 1.0) {
            problems.push("queue.lease.renew_at_fraction must be between 0 and 1".to_string());
        }
        if lease.reaper_interval_ms == 0 {
            problems.push("queue.lease.reaper_interval_ms must be positive".to_string());
        }

        let retry = &self.queue.retry;
        if !(0.0..=1.0).contains(&retry.jitter_ratio) {
            problems.push("queue.retry.jitter_ratio must be within [0, 1]".to_string());
        }
        if retry.backoff_max_ms < retry.backoff_base_ms {
            problems.push("queue.retry.backoff_max_ms is below backoff_base_ms".to_string());
        }

        let worker = &self.queue.worker;
        if worker.batch_size == 0 {
            problems.push("queue.worker.batch_size must be positive".to_string());
        }
        if worker.idle_backoff_max_ms < worker.idle_backoff_min_ms {
            problems.push("queue.worker.idle_backoff_max_ms is below idle_backoff_min_ms".to_string());
        }

        for (field, value) in [
            (
                "coverage.overlap_threshold_percent",
                self.coverage.overlap_threshold_percent,
            ),
            (
                "coverage.wilderness_threshold_percent",
                self.coverage.wilderness_threshold_percent,
            ),
        ] {
            if !(0.0..=100.0).contains(&value) {
                problems.push(format!("{field} must be within [0, 100]"));
            }
        }

        if self.records.compaction_lock_ttl_secs <= 0 {
            problems.push("records.compaction_lock_ttl_secs must be positive".to_string());
        }

        if self.worker.compaction_interval.is_zero() {
            problems.push("worker.compaction_interval must be positive".to_string());
        }
        for campaign in &self.worker.campaigns {
            if slugify(campaign).is_empty() {
                problems.push(format!("worker.campaigns: {campaign:?} has no usable slug"));
            }
        }
        if self.worker.queues.is_empty() {
            problems.push("worker.queues must list at least one queue".to_string());
        }
        for queue in &self.worker.queues {
            if slugify(queue).is_empty() {
                problems.push(format!("worker.queues: {queue:?} has no usable slug"));
            }
        }

        if let Err(err) = self.geocoding.static_geocoder() {
            problems.push(format!("{err:#}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError { problems })
        }
    }
}
