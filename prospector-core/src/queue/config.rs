use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Knobs shared by every queue of a deployment.
///
/// All fields carry defaults so a config file only needs to mention what it
/// changes.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct QueueConfig {
    /// Lease defaults (TTL, reaper cadence).
    pub lease: LeaseConfig,
    /// Retry/backoff policy applied on nack and lease expiry.
    pub retry: RetryConfig,
    /// Polling behaviour of queue workers.
    pub worker: WorkerConfig,
}

/// Lease/heartbeat tuning for worker tasks.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Default TTL for task leases (seconds)
    pub lease_ttl_secs: i64,
    /// Renew when remaining TTL drops below this fraction of the original TTL (e.g. 0.5)
    pub renew_at_fraction: f32,
    /// Minimum margin before expiry to trigger a renewal regardless of fraction (ms)
    pub renew_min_margin_ms: u64,
    /// Cadence of the reaper scanning for expired leases (ms)
    pub reaper_interval_ms: u64,
}

impl LeaseConfig {
    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_secs: 15 * 60,
            renew_at_fraction: 0.5,
            renew_min_margin_ms: 2_000,
            reaper_interval_ms: 60_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed deliveries tolerated; the next one parks the task in `failed/`.
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so tiny delays still randomise a bit.
    pub jitter_min_ms: u64,
}

impl RetryConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    /// Exponential anchor for `attempt` (1-based), capped at the maximum.
    fn anchor_delay_ms(&self, attempt: u16) -> u64 {
        if attempt == 0 || self.backoff_base_ms == 0 {
            return 0;
        }
        let exp = i32::from(attempt.saturating_sub(1));
        let scaled = (self.backoff_base_ms as f64) * 2f64.powi(exp);
        scaled.min(self.backoff_max_ms as f64).max(0.0) as u64
    }

    /// Jittered delay before retry `attempt`. Deterministic for a given
    /// `(seed, attempt)` so every replica computes the same schedule.
    pub fn delay_for(&self, seed: &str, attempt: u16) -> Duration {
        let anchor_ms = self.anchor_delay_ms(attempt);
        if anchor_ms == 0 {
            return Duration::ZERO;
        }

        let jitter_ratio = f64::from(self.jitter_ratio.max(0.0));
        let jitter_span = ((anchor_ms as f64) * jitter_ratio)
            .max(self.jitter_min_ms as f64)
            .min(self.backoff_max_ms as f64);

        let lower = 0f64.max(anchor_ms as f64 - jitter_span);
        let upper = (anchor_ms as f64 + jitter_span).min(self.backoff_max_ms as f64);
        if upper <= lower {
            return Duration::from_millis(lower.round() as u64);
        }

        let unit = deterministic_unit(seed, attempt);
        Duration::from_millis((lower + (upper - lower) * unit).round() as u64)
    }
}

fn deterministic_unit(seed: &str, attempt: u16) -> f64 {
    let mut hasher = DefaultHasher::default();
    seed.hash(&mut hasher);
    attempt.hash(&mut hasher);
    let bits = hasher.finish();
    (bits as f64) / (u64::MAX as f64)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

/// Poll loop tuning for [`QueueWorker`](super::QueueWorker).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Tasks claimed per poll.
    pub batch_size: usize,
    /// First sleep after an empty poll (ms); doubles up to the maximum.
    pub idle_backoff_min_ms: u64,
    pub idle_backoff_max_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            idle_backoff_min_ms: 500,
            idle_backoff_max_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_stay_within_bounds() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for("task", 0), Duration::ZERO);

        let first = retry.delay_for("task", 1).as_millis() as u64;
        assert!((1_500..=2_500).contains(&first), "{first}");

        let late = retry.delay_for("task", 20).as_millis() as u64;
        assert!(late <= retry.backoff_max_ms);
        assert!(late >= retry.backoff_max_ms - retry.backoff_max_ms / 4 - 1);
    }

    #[test]
    fn delays_are_deterministic_per_seed() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for("a", 3), retry.delay_for("a", 3));
    }

    #[test]
    fn zero_base_disables_backoff() {
        let retry = RetryConfig {
            backoff_base_ms: 0,
            ..RetryConfig::default()
        };
        assert_eq!(retry.delay_for("a", 4), Duration::ZERO);
    }
}
