use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::config::QueueConfig;
use super::lease::{Lease, TaskLease};
use super::task::{PushOutcome, QueuedTask, RetryDisposition, TaskPayload};
use crate::context::{CampaignContext, QueuePaths, QueueState};
use crate::error::{ProspectorError, Result};
use crate::storage::ObjectStore;

/// Contract exposed to producers and worker loops.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue unless an entry with the same dedupe key already exists in
    /// any state. Failed tasks stay failed until [`redrive`](Self::redrive).
    async fn push(&self, payload: TaskPayload) -> Result<PushOutcome>;

    /// Move a failed task back to pending with a fresh attempt budget.
    /// Returns `false` when no failed entry exists for `dedup_key`.
    async fn redrive(&self, dedup_key: &str) -> Result<bool>;

    /// Claim up to `batch_size` available tasks.
    async fn poll(&self, batch_size: usize) -> Result<Vec<TaskLease>>;

    async fn ack(&self, lease: &TaskLease) -> Result<()>;

    /// Give a task back for another attempt, or park it once attempts run
    /// out.
    async fn nack(
        &self,
        lease: &TaskLease,
        error: Option<String>,
    ) -> Result<RetryDisposition>;

    /// Park a task in `failed/` without further attempts.
    async fn dead_letter(&self, lease: &TaskLease, error: Option<String>) -> Result<()>;

    async fn renew(
        &self,
        lease: &TaskLease,
        extend_by: chrono::Duration,
    ) -> Result<TaskLease>;

    async fn stats(&self) -> Result<QueueStats>;
}

#[async_trait]
pub trait LeaseExpiryScanner: Send + Sync {
    /// Returns the number of expired entries moved out of `processing/`.
    async fn scan_expired_leases(&self) -> Result<ReapReport>;
}

/// Entry counts per directory at one instant.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    /// Pending plus processing.
    pub fn outstanding(&self) -> usize {
        self.pending + self.processing
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub requeued: usize,
    pub failed: usize,
    /// Processing copies dropped because a completed entry already existed.
    pub already_completed: usize,
    /// Expired entries left alone because they were renewed, settled or
    /// reaped by someone else in the meantime.
    pub contended: usize,
}

impl ReapReport {
    pub fn total(&self) -> usize {
        self.requeued + self.failed + self.already_completed
    }
}

/// Directory-per-state queue on an [`ObjectStore`].
///
/// Each entry is one JSON object named by the digest of its dedupe key and
/// lives in exactly one of `pending/`, `processing/`, `completed/` or
/// `failed/`. Claiming goes through [`ObjectStore::claim`], so concurrent
/// pollers never both own a task.
#[derive(Clone)]
pub struct ObjectStoreQueue {
    name: String,
    store: Arc<dyn ObjectStore>,
    paths: QueuePaths,
    owner: String,
    config: QueueConfig,
}

impl fmt::Debug for ObjectStoreQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreQueue")
            .field("name", &self.name)
            .field("paths", &self.paths)
            .field("owner", &self.owner)
            .field("backend", &self.store.backend_name())
            .finish()
    }
}

impl ObjectStoreQueue {
    pub fn new(ctx: &CampaignContext, name: &str, config: QueueConfig) -> Self {
        Self {
            name: name.to_string(),
            store: Arc::clone(ctx.store()),
            paths: ctx.paths().queue(name),
            owner: ctx.worker_id().to_string(),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn entry(&self, state: QueueState, dedup_key: &str) -> String {
        self.paths.entry(state, dedup_key)
    }

    async fn load(&self, state: QueueState, dedup_key: &str) -> Result<Option<QueuedTask>> {
        let Some(bytes) = self.store.get(&self.entry(state, dedup_key)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Current processing entry and its raw body, provided `lease` still
    /// owns it.
    async fn load_owned(&self, lease: &TaskLease) -> Result<(QueuedTask, Vec<u8>)> {
        let key = self.entry(QueueState::Processing, lease.dedup_key());
        if let Some(raw) = self.store.get(&key).await? {
            let task: QueuedTask = serde_json::from_slice(&raw)?;
            if task.lease.as_ref().map(|l| l.lease_id) == Some(lease.lease.lease_id) {
                return Ok((task, raw));
            }
        }
        Err(lease_lost(lease.dedup_key()))
    }

    /// Move a processing entry to `to`, provided it still holds `observed`.
    ///
    /// The destination is written before the processing entry is removed, so
    /// a crash in between leaves the task visible twice rather than lost. A
    /// pending copy cannot be claimed while the processing entry exists.
    /// Returns `false`, withdrawing the destination copy, when the processing
    /// entry changed after it was read.
    async fn move_from_processing(
        &self,
        observed: &[u8],
        to: QueueState,
        task: &QueuedTask,
    ) -> Result<bool> {
        let body = serde_json::to_vec_pretty(task)?;
        let dest = self.entry(to, &task.dedup_key);
        let created = self.store.put_if_absent(&dest, body.clone()).await?;

        let source = self.entry(QueueState::Processing, &task.dedup_key);
        if self.store.delete_if_unchanged(&source, observed).await? {
            return Ok(true);
        }
        if created {
            self.store.delete_if_unchanged(&dest, &body).await?;
        }
        Ok(false)
    }

    /// Count an attempt against `task` and route it to pending or failed.
    /// `None` when the processing entry no longer holds `observed`.
    async fn retry_or_park(
        &self,
        mut task: QueuedTask,
        observed: &[u8],
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<RetryDisposition>> {
        task.attempts = task.attempts.saturating_add(1);
        task.lease = None;
        task.updated_at = now;
        if error.is_some() {
            task.last_error = error;
        }

        if task.attempts > self.config.retry.max_attempts {
            if !self.move_from_processing(observed, QueueState::Failed, &task).await? {
                return Ok(None);
            }
            warn!(
                queue = %self.name,
                task = %task.identity,
                attempts = task.attempts,
                error = task.last_error.as_deref().unwrap_or_default(),
                "task exhausted its attempts"
            );
            return Ok(Some(RetryDisposition::Failed {
                attempts: task.attempts,
            }));
        }

        let delay = self.config.retry.delay_for(&task.dedup_key, task.attempts);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        task.available_at = now + delay;
        if !self.move_from_processing(observed, QueueState::Pending, &task).await? {
            return Ok(None);
        }
        debug!(
            queue = %self.name,
            task = %task.identity,
            attempts = task.attempts,
            available_at = %task.available_at,
            "task requeued"
        );
        Ok(Some(RetryDisposition::Requeued {
            attempts: task.attempts,
            available_at: task.available_at,
        }))
    }

    async fn quarantine(&self, state: QueueState, key: &str, raw: Vec<u8>) -> Result<()> {
        let name = key.rsplit('/').next().unwrap_or(key);
        let dest = format!("{}/{name}", self.paths.dir(QueueState::Failed));
        warn!(queue = %self.name, key = %key, "unreadable {state} entry moved to failed");
        self.store.claim(key, &dest, raw).await?;
        Ok(())
    }

    /// Claim tasks as of `now`.
    pub async fn poll_at(
        &self,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskLease>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let mut candidates = self.store.list(&self.paths.dir(QueueState::Pending)).await?;
        // Spread concurrent pollers across the backlog.
        candidates.shuffle(&mut rand::rng());

        let mut claimed = Vec::new();
        for meta in candidates {
            if claimed.len() >= batch_size {
                break;
            }
            let Some(bytes) = self.store.get(&meta.key).await? else {
                continue;
            };
            let mut task: QueuedTask = match serde_json::from_slice(&bytes) {
                Ok(task) => task,
                Err(_) => {
                    self.quarantine(QueueState::Pending, &meta.key, bytes).await?;
                    continue;
                }
            };
            if !task.is_available(now) {
                continue;
            }

            let lease = Lease::new(self.owner.clone(), self.config.lease.lease_ttl(), now);
            task.lease = Some(lease.clone());
            task.updated_at = now;
            let body = serde_json::to_vec_pretty(&task)?;
            let dest = self.entry(QueueState::Processing, &task.dedup_key);
            if self.store.claim(&meta.key, &dest, body).await? {
                debug!(queue = %self.name, task = %task.identity, owner = %self.owner, "claimed task");
                claimed.push(TaskLease { lease, task });
            } else {
                debug!(queue = %self.name, key = %meta.key, "lost claim race");
            }
        }
        Ok(claimed)
    }

    /// Move every processing entry whose lease expired before `now` back to
    /// pending, or to failed once its attempts run out. Entries without a
    /// readable lease are treated as expired.
    pub async fn reap_expired_at(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let mut report = ReapReport::default();
        for meta in self.store.list(&self.paths.dir(QueueState::Processing)).await? {
            let Some(bytes) = self.store.get(&meta.key).await? else {
                continue;
            };
            let task: QueuedTask = match serde_json::from_slice(&bytes) {
                Ok(task) => task,
                Err(_) => {
                    self.quarantine(QueueState::Processing, &meta.key, bytes).await?;
                    report.failed += 1;
                    continue;
                }
            };
            let expired = task.lease.as_ref().is_none_or(|lease| lease.is_expired(now));
            if !expired {
                continue;
            }

            if self
                .store
                .exists(&self.entry(QueueState::Completed, &task.dedup_key))
                .await?
            {
                if self.store.delete_if_unchanged(&meta.key, &bytes).await? {
                    report.already_completed += 1;
                } else {
                    report.contended += 1;
                }
                continue;
            }

            let owner = task
                .lease
                .as_ref()
                .map(|lease| lease.owner.clone())
                .unwrap_or_else(|| "unknown".to_string());
            let reason = format!("lease expired (owner {owner})");
            match self.retry_or_park(task, &bytes, Some(reason), now).await? {
                Some(RetryDisposition::Requeued { .. }) => report.requeued += 1,
                Some(RetryDisposition::Failed { .. }) => report.failed += 1,
                None => {
                    debug!(queue = %self.name, key = %meta.key, "expired entry changed before it could be reaped");
                    report.contended += 1;
                }
            }
        }

        if report.total() > 0 {
            info!(
                queue = %self.name,
                requeued = report.requeued,
                failed = report.failed,
                already_completed = report.already_completed,
                contended = report.contended,
                "reaped expired leases"
            );
        }
        Ok(report)
    }

    /// Read one entry wherever it currently lives.
    pub async fn find(&self, dedup_key: &str) -> Result<Option<(QueueState, QueuedTask)>> {
        for state in QueueState::ALL {
            if let Some(task) = self.load(state, dedup_key).await? {
                return Ok(Some((state, task)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl TaskQueue for ObjectStoreQueue {
    async fn push(&self, payload: TaskPayload) -> Result<PushOutcome> {
        let now = Utc::now();
        let task = QueuedTask::new(payload, now);
        let dedup_key = task.dedup_key.clone();

        for state in QueueState::ALL {
            if self.store.exists(&self.entry(state, &dedup_key)).await? {
                debug!(queue = %self.name, task = %task.identity, %state, "duplicate push ignored");
                return Ok(PushOutcome::Duplicate { dedup_key });
            }
        }

        let body = serde_json::to_vec_pretty(&task)?;
        if !self
            .store
            .put_if_absent(&self.entry(QueueState::Pending, &dedup_key), body)
            .await?
        {
            return Ok(PushOutcome::Duplicate { dedup_key });
        }

        debug!(queue = %self.name, task = %task.identity, "task enqueued");
        Ok(PushOutcome::Enqueued { dedup_key })
    }

    async fn redrive(&self, dedup_key: &str) -> Result<bool> {
        let Some(mut task) = self.load(QueueState::Failed, dedup_key).await? else {
            return Ok(false);
        };
        let now = Utc::now();
        task.attempts = 0;
        task.lease = None;
        task.available_at = now;
        task.updated_at = now;
        let body = serde_json::to_vec_pretty(&task)?;
        let moved = self
            .store
            .claim(
                &self.entry(QueueState::Failed, dedup_key),
                &self.entry(QueueState::Pending, dedup_key),
                body,
            )
            .await?;
        if moved {
            info!(queue = %self.name, task = %task.identity, "failed task re-driven");
        }
        Ok(moved)
    }

    async fn poll(&self, batch_size: usize) -> Result<Vec<TaskLease>> {
        self.poll_at(batch_size, Utc::now()).await
    }

    async fn ack(&self, lease: &TaskLease) -> Result<()> {
        let (mut task, observed) = self.load_owned(lease).await?;
        task.lease = None;
        task.updated_at = Utc::now();
        if !self
            .move_from_processing(&observed, QueueState::Completed, &task)
            .await?
        {
            return Err(lease_lost(lease.dedup_key()));
        }
        debug!(queue = %self.name, task = %task.identity, "task completed");
        Ok(())
    }

    async fn nack(
        &self,
        lease: &TaskLease,
        error: Option<String>,
    ) -> Result<RetryDisposition> {
        let (task, observed) = self.load_owned(lease).await?;
        self.retry_or_park(task, &observed, error, Utc::now())
            .await?
            .ok_or_else(|| lease_lost(lease.dedup_key()))
    }

    async fn dead_letter(&self, lease: &TaskLease, error: Option<String>) -> Result<()> {
        let (mut task, observed) = self.load_owned(lease).await?;
        task.attempts = task.attempts.saturating_add(1);
        task.lease = None;
        task.updated_at = Utc::now();
        task.last_error = error;
        if !self
            .move_from_processing(&observed, QueueState::Failed, &task)
            .await?
        {
            return Err(lease_lost(lease.dedup_key()));
        }
        warn!(
            queue = %self.name,
            task = %task.identity,
            error = task.last_error.as_deref().unwrap_or_default(),
            "task dead-lettered"
        );
        Ok(())
    }

    async fn renew(
        &self,
        lease: &TaskLease,
        extend_by: chrono::Duration,
    ) -> Result<TaskLease> {
        let (mut task, observed) = self.load_owned(lease).await?;
        let now = Utc::now();
        let mut renewed = task.lease.take().unwrap_or_else(|| lease.lease.clone());
        renewed.expires_at = renewed.expires_at.max(now) + extend_by;
        renewed.renewals = renewed.renewals.saturating_add(1);
        task.lease = Some(renewed.clone());
        task.updated_at = now;

        let body = serde_json::to_vec_pretty(&task)?;
        let key = self.entry(QueueState::Processing, &task.dedup_key);
        if !self.store.replace_if_unchanged(&key, &observed, body).await? {
            return Err(lease_lost(lease.dedup_key()));
        }
        Ok(TaskLease {
            lease: renewed,
            task,
        })
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for state in QueueState::ALL {
            let count = self.store.list(&self.paths.dir(state)).await?.len();
            match state {
                QueueState::Pending => stats.pending = count,
                QueueState::Processing => stats.processing = count,
                QueueState::Completed => stats.completed = count,
                QueueState::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }
}

fn lease_lost(dedup_key: &str) -> ProspectorError {
    ProspectorError::LeaseExpired {
        dedup_key: dedup_key.to_string(),
    }
}

#[async_trait]
impl LeaseExpiryScanner for ObjectStoreQueue {
    async fn scan_expired_leases(&self) -> Result<ReapReport> {
        self.reap_expired_at(Utc::now()).await
    }
}
