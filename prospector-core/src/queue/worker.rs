use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::config::{LeaseConfig, QueueConfig};
use super::lease::TaskLease;
use super::retry::retry_with_backoff;
use super::service::TaskQueue;
use crate::error::{ProspectorError, Result};

/// Outcome of handler execution for a single task.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HandlerOutcome {
    Completed,
    Retry { error: String },
    Fail { error: String },
}

/// Executes leased tasks. Handlers must tolerate seeing the same task more
/// than once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, lease: &TaskLease) -> HandlerOutcome;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Acks or nacks rejected because the lease had already been reaped.
    pub lost_leases: usize,
}

/// Poll/handle/settle loop over one queue.
pub struct QueueWorker<Q: TaskQueue + ?Sized> {
    queue: Arc<Q>,
    handler: Arc<dyn TaskHandler>,
    config: QueueConfig,
    shutdown: CancellationToken,
}

impl<Q: TaskQueue + ?Sized> fmt::Debug for QueueWorker<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueWorker")
            .field("queue_type", &std::any::type_name::<Q>())
            .field("config", &self.config)
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<Q: TaskQueue + ?Sized + 'static> QueueWorker<Q> {
    pub fn new(
        queue: Arc<Q>,
        handler: Arc<dyn TaskHandler>,
        config: QueueConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            handler,
            config,
            shutdown,
        }
    }

    /// Run until the shutdown token fires.
    pub async fn run(&self) -> Result<WorkerReport> {
        let mut report = WorkerReport::default();
        let min_idle = self.config.worker.idle_backoff_min_ms.max(1);
        let max_idle = self.config.worker.idle_backoff_max_ms.max(min_idle);
        let mut idle_ms = min_idle;

        loop {
            if self.shutdown.is_cancelled() {
                info!("Queue worker shutting down");
                break;
            }

            let handled = match self.run_once(&mut report).await {
                Ok(handled) => handled,
                Err(err) => {
                    error!("queue worker poll failed: {err}");
                    0
                }
            };

            if handled > 0 {
                idle_ms = min_idle;
                continue;
            }

            let jitter = rand::rng().random_range(0..=idle_ms / 4);
            let sleep = Duration::from_millis(idle_ms + jitter);
            idle_ms = (idle_ms * 2).min(max_idle);
            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(sleep) => {}
            }
        }
        Ok(report)
    }

    /// Poll once, handle and settle every claimed task. Returns how many
    /// tasks were handled.
    pub async fn run_once(&self, report: &mut WorkerReport) -> Result<usize> {
        let batch = self.config.worker.batch_size.max(1);
        let leases = retry_with_backoff(&self.config.retry, "queue poll", || {
            self.queue.poll(batch)
        })
        .await?;

        let handled = leases.len();
        for lease in leases {
            self.process(lease, report).await;
        }
        Ok(handled)
    }

    async fn process(&self, lease: TaskLease, report: &mut WorkerReport) {
        let renewer = spawn_renewer(Arc::clone(&self.queue), lease.clone(), self.config.lease);
        let outcome = self.handler.handle(&lease).await;
        renewer.cancel();

        // Settle against the freshest lease; the renewer may have replaced it.
        let lease = renewer.latest().await.unwrap_or(lease);
        let settled = match &outcome {
            HandlerOutcome::Completed => {
                self.queue.ack(&lease).await.map(|_| report.completed += 1)
            }
            HandlerOutcome::Retry { error } => self
                .queue
                .nack(&lease, Some(error.clone()))
                .await
                .map(|_| report.retried += 1),
            HandlerOutcome::Fail { error } => self
                .queue
                .dead_letter(&lease, Some(error.clone()))
                .await
                .map(|_| report.failed += 1),
        };

        match settled {
            Ok(()) => debug!(task = %lease.task.identity, ?outcome, "task settled"),
            Err(ProspectorError::LeaseExpired { dedup_key }) => {
                warn!(%dedup_key, ?outcome, "lease lost before settling; task will be redelivered");
                report.lost_leases += 1;
            }
            Err(err) => error!(task = %lease.task.identity, "failed to settle task: {err}"),
        }
    }
}

/// Background lease renewal for one in-flight task.
struct Renewer {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Option<TaskLease>>,
}

impl Renewer {
    fn cancel(&self) {
        self.cancel.cancel();
    }

    async fn latest(self) -> Option<TaskLease> {
        self.handle.await.ok().flatten()
    }
}

fn spawn_renewer<Q: TaskQueue + ?Sized + 'static>(
    queue: Arc<Q>,
    lease: TaskLease,
    config: LeaseConfig,
) -> Renewer {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        let ttl = config.lease_ttl();
        let ttl_total = ttl.to_std().unwrap_or(Duration::from_secs(30));
        let margin = Duration::from_millis(config.renew_min_margin_ms);
        let mut current = lease;
        let mut renewed = false;

        loop {
            let now = chrono::Utc::now();
            let mut sleep_dur = Duration::from_millis(500);
            if current.expires_at() > now {
                let target = ttl_total.mul_f32((1.0 - config.renew_at_fraction).clamp(0.0, 1.0));
                let remaining = (current.expires_at() - now).to_std().unwrap_or(Duration::ZERO);
                sleep_dur = if remaining > target {
                    remaining - target
                } else if remaining > margin {
                    remaining - margin
                } else {
                    Duration::ZERO
                };
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(sleep_dur) => {}
            }

            match queue.renew(&current, ttl).await {
                Ok(updated) => {
                    trace!(task = %updated.task.identity, renewals = updated.lease.renewals, "lease renewed");
                    current = updated;
                    renewed = true;
                }
                Err(ProspectorError::LeaseExpired { .. }) => {
                    trace!("lease renew skipped (settled or reaped)");
                    break;
                }
                Err(err) => {
                    warn!("lease renew failed: {err}");
                    // Continue; the reaper may reclaim
                }
            }
        }
        renewed.then_some(current)
    });
    Renewer { cancel, handle }
}
