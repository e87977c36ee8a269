use std::sync::Arc;
use std::time::Duration;

use prospector_config::ProspectorConfig;
use prospector_core::ProspectorError;
use prospector_core::context::{CampaignContext, DataPaths};
use prospector_core::coverage::CoverageIndex;
use prospector_core::queue::{LeaseExpiryScanner, ObjectStoreQueue, spawn_lease_reaper};
use prospector_core::records::{CompactionReport, RecordLog};
use prospector_core::storage::ObjectStore;
use prospector_core::workflow::{
    CampaignState, CampaignWorkflow, ProspectingStages, StageActions, TransitionTable,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Background maintenance for every configured campaign.
pub struct Daemon {
    config: ProspectorConfig,
    store: Arc<dyn ObjectStore>,
    worker_id: String,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("backend", &self.store.backend_name())
            .field("worker_id", &self.worker_id)
            .field("campaigns", &self.config.worker.campaigns)
            .field("tasks", &self.handles.len())
            .field("shutdown_cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl Daemon {
    pub fn new(config: ProspectorConfig, store: Arc<dyn ObjectStore>) -> Self {
        let worker_id = config.worker_id();
        Self {
            config,
            store,
            worker_id,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Spawn the reaper, compactor and (optionally) workflow driver of each
    /// campaign.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let table = Arc::new(TransitionTable::standard()?);
        let actions: Arc<dyn StageActions> = Arc::new(ProspectingStages::new(
            Arc::new(self.config.geocoding.static_geocoder()?),
            CoverageIndex::new(
                Arc::clone(&self.store),
                DataPaths::default(),
                self.config.coverage,
            ),
            self.config.queue.clone(),
            self.config.records,
        ));

        for campaign in &self.config.worker.campaigns {
            let ctx = CampaignContext::new(
                campaign,
                DataPaths::default(),
                Arc::clone(&self.store),
                self.worker_id.clone(),
            );

            let queues: Vec<Arc<dyn LeaseExpiryScanner>> = self
                .config
                .worker
                .queues
                .iter()
                .map(|name| {
                    Arc::new(ObjectStoreQueue::new(&ctx, name, self.config.queue.clone()))
                        as Arc<dyn LeaseExpiryScanner>
                })
                .collect();
            self.handles.push(spawn_lease_reaper(
                queues,
                self.config.queue.lease.reaper_interval(),
                self.shutdown.clone(),
            ));

            self.handles.push(spawn_compactor(
                RecordLog::new(ctx.clone(), self.config.records),
                self.config.worker.compaction_interval,
                self.shutdown.clone(),
            ));

            if !self.config.worker.advance_interval.is_zero() {
                self.handles.push(spawn_advancer(
                    ctx,
                    Arc::clone(&table),
                    Arc::clone(&actions),
                    self.config.worker.advance_interval,
                    self.shutdown.clone(),
                ));
            }

            info!(campaign = %campaign, worker_id = %self.worker_id, "campaign maintenance started");
        }

        if self.config.worker.campaigns.is_empty() {
            warn!("no campaigns configured; nothing to maintain");
        }
        Ok(())
    }

    /// Cancel every task and wait for it to finish.
    pub async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown of maintenance tasks");
        self.shutdown.cancel();

        for handle in std::mem::take(&mut self.handles) {
            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Maintenance task failed: {:?}", e),
                Err(_) => warn!("Maintenance task timed out during shutdown"),
            }
        }
        info!("Maintenance shutdown complete");
    }
}

fn spawn_compactor(
    log: RecordLog,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(campaign = %log.context().name(), "Compactor shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    compact_once(&log).await;
                }
            }
        }
    })
}

/// One compaction pass. A lock held by another worker is not an error.
async fn compact_once(log: &RecordLog) -> Option<CompactionReport> {
    let campaign = log.context().name();
    match log.compact().await {
        Ok(report) => {
            if report.checkpoint_rewritten || report.corrupt_entries > 0 {
                info!(
                    campaign = %campaign,
                    records = report.checkpoint_records,
                    merged = report.wal_entries_merged,
                    purged = report.wal_files_purged,
                    corrupt = report.corrupt_entries,
                    "record log compacted"
                );
            } else {
                debug!(campaign = %campaign, "record log already compact");
            }
            Some(report)
        }
        Err(ProspectorError::CompactionLocked { owner, .. }) => {
            debug!(campaign = %campaign, %owner, "compaction skipped; lock held");
            None
        }
        Err(err) => {
            warn!(campaign = %campaign, error = %err, "compaction failed");
            None
        }
    }
}

fn spawn_advancer(
    ctx: CampaignContext,
    table: Arc<TransitionTable>,
    actions: Arc<dyn StageActions>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(campaign = %ctx.name(), "Workflow driver shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    advance_once(&ctx, &table, &actions).await;
                }
            }
        }
    })
}

/// Re-run the current stage of a campaign so waiting stages can move on once
/// their queues drain.
async fn advance_once(
    ctx: &CampaignContext,
    table: &Arc<TransitionTable>,
    actions: &Arc<dyn StageActions>,
) -> Option<CampaignState> {
    let mut workflow =
        match CampaignWorkflow::load(ctx.clone(), Arc::clone(table), Arc::clone(actions)).await {
            Ok(workflow) => workflow,
            Err(err) => {
                warn!(campaign = %ctx.name(), error = %err, "failed to load campaign");
                return None;
            }
        };

    let before = workflow.state();
    if before.is_terminal() {
        return Some(before);
    }
    match workflow.resume().await {
        Ok(after) => {
            if after != before {
                info!(campaign = %ctx.name(), from = %before, to = %after, "campaign advanced");
            }
            Some(after)
        }
        Err(err) => {
            warn!(campaign = %ctx.name(), error = %err, "campaign resume failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use prospector_config::StorageConfig;
    use prospector_core::records::{Record, RecordLogConfig};
    use prospector_core::storage::MemoryStore;
    use prospector_core::workflow::{CampaignDocument, CampaignStore, ProspectingParams};

    use super::*;

    fn ctx(store: Arc<dyn ObjectStore>) -> CampaignContext {
        CampaignContext::new("plumbers-tx", DataPaths::default(), store, "test-worker")
    }

    fn actions(store: Arc<dyn ObjectStore>) -> Arc<dyn StageActions> {
        Arc::new(ProspectingStages::new(
            Arc::new(prospector_core::geocode::StaticGeocoder::new()),
            CoverageIndex::new(store, DataPaths::default(), Default::default()),
            Default::default(),
            RecordLogConfig::default(),
        ))
    }

    #[tokio::test]
    async fn compact_once_merges_pending_records() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let log = RecordLog::new(ctx(store), RecordLogConfig::default());
        log.append(&Record::observed(Some("ChIJ-one".to_string()), Utc::now()).with_name("Roto"))
            .await
            .expect("append");

        let report = compact_once(&log).await.expect("compacted");
        assert_eq!(report.checkpoint_records, 1);
        assert!(log.pending_shards().await.expect("shards").is_empty());

        let again = compact_once(&log).await.expect("compacted");
        assert!(!again.checkpoint_rewritten);
    }

    #[tokio::test]
    async fn advance_once_leaves_idle_and_missing_campaigns_alone() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let table = Arc::new(TransitionTable::standard().expect("table"));
        let actions = actions(store.clone());

        // No campaign document yet: nothing is loaded or written.
        let state = advance_once(&ctx(store.clone()), &table, &actions).await;
        assert_eq!(state, None);
        assert!(store.list("").await.expect("list").is_empty());

        let document = CampaignDocument::new("plumbers-tx", &ProspectingParams::default())
            .expect("document");
        CampaignStore::new(ctx(store.clone()))
            .save(&document)
            .await
            .expect("save");
        let state = advance_once(&ctx(store), &table, &actions).await;
        assert_eq!(state, Some(CampaignState::Idle));
    }

    #[tokio::test]
    async fn shutdown_joins_every_task() {
        let store = StorageConfig::Memory.open().await.expect("store");
        let mut config = ProspectorConfig::default();
        config.worker.campaigns = vec!["plumbers-tx".to_string(), "roofers-ok".to_string()];
        config.worker.compaction_interval = Duration::from_millis(10);
        config.worker.advance_interval = Duration::from_millis(10);

        let mut daemon = Daemon::new(config, store);
        daemon.start().expect("start");
        // Reaper, compactor and workflow driver per campaign.
        assert_eq!(daemon.handles.len(), 6);

        tokio::time::sleep(Duration::from_millis(50)).await;
        daemon.shutdown().await;
        assert!(daemon.handles.is_empty());
        assert!(daemon.shutdown_token().is_cancelled());
    }
}
