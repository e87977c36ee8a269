use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::wal::fold_body;
use super::{MergeSet, RecordLog};
use crate::error::{ProspectorError, Result};

/// Advisory lock body stored at `compaction.lock`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionLock {
    pub token: Uuid,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A lock this process holds, with the exact bytes it last wrote.
#[derive(Debug)]
struct HeldLock {
    lock: CompactionLock,
    body: Vec<u8>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Entries in the checkpoint after this run.
    pub checkpoint_records: usize,
    pub wal_files_merged: usize,
    pub wal_entries_merged: usize,
    pub wal_files_purged: usize,
    pub corrupt_entries: usize,
    /// WAL files kept because they contained corrupt lines.
    pub retained_files: Vec<String>,
    /// False when the merged result matched the existing checkpoint byte
    /// for byte.
    pub checkpoint_rewritten: bool,
}

impl RecordLog {
    /// Fold every WAL file visible at start into the checkpoint, then purge
    /// the merged files.
    ///
    /// Re-running after a crash at any point converges on the same
    /// checkpoint. Files with corrupt lines are merged as far as they parse
    /// and are left in place for inspection.
    pub async fn compact(&self) -> Result<CompactionReport> {
        let mut held = self.acquire_lock(Utc::now()).await?;
        let result = self.compact_locked(&mut held).await;
        if let Err(err) = self.release_lock(&held).await {
            warn!(campaign = %self.ctx.name(), error = %err, "failed to release compaction lock");
        }
        result
    }

    async fn compact_locked(&self, held: &mut HeldLock) -> Result<CompactionReport> {
        let store = self.ctx.store();
        let checkpoint_key = self.ctx.paths().records_checkpoint();
        let wal_root = self.ctx.paths().records_wal();
        let snapshot = store.list(&wal_root).await?;

        let mut merged = MergeSet::default();
        let mut report = CompactionReport::default();

        let existing = store.get(&checkpoint_key).await?;
        if let Some(body) = &existing {
            let stats = fold_body(&mut merged, &checkpoint_key, body);
            if stats.corrupt > 0 {
                self.quarantine_checkpoint(body).await?;
                report.corrupt_entries += stats.corrupt;
            }
        }

        let mut purgeable = Vec::with_capacity(snapshot.len());
        let mut current_shard = None;
        for meta in &snapshot {
            let shard = wal_shard(&wal_root, &meta.key);
            if current_shard != Some(shard) {
                if current_shard.is_some() {
                    self.renew_lock(held, Utc::now()).await?;
                }
                current_shard = Some(shard);
            }
            let Some(body) = store.get(&meta.key).await? else {
                continue;
            };
            let stats = fold_body(&mut merged, &meta.key, &body);
            report.wal_files_merged += 1;
            report.wal_entries_merged += stats.entries;
            report.corrupt_entries += stats.corrupt;
            if stats.corrupt > 0 {
                report.retained_files.push(meta.key.clone());
            } else {
                purgeable.push(meta.key.clone());
            }
        }

        // Nothing is written unless the lock is still ours.
        self.renew_lock(held, Utc::now()).await?;
        let body = merged.to_checkpoint();
        report.checkpoint_records = merged.len();
        if existing.as_deref() != Some(body.as_bytes()) {
            store.put(&checkpoint_key, body.into_bytes()).await?;
            report.checkpoint_rewritten = true;
        }

        for key in &purgeable {
            store.delete(key).await?;
            report.wal_files_purged += 1;
        }

        info!(
            campaign = %self.ctx.name(),
            records = report.checkpoint_records,
            merged_files = report.wal_files_merged,
            purged_files = report.wal_files_purged,
            corrupt = report.corrupt_entries,
            rewritten = report.checkpoint_rewritten,
            "compacted record log"
        );
        Ok(report)
    }

    async fn quarantine_checkpoint(&self, body: &[u8]) -> Result<()> {
        let key = format!(
            "{}/quarantine/checkpoint-{}.usv",
            self.ctx.paths().base(),
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ")
        );
        warn!(key = %key, "checkpoint has corrupt lines; keeping a copy");
        self.ctx.store().put(&key, body.to_vec()).await?;
        Ok(())
    }

    async fn acquire_lock(&self, now: DateTime<Utc>) -> Result<HeldLock> {
        let store = self.ctx.store();
        let key = self.ctx.paths().compaction_lock();
        let lock = CompactionLock {
            token: Uuid::now_v7(),
            owner: self.ctx.worker_id().to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(self.config.compaction_lock_ttl_secs),
        };
        let body = serde_json::to_vec(&lock)?;

        if store.put_if_absent(&key, body.clone()).await? {
            return Ok(HeldLock { lock, body });
        }

        let held_bytes = store.get(&key).await?;
        let held = held_bytes
            .as_deref()
            .and_then(|bytes| serde_json::from_slice::<CompactionLock>(bytes).ok());
        match held {
            Some(held) if held.expires_at > now => {
                Err(ProspectorError::CompactionLocked {
                    campaign: self.ctx.name().to_string(),
                    owner: held.owner,
                })
            }
            stale => {
                match (&stale, &held_bytes) {
                    (Some(stale), Some(bytes)) => {
                        warn!(
                            campaign = %self.ctx.name(),
                            owner = %stale.owner,
                            expired_at = %stale.expires_at,
                            "taking over abandoned compaction lock"
                        );
                        store.delete_if_unchanged(&key, bytes).await?;
                    }
                    (None, Some(bytes)) => {
                        warn!(campaign = %self.ctx.name(), "removing unreadable compaction lock");
                        store.delete_if_unchanged(&key, bytes).await?;
                    }
                    // Released between our attempt and the read.
                    (_, None) => {}
                }
                if store.put_if_absent(&key, body.clone()).await? {
                    Ok(HeldLock { lock, body })
                } else {
                    Err(ProspectorError::CompactionLocked {
                        campaign: self.ctx.name().to_string(),
                        owner: "unknown".to_string(),
                    })
                }
            }
        }
    }

    /// Push the lock's expiry a full TTL past `now`. Fails with
    /// `CompactionLocked` when another compactor has taken the lock over.
    async fn renew_lock(&self, held: &mut HeldLock, now: DateTime<Utc>) -> Result<()> {
        let key = self.ctx.paths().compaction_lock();
        let mut lock = held.lock.clone();
        lock.expires_at = now + Duration::seconds(self.config.compaction_lock_ttl_secs);
        let body = serde_json::to_vec(&lock)?;
        if !self
            .ctx
            .store()
            .replace_if_unchanged(&key, &held.body, body.clone())
            .await?
        {
            warn!(campaign = %self.ctx.name(), "compaction lock lost mid-run");
            let owner = self
                .ctx
                .store()
                .get(&key)
                .await?
                .and_then(|bytes| serde_json::from_slice::<CompactionLock>(&bytes).ok())
                .map_or_else(|| "unknown".to_string(), |current| current.owner);
            return Err(ProspectorError::CompactionLocked {
                campaign: self.ctx.name().to_string(),
                owner,
            });
        }
        held.lock = lock;
        held.body = body;
        Ok(())
    }

    async fn release_lock(&self, held: &HeldLock) -> Result<()> {
        self.ctx
            .store()
            .delete_if_unchanged(&self.ctx.paths().compaction_lock(), &held.body)
            .await?;
        Ok(())
    }
}

/// First path segment under the WAL root.
fn wal_shard<'a>(wal_root: &str, key: &'a str) -> &'a str {
    key.strip_prefix(wal_root)
        .map(|rest| rest.trim_start_matches('/'))
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::{CampaignContext, DataPaths};
    use crate::records::{Record, RecordLogConfig};
    use crate::storage::{MemoryStore, ObjectStore};

    fn log_over(store: Arc<dyn ObjectStore>, worker: &str) -> RecordLog {
        let ctx = CampaignContext::new("roadside", DataPaths::default(), store, worker);
        RecordLog::new(ctx, RecordLogConfig::default())
    }

    #[test]
    fn shard_is_the_first_segment_below_the_wal_root() {
        let root = "data/campaigns/roadside/indexes/records/wal";
        assert_eq!(wal_shard(root, &format!("{root}/b/0001.usv")), "b");
        assert_eq!(wal_shard(root, &format!("{root}/_/x.usv")), "_");
    }

    #[tokio::test]
    async fn renewal_pushes_expiry_and_keeps_the_token() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let log = log_over(store.clone(), "worker-a");
        let start = Utc::now();
        let mut held = log.acquire_lock(start).await.expect("lock");
        let token = held.lock.token;

        let later = start + Duration::minutes(9);
        log.renew_lock(&mut held, later).await.expect("renew");
        assert_eq!(held.lock.token, token);
        assert!(held.lock.expires_at > start + Duration::minutes(10));

        let stored: CompactionLock = serde_json::from_slice(
            &store
                .get(&log.context().paths().compaction_lock())
                .await
                .expect("get")
                .expect("lock body"),
        )
        .expect("json");
        assert_eq!(stored, held.lock);

        log.release_lock(&held).await.expect("release");
        assert!(!store
            .exists(&log.context().paths().compaction_lock())
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn compaction_stops_once_its_lock_is_taken_over() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let log = log_over(store.clone(), "worker-a");
        let now = Utc::now();
        log.append(&Record::observed(Some("ChIJ-one".into()), now).with_name("Lone Star Towing"))
            .await
            .expect("append");
        let mut held = log.acquire_lock(now).await.expect("lock");

        let usurper = log_over(store.clone(), "worker-b");
        let expired = now + Duration::seconds(RecordLogConfig::default().compaction_lock_ttl_secs + 1);
        let theirs = usurper.acquire_lock(expired).await.expect("take over");

        match log.compact_locked(&mut held).await {
            Err(ProspectorError::CompactionLocked { owner, .. }) => assert_eq!(owner, "worker-b"),
            other => panic!("expected CompactionLocked, got {other:?}"),
        }
        assert!(!store
            .exists(&log.context().paths().records_checkpoint())
            .await
            .expect("exists"));

        // Releasing the lost lock leaves the new holder's lock alone.
        log.release_lock(&held).await.expect("release");
        let stored: CompactionLock = serde_json::from_slice(
            &store
                .get(&log.context().paths().compaction_lock())
                .await
                .expect("get")
                .expect("lock body"),
        )
        .expect("json");
        assert_eq!(stored.token, theirs.lock.token);
    }
}
