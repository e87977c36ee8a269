use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{MergeSet, Record, RecordLog, usv};
use crate::context::slugify;
use crate::error::{ProspectorError, Result};

/// Merged view of the checkpoint and every WAL file visible at read time.
#[derive(Clone, Debug, Default)]
pub struct RecordSnapshot {
    pub records: BTreeMap<String, Record>,
    pub checkpoint_entries: usize,
    pub wal_files: usize,
    pub wal_entries: usize,
    pub corrupt_entries: usize,
}

impl RecordSnapshot {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }
}

/// Result of folding a set of USV bodies into a [`MergeSet`].
#[derive(Debug, Default)]
pub(crate) struct FoldStats {
    pub(crate) entries: usize,
    pub(crate) corrupt: usize,
}

pub(crate) fn fold_body(
    merged: &mut MergeSet,
    key: &str,
    body: &[u8],
) -> FoldStats {
    let text = String::from_utf8_lossy(body);
    let (records, corrupt) = usv::decode_lines(&text);
    for (line, err) in &corrupt {
        warn!(key = %key, line, error = %err, "skipping corrupt record line");
    }
    let stats = FoldStats {
        entries: records.len(),
        corrupt: corrupt.len(),
    };
    for record in records {
        merged.insert(record);
    }
    stats
}

impl RecordLog {
    fn wal_file_key(&self, shard: char) -> String {
        let worker = match slugify(self.ctx.worker_id()) {
            slug if slug.is_empty() => "worker".to_string(),
            slug => slug,
        };
        format!(
            "{}/{}_{}_{}.usv",
            self.ctx.paths().records_wal_shard(shard),
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ"),
            worker,
            Uuid::now_v7().simple()
        )
    }

    /// Append one record as its own WAL file. Returns the key written.
    pub async fn append(&self, record: &Record) -> Result<String> {
        let shard = record.key().shard();
        let key = self.wal_file_key(shard);
        let mut body = usv::encode(record);
        body.push('\n');
        self.ctx.store().put(&key, body.into_bytes()).await?;
        debug!(key = %key, record = %record.key(), "appended record");
        Ok(key)
    }

    /// Append records grouped into one WAL file per shard.
    pub async fn append_batch(&self, records: &[Record]) -> Result<Vec<String>> {
        let mut by_shard: BTreeMap<char, String> = BTreeMap::new();
        for record in records {
            let body = by_shard.entry(record.key().shard()).or_default();
            body.push_str(&usv::encode(record));
            body.push('\n');
        }

        let mut written = Vec::with_capacity(by_shard.len());
        for (shard, body) in by_shard {
            let key = self.wal_file_key(shard);
            self.ctx.store().put(&key, body.into_bytes()).await?;
            written.push(key);
        }
        debug!(
            campaign = %self.ctx.name(),
            records = records.len(),
            files = written.len(),
            "appended record batch"
        );
        Ok(written)
    }

    /// Current merged view. Does not wait for or block compaction.
    pub async fn read_all(&self) -> Result<RecordSnapshot> {
        let store = self.ctx.store();
        let wal_prefix = self.ctx.paths().records_wal();
        let checkpoint_key = self.ctx.paths().records_checkpoint();

        // List first: a WAL file that disappears afterwards has been folded
        // into a checkpoint written before the deletion.
        let wal = store.list(&wal_prefix).await?;

        let mut merged = MergeSet::default();
        let mut snapshot = RecordSnapshot::default();

        if let Some(body) = store.get(&checkpoint_key).await? {
            let stats = fold_body(&mut merged, &checkpoint_key, &body);
            snapshot.checkpoint_entries = stats.entries;
            snapshot.corrupt_entries += stats.corrupt;
        }

        let mut vanished = false;
        for meta in &wal {
            match store.get(&meta.key).await? {
                Some(body) => {
                    let stats = fold_body(&mut merged, &meta.key, &body);
                    snapshot.wal_files += 1;
                    snapshot.wal_entries += stats.entries;
                    snapshot.corrupt_entries += stats.corrupt;
                }
                None => vanished = true,
            }
        }

        if vanished {
            debug!(campaign = %self.ctx.name(), "WAL compacted during read; re-reading checkpoint");
            if let Some(body) = store.get(&checkpoint_key).await? {
                let stats = fold_body(&mut merged, &checkpoint_key, &body);
                snapshot.checkpoint_entries = stats.entries;
            }
        }

        snapshot.records = merged.into_records();
        Ok(snapshot)
    }

    /// Latest merged entry for one key.
    pub async fn get(&self, key: &str) -> Result<Option<Record>> {
        let mut snapshot = self.read_all().await?;
        Ok(snapshot.records.remove(key))
    }

    /// Distinct shards currently holding WAL files.
    pub async fn pending_shards(&self) -> Result<BTreeSet<String>> {
        let prefix = self.ctx.paths().records_wal();
        let strip = format!("{prefix}/");
        let mut shards = BTreeSet::new();
        for meta in self.ctx.store().list(&prefix).await? {
            let shard = meta
                .key
                .strip_prefix(&strip)
                .and_then(|rest| rest.split('/').next())
                .ok_or_else(|| {
                    ProspectorError::Internal(format!(
                        "WAL key outside prefix: {}",
                        meta.key
                    ))
                })?;
            shards.insert(shard.to_string());
        }
        Ok(shards)
    }
}
