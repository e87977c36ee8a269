//! Campaign record log: sharded write-ahead files plus a compacted
//! checkpoint.
//!
//! Writers never touch shared objects. Each append creates a new WAL file
//! under the shard of its record key; compaction folds WAL files into the
//! checkpoint and purges what it merged. Readers combine both without taking
//! the compaction lock.

mod compaction;
mod record;
pub mod usv;
mod wal;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use compaction::{CompactionLock, CompactionReport};
pub use record::{Record, RecordKey};
pub use wal::RecordSnapshot;

use crate::context::CampaignContext;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordLogConfig {
    /// A compaction lock older than this is considered abandoned (seconds).
    pub compaction_lock_ttl_secs: i64,
}

impl Default for RecordLogConfig {
    fn default() -> Self {
        Self {
            compaction_lock_ttl_secs: 600,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RecordLog {
    ctx: CampaignContext,
    config: RecordLogConfig,
}

impl RecordLog {
    pub fn new(ctx: CampaignContext, config: RecordLogConfig) -> Self {
        Self { ctx, config }
    }

    pub fn context(&self) -> &CampaignContext {
        &self.ctx
    }
}

/// A record with its encoded line, which breaks ties between entries that
/// rank equally on completeness and timestamp.
#[derive(Clone, Debug)]
pub(crate) struct MergedEntry {
    pub(crate) record: Record,
    pub(crate) line: String,
}

impl MergedEntry {
    fn new(record: Record) -> Self {
        let line = usv::encode(&record);
        Self { record, line }
    }

    fn rank(&self, other: &MergedEntry) -> Ordering {
        self.record
            .completeness_cmp(&other.record)
            .then_with(|| self.line.cmp(&other.line))
    }
}

/// Keyed best-entry map. Merging is order-independent: the result depends
/// only on the set of entries seen.
#[derive(Clone, Debug, Default)]
pub(crate) struct MergeSet {
    entries: BTreeMap<String, MergedEntry>,
}

impl MergeSet {
    pub(crate) fn insert(&mut self, record: Record) {
        let key = record.key().to_string();
        let candidate = MergedEntry::new(record);
        match self.entries.get(&key) {
            Some(existing) if existing.rank(&candidate) != Ordering::Less => {}
            _ => {
                self.entries.insert(key, candidate);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checkpoint body: one line per key, sorted by key.
    pub(crate) fn to_checkpoint(&self) -> String {
        let mut body = String::new();
        for entry in self.entries.values() {
            body.push_str(&entry.line);
            body.push('\n');
        }
        body
    }

    pub(crate) fn into_records(self) -> BTreeMap<String, Record> {
        self.entries
            .into_iter()
            .map(|(key, entry)| (key, entry.record))
            .collect()
    }
}
