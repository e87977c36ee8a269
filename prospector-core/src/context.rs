//! Key layout and the per-campaign handle threaded through every operation.

use std::fmt;
use std::sync::Arc;

use crate::storage::ObjectStore;

/// Lowercase ASCII slug: alphanumerics kept, every other run collapsed to `-`.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// Root of the key space inside an [`ObjectStore`].
///
/// ```text
/// {root}/scraped_areas/{phrase}/lat{N}_lon{M}/{file}.json
/// {root}/campaigns/{campaign}/config.toml
/// {root}/campaigns/{campaign}/indexes/records/wal/{shard}/{file}.usv
/// {root}/campaigns/{campaign}/indexes/records/checkpoint.usv
/// {root}/campaigns/{campaign}/queues/{queue}/{pending|processing|completed|failed}/{dedup}.json
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataPaths {
    root: String,
}

impl DataPaths {
    pub fn new(root: impl Into<String>) -> Self {
        let root: String = root.into();
        Self {
            root: root.trim_matches('/').to_string(),
        }
    }

    fn join(&self, relative: &str) -> String {
        if self.root.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{relative}", self.root)
        }
    }

    /// Shared coverage index; not scoped to a campaign.
    pub fn scraped_areas(&self) -> String {
        self.join("scraped_areas")
    }

    pub fn campaign(&self, campaign: &str) -> CampaignPaths {
        CampaignPaths {
            base: self.join(&format!("campaigns/{}", slugify(campaign))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CampaignPaths {
    base: String,
}

impl CampaignPaths {
    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn config(&self) -> String {
        format!("{}/config.toml", self.base)
    }

    fn records(&self) -> String {
        format!("{}/indexes/records", self.base)
    }

    pub fn records_wal(&self) -> String {
        format!("{}/wal", self.records())
    }

    pub fn records_wal_shard(&self, shard: char) -> String {
        format!("{}/{shard}", self.records_wal())
    }

    pub fn records_checkpoint(&self) -> String {
        format!("{}/checkpoint.usv", self.records())
    }

    pub fn compaction_lock(&self) -> String {
        format!("{}/compaction.lock", self.records())
    }

    pub fn queue(&self, name: &str) -> QueuePaths {
        QueuePaths {
            base: format!("{}/queues/{}", self.base, slugify(name)),
        }
    }
}

/// Lifecycle directory of a queue entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueState {
    pub const ALL: [QueueState; 4] = [
        QueueState::Pending,
        QueueState::Processing,
        QueueState::Completed,
        QueueState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueState::Pending => "pending",
            QueueState::Processing => "processing",
            QueueState::Completed => "completed",
            QueueState::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuePaths {
    base: String,
}

impl QueuePaths {
    pub fn dir(&self, state: QueueState) -> String {
        format!("{}/{}", self.base, state)
    }

    pub fn entry(&self, state: QueueState, dedup_key: &str) -> String {
        format!("{}/{dedup_key}.json", self.dir(state))
    }
}

/// Handle for one campaign: its name, key layout, backing store and the
/// identity of the worker acting on it.
///
/// Constructed once at startup and passed by reference; nothing in the crate
/// reads campaign identity from globals.
#[derive(Clone)]
pub struct CampaignContext {
    name: String,
    paths: CampaignPaths,
    data_paths: DataPaths,
    store: Arc<dyn ObjectStore>,
    worker_id: String,
}

impl fmt::Debug for CampaignContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CampaignContext")
            .field("name", &self.name)
            .field("base", &self.paths.base())
            .field("backend", &self.store.backend_name())
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl CampaignContext {
    pub fn new(
        name: &str,
        data_paths: DataPaths,
        store: Arc<dyn ObjectStore>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            name: slugify(name),
            paths: data_paths.campaign(name),
            data_paths,
            store,
            worker_id: worker_id.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn paths(&self) -> &CampaignPaths {
        &self.paths
    }

    pub fn data_paths(&self) -> &DataPaths {
        &self.data_paths
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Roadside Assistance"), "roadside-assistance");
        assert_eq!(slugify("  Tow -- Trucks!! "), "tow-trucks");
        assert_eq!(slugify("_wilderness"), "wilderness");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn campaign_keys_nest_under_root() {
        let paths = DataPaths::new("/data/");
        let campaign = paths.campaign("Spring Push");
        assert_eq!(campaign.config(), "data/campaigns/spring-push/config.toml");
        assert_eq!(
            campaign.records_wal_shard('a'),
            "data/campaigns/spring-push/indexes/records/wal/a"
        );
        assert_eq!(
            campaign.queue("gm-list").entry(QueueState::Failed, "abc"),
            "data/campaigns/spring-push/queues/gm-list/failed/abc.json"
        );
        assert_eq!(DataPaths::default().scraped_areas(), "scraped_areas");
    }
}
