use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use prospector_core::coverage::{CoverageConfig, GeoPoint};
use prospector_core::geocode::StaticGeocoder;
use prospector_core::queue::{DETAILS_QUEUE, ENRICHMENT_QUEUE, QueueConfig, SCRAPE_QUEUE};
use prospector_core::records::RecordLogConfig;
use prospector_core::storage::{LocalStore, MemoryStore, ObjectStore};
use serde::{Deserialize, Serialize};

/// Everything a Prospector process needs, as read from one file.
///
/// Every section has defaults, so an empty file is a valid configuration
/// that stores data under `./data`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProspectorConfig {
    /// Where queues, record logs, coverage and campaign configs live.
    pub storage: StorageConfig,
    /// Lease, retry and polling policy shared by every queue.
    pub queue: QueueConfig,
    /// Overlap threshold and freshness used when planning scrapes.
    pub coverage: CoverageConfig,
    /// Compaction lock policy.
    pub records: RecordLogConfig,
    /// Maintenance daemon schedule and scope.
    pub worker: WorkerDaemonConfig,
    /// Fixed coordinates for campaign locations.
    pub geocoding: GeocodingConfig,
}

impl ProspectorConfig {
    /// Worker identity: explicit config, else the host name, else the pid.
    pub fn worker_id(&self) -> String {
        self.worker
            .worker_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.trim().is_empty()))
            .unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }
}

/// Object store backend, selected by the `backend` key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Directory on a local or network filesystem.
    Local { root: PathBuf },
    /// S3-compatible bucket. Credentials come from the AWS environment.
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
    },
    /// Process-local; nothing survives a restart.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            root: PathBuf::from("data"),
        }
    }
}

impl StorageConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageConfig::Local { .. } => "local",
            StorageConfig::S3 { .. } => "s3",
            StorageConfig::Memory => "memory",
        }
    }

    /// Build the configured store.
    pub async fn open(&self) -> anyhow::Result<Arc<dyn ObjectStore>> {
        match self {
            StorageConfig::Local { root } => {
                std::fs::create_dir_all(root).with_context(|| {
                    format!("failed to create data directory {}", root.display())
                })?;
                Ok(Arc::new(LocalStore::new(root.clone())))
            }
            StorageConfig::Memory => Ok(Arc::new(MemoryStore::new())),
            #[cfg(feature = "s3")]
            StorageConfig::S3 { bucket, prefix } => Ok(Arc::new(
                prospector_core::storage::S3Store::from_env(bucket.clone(), prefix).await,
            )),
            #[cfg(not(feature = "s3"))]
            StorageConfig::S3 { bucket, .. } => Err(anyhow::anyhow!(
                "bucket {bucket} needs the s3 backend; rebuild with the `s3` feature"
            )),
        }
    }
}

/// Schedule and scope of the maintenance daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerDaemonConfig {
    /// Identity stamped on leases, WAL files and compaction locks.
    pub worker_id: Option<String>,
    /// Campaigns this daemon maintains.
    pub campaigns: Vec<String>,
    /// Queues reaped for every campaign.
    pub queues: Vec<String>,
    /// How often each campaign's record log is compacted.
    #[serde(with = "duration_str")]
    pub compaction_interval: Duration,
    /// How often each campaign's workflow is re-run to advance waiting
    /// stages. Zero disables workflow driving.
    #[serde(with = "duration_str")]
    pub advance_interval: Duration,
}

impl Default for WorkerDaemonConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            campaigns: Vec::new(),
            queues: vec![
                SCRAPE_QUEUE.to_string(),
                DETAILS_QUEUE.to_string(),
                ENRICHMENT_QUEUE.to_string(),
            ],
            compaction_interval: Duration::from_secs(5 * 60),
            advance_interval: Duration::from_secs(60),
        }
    }
}

/// Location names resolved without an external service.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GeocodingConfig {
    /// Location name to `"lat,lon"`.
    pub locations: BTreeMap<String, String>,
}

impl GeocodingConfig {
    pub fn static_geocoder(&self) -> anyhow::Result<StaticGeocoder> {
        let mut geocoder = StaticGeocoder::new();
        for (name, raw) in &self.locations {
            let point: GeoPoint = raw
                .parse()
                .with_context(|| format!("geocoding.locations.{name}"))?;
            geocoder.insert(name, point);
        }
        Ok(geocoder)
    }
}

/// Durations written as `"5m"`, `"90s"` or a bare number of seconds.
pub(crate) mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => humantime::parse_duration(text.trim()).map_err(de::Error::custom),
        }
    }
}
