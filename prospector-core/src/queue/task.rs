use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::lease::Lease;
use crate::context::slugify;

/// Queue names used by the prospecting pipeline.
pub const SCRAPE_QUEUE: &str = "gm-list";
pub const DETAILS_QUEUE: &str = "gm-details";
pub const ENRICHMENT_QUEUE: &str = "enrichment";

/// Structured payload per task kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "task", rename_all = "snake_case")]
pub enum TaskPayload {
    Scrape(ScrapeTask),
    Details(DetailsTask),
    Enrichment(EnrichmentTask),
}

/// Search one map tile for one phrase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScrapeTask {
    pub campaign: String,
    pub phrase: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub tile_id: Option<String>,
    #[serde(default)]
    pub radius_miles: Option<f64>,
    #[serde(default)]
    pub ttl_days: Option<u32>,
    #[serde(default)]
    pub force_refresh: bool,
}

/// Fetch the detail page of one listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetailsTask {
    pub campaign: String,
    pub place_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Crawl one company website.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentTask {
    pub campaign: String,
    pub domain: String,
    pub company_slug: String,
    #[serde(default)]
    pub force_refresh: bool,
}

impl TaskPayload {
    pub fn campaign(&self) -> &str {
        match self {
            TaskPayload::Scrape(task) => &task.campaign,
            TaskPayload::Details(task) => &task.campaign,
            TaskPayload::Enrichment(task) => &task.campaign,
        }
    }

    /// Queue this payload belongs on by default.
    pub fn default_queue(&self) -> &'static str {
        match self {
            TaskPayload::Scrape(_) => SCRAPE_QUEUE,
            TaskPayload::Details(_) => DETAILS_QUEUE,
            TaskPayload::Enrichment(_) => ENRICHMENT_QUEUE,
        }
    }

    /// Identity used to coalesce duplicates across all queue states.
    pub fn dedupe_key(&self) -> DedupeKey {
        match self {
            TaskPayload::Scrape(task) => DedupeKey::Scrape {
                phrase: slugify(&task.phrase),
                location: task.tile_id.clone().unwrap_or_else(|| {
                    format!("{:.4},{:.4}", task.latitude, task.longitude)
                }),
            },
            TaskPayload::Details(task) => DedupeKey::Details {
                place_id: task.place_id.trim().to_string(),
            },
            TaskPayload::Enrichment(task) => DedupeKey::Enrichment {
                domain: task.domain.trim().to_lowercase(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DedupeKey {
    Scrape { phrase: String, location: String },
    Details { place_id: String },
    Enrichment { domain: String },
}

impl DedupeKey {
    /// Filesystem-safe digest used as the queue entry name.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupeKey::Scrape { phrase, location } => {
                write!(f, "scrape:{}:{}", phrase, location)
            }
            DedupeKey::Details { place_id } => write!(f, "details:{}", place_id),
            DedupeKey::Enrichment { domain } => {
                write!(f, "enrichment:{}", domain)
            }
        }
    }
}

/// Envelope stored for each queue entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub dedup_key: String,
    /// Human-readable form of the dedupe key.
    pub identity: String,
    pub payload: TaskPayload,
    pub attempts: u16,
    #[serde(default)]
    pub lease: Option<Lease>,
    pub available_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedTask {
    pub fn new(payload: TaskPayload, now: DateTime<Utc>) -> Self {
        let identity = payload.dedupe_key();
        Self {
            dedup_key: identity.digest(),
            identity: identity.to_string(),
            payload,
            attempts: 0,
            lease: None,
            available_at: now,
            enqueued_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.available_at <= now
    }
}

/// Result of [`TaskQueue::push`](super::TaskQueue::push).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued { dedup_key: String },
    /// An entry with the same key already exists, failed entries included.
    Duplicate { dedup_key: String },
}

impl PushOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, PushOutcome::Enqueued { .. })
    }

    pub fn dedup_key(&self) -> &str {
        match self {
            PushOutcome::Enqueued { dedup_key }
            | PushOutcome::Duplicate { dedup_key } => dedup_key,
        }
    }
}

/// Where a nacked or expired task went.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDisposition {
    Requeued {
        attempts: u16,
        available_at: DateTime<Utc>,
    },
    Failed {
        attempts: u16,
    },
}
