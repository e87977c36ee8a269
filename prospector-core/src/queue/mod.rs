//! At-least-once task queue over an object store.
//!
//! Delivery is at-least-once: a task whose lease expires is redelivered, so
//! handlers must be idempotent. Duplicate pushes coalesce on the task's
//! dedupe key.

pub mod config;
mod lease;
mod reaper;
mod retry;
mod service;
mod task;
mod worker;

pub use config::{LeaseConfig, QueueConfig, RetryConfig, WorkerConfig};
pub use lease::{Lease, LeaseId, TaskLease};
pub use reaper::spawn_lease_reaper;
pub use retry::retry_with_backoff;
pub use service::{
    LeaseExpiryScanner, ObjectStoreQueue, QueueStats, ReapReport, TaskQueue,
};
pub use task::{
    DETAILS_QUEUE, DedupeKey, DetailsTask, ENRICHMENT_QUEUE, EnrichmentTask,
    PushOutcome, QueuedTask, RetryDisposition, SCRAPE_QUEUE, ScrapeTask,
    TaskPayload,
};
pub use worker::{HandlerOutcome, QueueWorker, TaskHandler, WorkerReport};
