//! # Prospector Core
//!
//! Storage-agnostic building blocks for a lead-prospecting pipeline that
//! scrapes map listings over geographic tiles, merges the results into a
//! per-campaign record log and fans follow-up work out to task queues.
//!
//! ## Overview
//!
//! - **Coverage index**: remembers which rectangles were scraped for which
//!   phrase so overlapping searches are skipped until their results go stale
//! - **Record log**: append-only write-ahead files per worker, folded into a
//!   single deduplicated checkpoint by a lock-guarded compactor
//! - **Task queue**: at-least-once delivery with leases, retries and a
//!   reaper for abandoned work
//! - **Campaign workflow**: a persisted state machine that plans scrapes,
//!   ingests results and queues enrichment
//!
//! Every component talks to an [`storage::ObjectStore`], so the same code
//! runs against a local directory, in memory or an S3 bucket.
//!
//! ## Feature Flags
//!
//! - `s3`: enables [`storage::S3Store`]
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use prospector_core::context::{CampaignContext, DataPaths};
//! use prospector_core::queue::{ObjectStoreQueue, QueueConfig, SCRAPE_QUEUE, TaskQueue};
//! use prospector_core::storage::LocalStore;
//!
//! # async fn run() -> prospector_core::Result<()> {
//! let store = Arc::new(LocalStore::new("/var/lib/prospector"));
//! let ctx = CampaignContext::new("roadside", DataPaths::default(), store, "worker-1");
//! let queue = ObjectStoreQueue::new(&ctx, SCRAPE_QUEUE, QueueConfig::default());
//! println!("{:?}", queue.stats().await?);
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]

pub mod context;
pub mod coverage;
pub mod error;
pub mod geocode;
pub mod planning;
pub mod queue;
pub mod records;
pub mod storage;
pub mod workflow;

pub use error::{ProspectorError, Result};
