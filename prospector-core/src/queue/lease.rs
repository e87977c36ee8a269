use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::{QueuedTask, TaskPayload};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

/// Lease metadata embedded in a processing entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewals: u32,
}

impl Lease {
    pub fn new(owner: String, ttl: chrono::Duration, now: DateTime<Utc>) -> Self {
        Self {
            lease_id: LeaseId::new(),
            owner,
            acquired_at: now,
            expires_at: now + ttl,
            renewals: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A claimed task, returned by poll and handed back on ack/nack/renew.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskLease {
    pub lease: Lease,
    pub task: QueuedTask,
}

impl TaskLease {
    pub fn dedup_key(&self) -> &str {
        &self.task.dedup_key
    }

    pub fn payload(&self) -> &TaskPayload {
        &self.task.payload
    }

    /// Failed deliveries before this one.
    pub fn attempts(&self) -> u16 {
        self.task.attempts
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.lease.expires_at
    }
}
