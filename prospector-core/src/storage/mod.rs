//! Object storage abstraction shared by the coverage index, record log and
//! task queue.
//!
//! Every durable structure in this crate is a set of keyed objects. Keys are
//! `/`-separated relative paths; backends map them to files under a root
//! directory, to an in-process map, or to objects in an S3 bucket. The only
//! primitives the higher layers rely on for coordination are
//! [`ObjectStore::put_if_absent`], [`ObjectStore::claim`] and the
//! compare-then-write pair [`ObjectStore::replace_if_unchanged`] /
//! [`ObjectStore::delete_if_unchanged`].

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

mod local;
mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use local::LocalStore;
pub use memory::MemoryStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Object store request failed for {key}: {message}")]
    Backend { key: String, message: String },
}

impl StorageError {
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            key: key.into(),
            source,
        }
    }

    pub fn backend(key: impl Into<String>, message: impl fmt::Display) -> Self {
        StorageError::Backend {
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Whether the failure came from the medium rather than from the caller.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StorageError::InvalidKey(_))
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Listing entry returned by [`ObjectStore::list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Final path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Short backend identifier used in log lines.
    fn backend_name(&self) -> &'static str;

    /// Read an object. Missing objects are `Ok(None)`.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Write an object, replacing any previous body atomically.
    async fn put(&self, key: &str, body: Vec<u8>) -> StorageResult<()>;

    /// Create an object only when the key does not exist yet.
    ///
    /// Returns `false` when another writer got there first.
    async fn put_if_absent(&self, key: &str, body: Vec<u8>)
    -> StorageResult<bool>;

    /// List every object under `prefix`, recursively, sorted by key.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>>;

    /// Delete an object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Move `from` to `to`, writing `body` as the new content.
    ///
    /// Exactly one of several concurrent claimers of the same `from` observes
    /// `true`. The default implementation relies on [`put_if_absent`] for the
    /// destination and rolls back when the source has already been moved on.
    ///
    /// [`put_if_absent`]: ObjectStore::put_if_absent
    async fn claim(
        &self,
        from: &str,
        to: &str,
        body: Vec<u8>,
    ) -> StorageResult<bool> {
        if !self.put_if_absent(to, body).await? {
            return Ok(false);
        }
        if !self.exists(from).await? {
            self.delete(to).await?;
            return Ok(false);
        }
        self.delete(from).await?;
        Ok(true)
    }

    /// Replace `key` with `body` only while it still holds `expected`.
    ///
    /// Returns `false`, leaving the object alone, when it is missing or has
    /// changed. The default implementation compares then writes and is only
    /// as strong as the backend's read-after-write ordering.
    async fn replace_if_unchanged(
        &self,
        key: &str,
        expected: &[u8],
        body: Vec<u8>,
    ) -> StorageResult<bool> {
        match self.get(key).await? {
            Some(current) if current == expected => {
                self.put(key, body).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Delete `key` only while it still holds `expected`.
    async fn delete_if_unchanged(&self, key: &str, expected: &[u8]) -> StorageResult<bool> {
        match self.get(key).await? {
            Some(current) if current == expected => {
                self.delete(key).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Reject keys that could escape the store root or address nothing.
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    let bad_segment = key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if bad_segment || key.contains('\\') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Normalise a listing prefix so it always names a directory.
pub(crate) fn directory_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}
