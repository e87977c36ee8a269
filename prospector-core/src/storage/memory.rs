use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    ObjectMeta, ObjectStore, StorageResult, directory_prefix, validate_key,
};

/// In-process backend used by tests and single-process dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        validate_key(key)?;
        let objects = self.objects.read().await;
        Ok(objects.get(key).map(|(body, _)| body.clone()))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> StorageResult<()> {
        validate_key(key)?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), (body, Utc::now()));
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        body: Vec<u8>,
    ) -> StorageResult<bool> {
        validate_key(key)?;
        let mut objects = self.objects.write().await;
        if objects.contains_key(key) {
            return Ok(false);
        }
        objects.insert(key.to_string(), (body, Utc::now()));
        Ok(true)
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        let prefix = directory_prefix(prefix);
        let objects = self.objects.read().await;
        Ok(objects
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, (_, modified))| ObjectMeta {
                key: key.clone(),
                last_modified: Some(*modified),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.objects.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        validate_key(key)?;
        Ok(self.objects.read().await.contains_key(key))
    }

    async fn claim(
        &self,
        from: &str,
        to: &str,
        body: Vec<u8>,
    ) -> StorageResult<bool> {
        validate_key(from)?;
        validate_key(to)?;
        let mut objects = self.objects.write().await;
        if !objects.contains_key(from) || objects.contains_key(to) {
            return Ok(false);
        }
        objects.remove(from);
        objects.insert(to.to_string(), (body, Utc::now()));
        Ok(true)
    }

    async fn replace_if_unchanged(
        &self,
        key: &str,
        expected: &[u8],
        body: Vec<u8>,
    ) -> StorageResult<bool> {
        validate_key(key)?;
        let mut objects = self.objects.write().await;
        match objects.get_mut(key) {
            Some(entry) if entry.0 == expected => {
                *entry = (body, Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_unchanged(&self, key: &str, expected: &[u8]) -> StorageResult<bool> {
        validate_key(key)?;
        let mut objects = self.objects.write().await;
        if objects.get(key).is_some_and(|(body, _)| body == expected) {
            objects.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
