use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ObjectMeta, ObjectStore, StorageError, StorageResult, directory_prefix,
    validate_key,
};

/// Filesystem backend rooted at a data directory.
///
/// Writes go through a dot-prefixed temporary file in the destination
/// directory followed by a rename, so readers never observe a partial body.
/// `put_if_absent` and `claim` use hard links, which fail when the
/// destination exists. Conditional replace and delete first rename the
/// object to a hidden sibling, compare it there, and link it back when it
/// changed. Dot-prefixed names are never listed.
#[derive(Clone, Debug)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    async fn ensure_parent(&self, key: &str, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(key, err))?;
        }
        Ok(())
    }

    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{name}.{}.tmp", Uuid::now_v7().simple()))
    }

    async fn write_temp(
        &self,
        key: &str,
        path: &Path,
        body: &[u8],
    ) -> StorageResult<PathBuf> {
        self.ensure_parent(key, path).await?;
        let temp = Self::temp_path(path);
        tokio::fs::write(&temp, body)
            .await
            .map_err(|err| StorageError::io(key, err))?;
        Ok(temp)
    }

    async fn discard_temp(temp: &Path) {
        if let Err(err) = tokio::fs::remove_file(temp).await
            && err.kind() != ErrorKind::NotFound
        {
            warn!(path = %temp.display(), error = %err, "failed to remove temp file");
        }
    }

    /// Rename `path` to a hidden sibling so no other writer can touch the
    /// body while it is compared. `None` when the object is missing.
    async fn set_aside(&self, key: &str, path: &Path) -> StorageResult<Option<PathBuf>> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let aside = path.with_file_name(format!(".{name}.{}.aside", Uuid::now_v7().simple()));
        match tokio::fs::rename(path, &aside).await {
            Ok(()) => Ok(Some(aside)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }

    /// Put a set-aside body back unless a newer object took its place.
    async fn restore(&self, key: &str, path: &Path, aside: &Path) -> StorageResult<()> {
        let linked = tokio::fs::hard_link(aside, path).await;
        Self::discard_temp(aside).await;
        match linked {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }

    /// Take `path` aside and keep it there only if it holds `expected`.
    async fn take_if_unchanged(
        &self,
        key: &str,
        path: &Path,
        expected: &[u8],
    ) -> StorageResult<Option<PathBuf>> {
        // Compare in place first so a mismatch never moves the object.
        match tokio::fs::read(path).await {
            Ok(current) if current == expected => {}
            Ok(_) => return Ok(None),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::io(key, err)),
        }
        let Some(aside) = self.set_aside(key, path).await? else {
            return Ok(None);
        };
        let current = match tokio::fs::read(&aside).await {
            Ok(current) => current,
            Err(err) => {
                self.restore(key, path, &aside).await?;
                return Err(StorageError::io(key, err));
            }
        };
        if current != expected {
            self.restore(key, path, &aside).await?;
            return Ok(None);
        }
        Ok(Some(aside))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> StorageResult<()> {
        let path = self.path_for(key)?;
        let temp = self.write_temp(key, &path, &body).await?;
        if let Err(err) = tokio::fs::rename(&temp, &path).await {
            Self::discard_temp(&temp).await;
            return Err(StorageError::io(key, err));
        }
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        body: Vec<u8>,
    ) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        let temp = self.write_temp(key, &path, &body).await?;
        let linked = tokio::fs::hard_link(&temp, &path).await;
        Self::discard_temp(&temp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        let prefix = directory_prefix(prefix);
        let start = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.root.join(prefix.trim_end_matches('/'))
        };

        let mut entries = Vec::new();
        let mut pending = vec![start];
        while let Some(dir) = pending.pop() {
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(StorageError::io(
                        dir.to_string_lossy().into_owned(),
                        err,
                    ));
                }
            };

            loop {
                let entry = match reader.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        return Err(StorageError::io(
                            dir.to_string_lossy().into_owned(),
                            err,
                        ));
                    }
                };
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    // Raced with a rename or delete.
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => {
                        return Err(StorageError::io(
                            path.to_string_lossy().into_owned(),
                            err,
                        ));
                    }
                };
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Some(key) = self.key_for(&path) else {
                    debug!(path = %path.display(), "skipping path outside store root");
                    continue;
                };
                let last_modified =
                    metadata.modified().ok().map(DateTime::<Utc>::from);
                entries.push(ObjectMeta { key, last_modified });
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|err| StorageError::io(key, err))
    }

    async fn claim(
        &self,
        from: &str,
        to: &str,
        body: Vec<u8>,
    ) -> StorageResult<bool> {
        let source = self.path_for(from)?;
        let dest = self.path_for(to)?;

        let temp = self.write_temp(to, &dest, &body).await?;
        let linked = tokio::fs::hard_link(&temp, &dest).await;
        Self::discard_temp(&temp).await;
        match linked {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Ok(false);
            }
            Err(err) => return Err(StorageError::io(to, err)),
        }

        // Only one unlink of the source can succeed; the loser backs out.
        match tokio::fs::remove_file(&source).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.delete(to).await?;
                Ok(false)
            }
            Err(err) => {
                self.delete(to).await?;
                Err(StorageError::io(from, err))
            }
        }
    }

    async fn replace_if_unchanged(
        &self,
        key: &str,
        expected: &[u8],
        body: Vec<u8>,
    ) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        let Some(aside) = self.take_if_unchanged(key, &path, expected).await? else {
            return Ok(false);
        };
        let temp = match self.write_temp(key, &path, &body).await {
            Ok(temp) => temp,
            Err(err) => {
                self.restore(key, &path, &aside).await?;
                return Err(err);
            }
        };
        let linked = tokio::fs::hard_link(&temp, &path).await;
        Self::discard_temp(&temp).await;
        Self::discard_temp(&aside).await;
        match linked {
            Ok(()) => Ok(true),
            // Recreated by someone else while set aside; theirs is newer.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(StorageError::io(key, err)),
        }
    }

    async fn delete_if_unchanged(&self, key: &str, expected: &[u8]) -> StorageResult<bool> {
        let path = self.path_for(key)?;
        match self.take_if_unchanged(key, &path, expected).await? {
            Some(aside) => {
                Self::discard_temp(&aside).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn temp_files_are_hidden_from_listings() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put("wal/a/one.usv", b"x".to_vec()).await.unwrap();
        tokio::fs::write(dir.path().join("wal/a/.one.usv.123.tmp"), b"partial")
            .await
            .unwrap();

        let keys: Vec<String> = store
            .list("wal")
            .await
            .unwrap()
            .into_iter()
            .map(|meta| meta.key)
            .collect();
        assert_eq!(keys, vec!["wal/a/one.usv".to_string()]);
    }

    #[tokio::test]
    async fn claim_loses_when_source_already_moved() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put("pending/t", b"v1".to_vec()).await.unwrap();

        assert!(
            store
                .claim("pending/t", "processing/t", b"v2".to_vec())
                .await
                .unwrap()
        );
        store.delete("processing/t").await.unwrap();

        assert!(
            !store
                .claim("pending/t", "processing/t", b"v3".to_vec())
                .await
                .unwrap()
        );
        assert!(!store.exists("processing/t").await.unwrap());
    }

    #[tokio::test]
    async fn conditional_writes_leave_no_aside_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put("processing/t", b"v1".to_vec()).await.unwrap();

        assert!(
            !store
                .replace_if_unchanged("processing/t", b"v0", b"v2".to_vec())
                .await
                .unwrap()
        );
        assert!(!store.delete_if_unchanged("processing/t", b"v0").await.unwrap());
        assert!(
            store
                .replace_if_unchanged("processing/t", b"v1", b"v2".to_vec())
                .await
                .unwrap()
        );
        assert_eq!(store.get("processing/t").await.unwrap(), Some(b"v2".to_vec()));

        let names: Vec<String> = std::fs::read_dir(dir.path().join("processing"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["t".to_string()]);
    }
}
