use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    ObjectMeta, ObjectStore, StorageError, StorageResult, directory_prefix,
    validate_key,
};

/// S3-compatible backend. Keys are stored under an optional bucket prefix.
///
/// Conditional creation uses `If-None-Match: *`, which S3 rejects with 412
/// when the object already exists.
#[derive(Clone, Debug)]
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    pub fn new(client: Client, bucket: impl Into<String>, prefix: &str) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: directory_prefix(prefix),
        }
    }

    /// Build a client from the ambient AWS environment (profile, env vars,
    /// instance metadata).
    pub async fn from_env(bucket: impl Into<String>, prefix: &str) -> Self {
        let config =
            aws_config::load_defaults(aws_config::BehaviorVersion::latest())
                .await;
        Self::new(Client::new(&config), bucket, prefix)
    }

    fn object_key(&self, key: &str) -> StorageResult<String> {
        validate_key(key)?;
        Ok(format!("{}{key}", self.prefix))
    }

    fn store_key<'a>(&self, object_key: &'a str) -> Option<&'a str> {
        object_key.strip_prefix(self.prefix.as_str())
    }

    /// Body and ETag of an object, for `If-Match` writes.
    async fn get_tagged(&self, key: &str) -> StorageResult<Option<(Vec<u8>, String)>> {
        let object_key = self.object_key(key)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await;
        match response {
            Ok(output) => {
                let etag = output.e_tag().unwrap_or_default().to_string();
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|err| StorageError::backend(key, err))?;
                Ok(Some((data.into_bytes().to_vec(), etag)))
            }
            Err(err) => {
                if let Some(service) = err.as_service_error()
                    && service.is_no_such_key()
                {
                    return Ok(None);
                }
                Err(StorageError::backend(key, err))
            }
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.get_tagged(key).await?.map(|(body, _)| body))
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> StorageResult<()> {
        let object_key = self.object_key(key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| StorageError::backend(key, err))?;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        body: Vec<u8>,
    ) -> StorageResult<bool> {
        let object_key = self.object_key(key)?;
        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .if_none_match("*")
            .body(ByteStream::from(body))
            .send()
            .await;

        match response {
            Ok(_) => Ok(true),
            Err(err) => {
                let status =
                    err.raw_response().map(|raw| raw.status().as_u16());
                if matches!(status, Some(409) | Some(412)) {
                    debug!(key, "conditional put lost to an existing object");
                    return Ok(false);
                }
                Err(StorageError::backend(key, err))
            }
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<ObjectMeta>> {
        let list_prefix = format!("{}{}", self.prefix, directory_prefix(prefix));
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|err| StorageError::backend(prefix, err))?;

            for object in output.contents() {
                let Some(key) = object.key().and_then(|k| self.store_key(k))
                else {
                    continue;
                };
                let last_modified = object
                    .last_modified()
                    .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.secs(), 0));
                entries.push(ObjectMeta {
                    key: key.to_string(),
                    last_modified,
                });
            }

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let object_key = self.object_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|err| StorageError::backend(key, err))?;
        Ok(())
    }

    async fn replace_if_unchanged(
        &self,
        key: &str,
        expected: &[u8],
        body: Vec<u8>,
    ) -> StorageResult<bool> {
        let Some((current, etag)) = self.get_tagged(key).await? else {
            return Ok(false);
        };
        if current != expected {
            return Ok(false);
        }
        let object_key = self.object_key(key)?;
        let response = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .if_match(etag)
            .body(ByteStream::from(body))
            .send()
            .await;
        match response {
            Ok(_) => Ok(true),
            Err(err) => {
                let status = err.raw_response().map(|raw| raw.status().as_u16());
                if matches!(status, Some(404) | Some(409) | Some(412)) {
                    debug!(key, "conditional replace lost to a newer object");
                    return Ok(false);
                }
                Err(StorageError::backend(key, err))
            }
        }
    }

    async fn delete_if_unchanged(&self, key: &str, expected: &[u8]) -> StorageResult<bool> {
        let Some((current, etag)) = self.get_tagged(key).await? else {
            return Ok(false);
        };
        if current != expected {
            return Ok(false);
        }
        let object_key = self.object_key(key)?;
        let response = self
            .client
            .delete_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .if_match(etag)
            .send()
            .await;
        match response {
            Ok(_) => Ok(true),
            Err(err) => {
                let status = err.raw_response().map(|raw| raw.status().as_u16());
                if matches!(status, Some(404) | Some(409) | Some(412)) {
                    debug!(key, "conditional delete lost to a newer object");
                    return Ok(false);
                }
                Err(StorageError::backend(key, err))
            }
        }
    }
}
