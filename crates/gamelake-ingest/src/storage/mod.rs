//! Blob store abstraction
//!
//! The pipeline only needs a handful of object operations: prefix listing,
//! whole-object get/put, object tags, server-side copy and delete. They are
//! collected in [`BlobStore`] so the publishing protocols can run against S3
//! in production and against [`memory::MemoryBlobStore`] in tests.

use async_trait::async_trait;
use gamelake_common::types::ObjectStatus;
use std::collections::BTreeMap;
use thiserror::Error;

pub mod config;
pub mod memory;
pub mod s3;

pub use config::StorageConfig;
pub use memory::MemoryBlobStore;
pub use s3::S3BlobStore;

/// Object tags, ordered by key
pub type Tags = BTreeMap<String, String>;

pub const JSONL_CONTENT_TYPE: &str = "application/x-jsonlines";
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Tag set holding only `status=<status>`
pub fn status_tags(status: ObjectStatus) -> Tags {
    let mut tags = Tags::new();
    tags.insert(ObjectStatus::TAG_KEY.to_string(), status.as_str().to_string());
    tags
}

/// Reads the `status` tag, ignoring unknown values
pub fn status_of(tags: &Tags) -> Option<ObjectStatus> {
    tags.get(ObjectStatus::TAG_KEY)
        .and_then(|value| value.parse().ok())
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("{op} failed for '{key}': {message}")]
    Request {
        op: &'static str,
        key: String,
        message: String,
    },

    #[error("Invalid JSON at '{key}': {source}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub(crate) fn request(op: &'static str, key: &str, message: impl ToString) -> Self {
        StorageError::Request {
            op,
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Object store operations consumed by the pipeline
///
/// Implementations must be safe for unrelated concurrent calls; the
/// pipeline never holds a lock across them.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// All keys under `prefix`, following pagination to the end
    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;

    async fn get_object(&self, key: &str) -> StorageResult<Vec<u8>>;

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        tags: &Tags,
    ) -> StorageResult<()>;

    /// Replaces the whole tag set of an existing object
    async fn put_object_tagging(&self, key: &str, tags: &Tags) -> StorageResult<()>;

    async fn get_object_tagging(&self, key: &str) -> StorageResult<Tags>;

    /// Server-side copy that carries the source tags over
    async fn copy_object(&self, source_key: &str, dest_key: &str) -> StorageResult<()>;

    async fn delete_object(&self, key: &str) -> StorageResult<()>;

    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()>;
}

/// Fetch and decode a JSON document; `Ok(None)` when the key does not exist
pub async fn get_json<T, S>(store: &S, key: &str) -> StorageResult<Option<T>>
where
    T: serde::de::DeserializeOwned,
    S: BlobStore + ?Sized,
{
    match store.get_object(key).await {
        Ok(body) => serde_json::from_slice(&body)
            .map(Some)
            .map_err(|source| StorageError::Serialization {
                key: key.to_string(),
                source,
            }),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Encode `value` as pretty JSON and store it untagged
pub async fn put_json<T, S>(store: &S, key: &str, value: &T) -> StorageResult<()>
where
    T: serde::Serialize + ?Sized,
    S: BlobStore + ?Sized,
{
    let body = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Serialization {
        key: key.to_string(),
        source,
    })?;
    store
        .put_object(key, body, JSON_CONTENT_TYPE, &Tags::new())
        .await
}
