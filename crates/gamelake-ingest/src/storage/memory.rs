//! In-process [`BlobStore`] with call recording and fault injection

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{BlobStore, StorageError, StorageResult, Tags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    List,
    Get,
    Put,
    PutTagging,
    GetTagging,
    Copy,
    Delete,
    DeleteMany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
    pub tags: Tags,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    calls: Vec<(StoreOp, String)>,
    copy_not_found: HashMap<String, u32>,
    failures: Vec<(StoreOp, String)>,
}

impl Inner {
    fn record(&mut self, op: StoreOp, key: &str) -> StorageResult<()> {
        self.calls.push((op, key.to_string()));
        let injected = self
            .failures
            .iter()
            .any(|(failing_op, prefix)| *failing_op == op && key.starts_with(prefix.as_str()));
        if injected {
            return Err(StorageError::request(op_name(op), key, "injected failure"));
        }
        Ok(())
    }
}

fn op_name(op: StoreOp) -> &'static str {
    match op {
        StoreOp::List => "list_objects_v2",
        StoreOp::Get => "get_object",
        StoreOp::Put => "put_object",
        StoreOp::PutTagging => "put_object_tagging",
        StoreOp::GetTagging => "get_object_tagging",
        StoreOp::Copy => "copy_object",
        StoreOp::Delete => "delete_object",
        StoreOp::DeleteMany => "delete_objects",
    }
}

/// Object store kept in a `BTreeMap`, so listings come back in key order
/// like S3's.
#[derive(Default)]
pub struct MemoryBlobStore {
    inner: Mutex<Inner>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed an object without recording a call
    pub fn insert(&self, key: impl Into<String>, body: impl Into<Vec<u8>>, tags: Tags) {
        self.lock().objects.insert(
            key.into(),
            StoredObject {
                body: body.into(),
                content_type: super::JSONL_CONTENT_TYPE.to_string(),
                tags,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn tags(&self, key: &str) -> Option<Tags> {
        self.lock().objects.get(key).map(|o| o.tags.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn calls(&self) -> Vec<(StoreOp, String)> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: StoreOp) -> usize {
        self.lock().calls.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// The next `times` copies from `source_key` report the source as missing,
    /// mimicking a listing that is ahead of read-after-write visibility.
    pub fn fail_copy_not_found(&self, source_key: impl Into<String>, times: u32) {
        self.lock().copy_not_found.insert(source_key.into(), times);
    }

    /// Every `op` on a key starting with `key_prefix` fails from now on
    pub fn fail_on(&self, op: StoreOp, key_prefix: impl Into<String>) {
        self.lock().failures.push((op, key_prefix.into()));
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list_by_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut inner = self.lock();
        inner.record(StoreOp::List, prefix)?;
        Ok(inner
            .objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_object(&self, key: &str) -> StorageResult<Vec<u8>> {
        let mut inner = self.lock();
        inner.record(StoreOp::Get, key)?;
        inner
            .objects
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        tags: &Tags,
    ) -> StorageResult<()> {
        let mut inner = self.lock();
        inner.record(StoreOp::Put, key)?;
        inner.objects.insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                tags: tags.clone(),
            },
        );
        Ok(())
    }

    async fn put_object_tagging(&self, key: &str, tags: &Tags) -> StorageResult<()> {
        let mut inner = self.lock();
        inner.record(StoreOp::PutTagging, key)?;
        match inner.objects.get_mut(key) {
            Some(object) => {
                object.tags = tags.clone();
                Ok(())
            }
            None => Err(StorageError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn get_object_tagging(&self, key: &str) -> StorageResult<Tags> {
        let mut inner = self.lock();
        inner.record(StoreOp::GetTagging, key)?;
        inner
            .objects
            .get(key)
            .map(|o| o.tags.clone())
            .ok_or_else(|| StorageError::NotFound {
                key: key.to_string(),
            })
    }

    async fn copy_object(&self, source_key: &str, dest_key: &str) -> StorageResult<()> {
        let mut inner = self.lock();
        inner.record(StoreOp::Copy, source_key)?;

        if let Some(remaining) = inner.copy_not_found.get_mut(source_key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::NotFound {
                    key: source_key.to_string(),
                });
            }
        }

        let object = inner
            .objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                key: source_key.to_string(),
            })?;
        inner.objects.insert(dest_key.to_string(), object);
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> StorageResult<()> {
        let mut inner = self.lock();
        inner.record(StoreOp::Delete, key)?;
        inner.objects.remove(key);
        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> StorageResult<()> {
        let mut inner = self.lock();
        for key in keys {
            inner.record(StoreOp::DeleteMany, key)?;
        }
        for key in keys {
            inner.objects.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::status_tags;
    use gamelake_common::types::ObjectStatus;

    #[tokio::test]
    async fn test_copy_preserves_tags() {
        let store = MemoryBlobStore::new();
        store.insert("a/1.jsonl", "{}", status_tags(ObjectStatus::Temp));

        store.copy_object("a/1.jsonl", "b/1.jsonl").await.unwrap();

        assert_eq!(store.tags("b/1.jsonl"), Some(status_tags(ObjectStatus::Temp)));
        assert!(store.object("a/1.jsonl").is_some());
    }

    #[tokio::test]
    async fn test_injected_copy_not_found_runs_out() {
        let store = MemoryBlobStore::new();
        store.insert("a/1.jsonl", "{}", Tags::new());
        store.fail_copy_not_found("a/1.jsonl", 2);

        assert!(store.copy_object("a/1.jsonl", "b").await.unwrap_err().is_not_found());
        assert!(store.copy_object("a/1.jsonl", "b").await.unwrap_err().is_not_found());
        store.copy_object("a/1.jsonl", "b").await.unwrap();
        assert_eq!(store.call_count(StoreOp::Copy), 3);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let store = MemoryBlobStore::new();
        assert!(store.get_object("nope").await.unwrap_err().is_not_found());
        assert!(store
            .put_object_tagging("nope", &Tags::new())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_fail_on_matches_prefix() {
        let store = MemoryBlobStore::new();
        store.insert("raw/games/x.jsonl", "{}", Tags::new());
        store.insert("raw/genres/y.jsonl", "{}", Tags::new());
        store.fail_on(StoreOp::PutTagging, "raw/games/");

        let tags = status_tags(ObjectStatus::Final);
        assert!(store.put_object_tagging("raw/games/x.jsonl", &tags).await.is_err());
        store.put_object_tagging("raw/genres/y.jsonl", &tags).await.unwrap();
    }
}
