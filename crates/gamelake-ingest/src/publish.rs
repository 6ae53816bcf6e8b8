//! Visibility protocols
//!
//! Readers only consume files tagged `status=final`. Appended entities get
//! there by tag-flip: new files are written as `temp`, the previous final
//! generation is re-tagged `outdated` (never deleted) and the new files are
//! tagged `final`. Tagging is best-effort per file and not atomic across
//! files.
//!
//! Snapshot entities use temp-and-swap instead: files are staged under a
//! run-scoped `_temp_{run}` directory, the live partition is cleared, and
//! every file the run wrote is copied into place and then removed. The keys
//! come from the writer, never from a listing of the staging directory, and
//! copies retry on `NotFound` to ride out read-after-write lag.
//! Between the delete and the last copy the partition has no files; the
//! swap does not promise uninterrupted reads.

use gamelake_common::types::ObjectStatus;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::entity::{MANIFEST_FILE, TEMP_DIR_PREFIX};
use crate::error::PublishError;
use crate::retry::{retry, RetryPolicy};
use crate::storage::{status_of, status_tags, BlobStore, StorageError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagOutcome {
    pub tagged: usize,
    pub failed: Vec<String>,
}

pub struct Publisher {
    store: Arc<dyn BlobStore>,
    swap_retry: RetryPolicy,
}

fn is_manifest(key: &str) -> bool {
    key.ends_with(MANIFEST_FILE) || key.ends_with('/')
}

fn with_slash(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

impl Publisher {
    pub fn new(store: Arc<dyn BlobStore>, swap_retry: RetryPolicy) -> Self {
        Self { store, swap_retry }
    }

    /// Keys under `prefix` currently tagged `final`
    ///
    /// Files whose tags cannot be read are logged and left out.
    #[instrument(skip(self))]
    pub async fn list_final(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut finals = Vec::new();
        for key in self.store.list_by_prefix(prefix).await? {
            if is_manifest(&key) {
                continue;
            }
            match self.store.get_object_tagging(&key).await {
                Ok(tags) if status_of(&tags) == Some(ObjectStatus::Final) => finals.push(key),
                Ok(_) => {}
                Err(e) => warn!(key = %key, error = %e, "Could not read tags, skipping"),
            }
        }
        debug!(count = finals.len(), "Final files found");
        Ok(finals)
    }

    /// Set `status` on every key, logging and skipping individual failures
    pub async fn tag_all(&self, keys: &[String], status: ObjectStatus) -> TagOutcome {
        let tags = status_tags(status);
        let mut outcome = TagOutcome::default();

        for key in keys {
            match self.store.put_object_tagging(key, &tags).await {
                Ok(()) => outcome.tagged += 1,
                Err(e) => {
                    warn!(key = %key, status = %status, error = %e, "Tag update failed");
                    outcome.failed.push(key.clone());
                }
            }
        }

        if !outcome.failed.is_empty() {
            warn!(
                failed = outcome.failed.len(),
                status = %status,
                "Some files kept their previous tag"
            );
        }
        info!(tagged = outcome.tagged, status = %status, "Files tagged");
        outcome
    }

    pub async fn mark_outdated(&self, keys: &[String]) -> TagOutcome {
        self.tag_all(keys, ObjectStatus::Outdated).await
    }

    pub async fn mark_final(&self, keys: &[String]) -> TagOutcome {
        self.tag_all(keys, ObjectStatus::Final).await
    }

    /// Remove the live files of a partition, keeping the manifest and every
    /// `_temp_` staging directory
    #[instrument(skip(self))]
    pub async fn clear_partition(&self, dest_prefix: &str) -> Result<usize, StorageError> {
        let dest = with_slash(dest_prefix);
        let doomed: Vec<String> = self
            .store
            .list_by_prefix(&dest)
            .await?
            .into_iter()
            .filter(|key| {
                let relative = key.strip_prefix(dest.as_str()).unwrap_or(key);
                !is_manifest(key) && !relative.starts_with(TEMP_DIR_PREFIX)
            })
            .collect();

        if !doomed.is_empty() {
            self.store.delete_objects(&doomed).await?;
        }
        info!(deleted = doomed.len(), "Partition cleared");
        Ok(doomed.len())
    }

    /// Replace the files under `dest_prefix` with `staged_keys`, which must
    /// all live under `staging_prefix`; returns the destination keys in the
    /// same order
    #[instrument(skip(self, staged_keys), fields(staged = staged_keys.len()))]
    pub async fn swap(
        &self,
        staging_prefix: &str,
        staged_keys: &[String],
        dest_prefix: &str,
    ) -> Result<Vec<String>, PublishError> {
        let staging = with_slash(staging_prefix);
        let dest = with_slash(dest_prefix);

        let targets = staged_keys
            .iter()
            .map(|source| match source.strip_prefix(staging.as_str()) {
                Some(relative) if !relative.is_empty() => {
                    Ok((source.as_str(), format!("{dest}{relative}")))
                }
                _ => Err(PublishError::OutsideStaging {
                    key: source.clone(),
                    staging: staging.clone(),
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.clear_partition(&dest).await?;

        let mut moved = Vec::with_capacity(targets.len());
        for (source, target) in targets {
            self.move_object(source, &target).await?;
            moved.push(target);
        }

        info!(moved = moved.len(), "Staged files swapped into place");
        Ok(moved)
    }

    async fn move_object(&self, source: &str, target: &str) -> Result<(), PublishError> {
        let what = format!("Copy of {source}");
        retry(&self.swap_retry, &what, StorageError::is_not_found, |_| {
            self.store.copy_object(source, target)
        })
        .await
        .map_err(|e| match e {
            StorageError::NotFound { key } => PublishError::EventualConsistency {
                key,
                attempts: self.swap_retry.max_attempts,
            },
            other => PublishError::Storage(other),
        })?;

        self.store.delete_object(source).await?;
        debug!(source, target, "Moved");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::memory::StoreOp;
    use crate::storage::{MemoryBlobStore, Tags};
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(4))
    }

    fn publisher(store: &Arc<MemoryBlobStore>) -> Publisher {
        Publisher::new(store.clone(), fast_retry())
    }

    #[tokio::test]
    async fn test_list_final_skips_manifest_and_other_tags() {
        let store = Arc::new(MemoryBlobStore::new());
        let seed = |key: &str, status| store.insert(key, "{}", status_tags(status));
        seed("raw/games/dt=2025-01-14/batch-0-a.jsonl", ObjectStatus::Final);
        seed("raw/games/dt=2025-01-14/batch-1-b.jsonl", ObjectStatus::Outdated);
        seed("raw/games/dt=2025-01-15/batch-0-c.jsonl", ObjectStatus::Temp);
        store.insert("raw/games/dt=2025-01-15/_manifest.json", "{}", Tags::new());

        let finals = publisher(&store).list_final("raw/games/").await.unwrap();
        assert_eq!(finals, vec!["raw/games/dt=2025-01-14/batch-0-a.jsonl".to_string()]);
    }

    #[tokio::test]
    async fn test_tag_failures_are_skipped() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("raw/games/a.jsonl", "{}", status_tags(ObjectStatus::Temp));
        store.insert("raw/games/b.jsonl", "{}", status_tags(ObjectStatus::Temp));
        store.fail_on(StoreOp::PutTagging, "raw/games/a");

        let keys = vec!["raw/games/a.jsonl".to_string(), "raw/games/b.jsonl".to_string()];
        let outcome = publisher(&store).mark_final(&keys).await;

        assert_eq!(outcome.tagged, 1);
        assert_eq!(outcome.failed, vec!["raw/games/a.jsonl".to_string()]);
        assert_eq!(store.tags("raw/games/b.jsonl"), Some(status_tags(ObjectStatus::Final)));
        assert_eq!(store.tags("raw/games/a.jsonl"), Some(status_tags(ObjectStatus::Temp)));
    }

    #[tokio::test]
    async fn test_clear_partition_keeps_manifest_and_staging() {
        let store = Arc::new(MemoryBlobStore::new());
        let dest = "raw/popscore/dt=2025-01-15";
        store.insert(format!("{dest}/batch-0.jsonl"), "{}", Tags::new());
        store.insert(format!("{dest}/_manifest.json"), "{}", Tags::new());
        store.insert(format!("{dest}/_temp_old/batch-0.jsonl"), "{}", Tags::new());
        store.insert("raw/popscore/dt=2025-01-150/batch-0.jsonl", "{}", Tags::new());

        let deleted = publisher(&store).clear_partition(dest).await.unwrap();

        assert_eq!(deleted, 1);
        assert!(store.object(&format!("{dest}/_manifest.json")).is_some());
        assert!(store.object(&format!("{dest}/_temp_old/batch-0.jsonl")).is_some());
        assert!(store.object("raw/popscore/dt=2025-01-150/batch-0.jsonl").is_some());
    }

    #[tokio::test]
    async fn test_swap_retries_not_found_copies() {
        let store = Arc::new(MemoryBlobStore::new());
        let staged = "raw/popscore/dt=2025-01-15/_temp_r1/batch-0.jsonl";
        store.insert(staged, "{}", status_tags(ObjectStatus::Temp));
        store.fail_copy_not_found(staged, 3);

        let moved = publisher(&store)
            .swap(
                "raw/popscore/dt=2025-01-15/_temp_r1",
                &[staged.to_string()],
                "raw/popscore/dt=2025-01-15",
            )
            .await
            .unwrap();

        assert_eq!(moved, vec!["raw/popscore/dt=2025-01-15/batch-0.jsonl".to_string()]);
        assert_eq!(store.call_count(StoreOp::Copy), 4);
        assert!(store.object(staged).is_none());
    }

    #[tokio::test]
    async fn test_swap_gives_up_with_eventual_consistency_error() {
        let store = Arc::new(MemoryBlobStore::new());
        let staged = "raw/popscore/dt=2025-01-15/_temp_r1/batch-0.jsonl";
        store.insert(staged, "{}", status_tags(ObjectStatus::Temp));
        store.fail_copy_not_found(staged, 10);

        let err = publisher(&store)
            .swap(
                "raw/popscore/dt=2025-01-15/_temp_r1",
                &[staged.to_string()],
                "raw/popscore/dt=2025-01-15",
            )
            .await
            .unwrap_err();

        match err {
            PublishError::EventualConsistency { key, attempts } => {
                assert_eq!(key, staged);
                assert_eq!(attempts, 5);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.call_count(StoreOp::Copy), 5);
        // staged file is left behind for inspection
        assert!(store.object(staged).is_some());
    }

    #[tokio::test]
    async fn test_swap_rejects_keys_outside_staging() {
        let store = Arc::new(MemoryBlobStore::new());
        let live = "raw/popscore/dt=2025-01-15/batch-0.jsonl";
        store.insert(live, "{}", status_tags(ObjectStatus::Final));

        let err = publisher(&store)
            .swap(
                "raw/popscore/dt=2025-01-15/_temp_r1",
                &["raw/popscore/dt=2025-01-14/_temp_r1/batch-0.jsonl".to_string()],
                "raw/popscore/dt=2025-01-15",
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::OutsideStaging { .. }));
        // Rejected before anything was deleted
        assert!(store.object(live).is_some());
        assert_eq!(store.call_count(StoreOp::DeleteMany), 0);
    }
}
