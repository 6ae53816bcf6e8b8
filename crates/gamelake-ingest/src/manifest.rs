//! Per-partition manifest of published batch files

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::PipelineError;
use crate::storage::{get_json, put_json, BlobStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub files: Vec<String>,
    pub total_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub batch_count: usize,
}

impl Manifest {
    /// A manifest listing only `files`, as written by a full refresh
    pub fn fresh(files: Vec<String>, count: u64, at: DateTime<Utc>) -> Self {
        let batch_count = files.len();
        Self {
            files,
            total_count: count,
            created_at: at,
            updated_at: at,
            batch_count,
        }
    }

    /// Append one run's files; `existing = None` starts an empty ledger at `at`
    pub fn merge(
        existing: Option<Manifest>,
        files: &[String],
        count: u64,
        at: DateTime<Utc>,
    ) -> Self {
        let mut manifest = existing.unwrap_or_else(|| Manifest::fresh(Vec::new(), 0, at));
        manifest.files.extend_from_slice(files);
        manifest.total_count += count;
        manifest.updated_at = at;
        manifest.batch_count = manifest.files.len();
        manifest
    }
}

pub struct ManifestLedger {
    store: Arc<dyn BlobStore>,
}

impl ManifestLedger {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn read(&self, key: &str) -> Result<Option<Manifest>, PipelineError> {
        get_json(self.store.as_ref(), key)
            .await
            .map_err(|source| PipelineError::Manifest {
                key: key.to_string(),
                source,
            })
    }

    /// Replace (`full_refresh`) or append to the manifest at `key`
    pub async fn update(
        &self,
        key: &str,
        new_files: &[String],
        new_count: u64,
        run_start: DateTime<Utc>,
        full_refresh: bool,
    ) -> Result<Manifest, PipelineError> {
        let manifest = if full_refresh {
            Manifest::fresh(new_files.to_vec(), new_count, run_start)
        } else {
            let existing = self.read(key).await?;
            if existing.is_none() {
                info!(key, "No manifest yet, starting a new one");
            }
            Manifest::merge(existing, new_files, new_count, run_start)
        };

        put_json(self.store.as_ref(), key, &manifest)
            .await
            .map_err(|source| PipelineError::Manifest {
                key: key.to_string(),
                source,
            })?;

        info!(
            key,
            files = manifest.files.len(),
            total_count = manifest.total_count,
            replaced = full_refresh,
            "Manifest written"
        );
        Ok(manifest)
    }
}
