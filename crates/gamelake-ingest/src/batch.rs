//! Buffers extracted records into fixed-size JSONL batch files

use gamelake_common::types::ObjectStatus;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::extract::{Record, RecordStream};
use crate::storage::{status_tags, BlobStore, StorageError, JSONL_CONTENT_TYPE};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Keys in write order
    pub keys: Vec<String>,
    pub total_count: u64,
    pub batch_count: usize,
}

/// Key for batch `index` under `prefix`
///
/// Snapshot batches get deterministic names so a re-run targets the same key
/// set; appended batches get a fresh UUID every call.
pub fn batch_key(prefix: &str, index: usize, deterministic: bool) -> String {
    if deterministic {
        format!("{prefix}/batch-{index}.jsonl")
    } else {
        format!("{prefix}/batch-{index}-{}.jsonl", Uuid::new_v4())
    }
}

fn encode_jsonl(key: &str, records: &[Record]) -> Result<Vec<u8>, StorageError> {
    let lines = records
        .iter()
        .map(serde_json::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| StorageError::Serialization {
            key: key.to_string(),
            source,
        })?;
    Ok(lines.join("\n").into_bytes())
}

pub struct BatchProcessor {
    store: Arc<dyn BlobStore>,
    batch_size: usize,
}

impl BatchProcessor {
    pub fn new(store: Arc<dyn BlobStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Drain `stream` into `status=temp` batches under `prefix`
    ///
    /// Stops at the first extraction or write error; files already written
    /// stay in place, still tagged temp.
    pub async fn process(
        &self,
        mut stream: RecordStream,
        prefix: &str,
        deterministic_keys: bool,
    ) -> Result<BatchResult, PipelineError> {
        let mut result = BatchResult::default();
        let mut batch: Vec<Record> = Vec::with_capacity(self.batch_size.min(10_000));

        while let Some(item) = stream.next().await {
            batch.push(item?);
            result.total_count += 1;

            if batch.len() >= self.batch_size {
                self.flush(&mut batch, prefix, deterministic_keys, &mut result)
                    .await?;
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch, prefix, deterministic_keys, &mut result)
                .await?;
        }

        info!(
            prefix,
            records = result.total_count,
            batches = result.batch_count,
            "Batches written"
        );
        Ok(result)
    }

    async fn flush(
        &self,
        batch: &mut Vec<Record>,
        prefix: &str,
        deterministic_keys: bool,
        result: &mut BatchResult,
    ) -> Result<(), StorageError> {
        let key = batch_key(prefix, result.batch_count, deterministic_keys);
        let body = encode_jsonl(&key, batch)?;

        self.store
            .put_object(
                &key,
                body,
                JSONL_CONTENT_TYPE,
                &status_tags(ObjectStatus::Temp),
            )
            .await?;

        debug!(key = %key, records = batch.len(), "Batch written");
        batch.clear();
        result.keys.push(key);
        result.batch_count += 1;
        Ok(())
    }
}
