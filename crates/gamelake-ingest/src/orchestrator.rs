//! Pipeline orchestrator
//!
//! Runs every entity in catalogue order. Per entity:
//!
//! 1. Pick the mode: full when forced or for snapshots, otherwise
//!    incremental if a checkpoint exists.
//! 2. On a full run of an appended entity, remember which files are final.
//! 3. Extract and write `temp` batches (snapshots into a staging directory).
//! 4. With zero records, only the checkpoint moves.
//! 5. Publish: swap for snapshots; manifest plus tag-flip otherwise.
//! 6. Save the checkpoint at the extraction start time.
//!
//! A failing entity is recorded and the next one runs. The edge cache is
//! invalidated once at the end, and a failure there is only logged.

use chrono::{DateTime, Utc};
use gamelake_common::types::PartitionDate;
use serde::Serialize;
use serde_json::{json, Map};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::batch::BatchProcessor;
use crate::cache::EdgeCache;
use crate::config::PipelineConfig;
use crate::entity::{catalogue, EntityKind, EntitySpec, ExtractionMode};
use crate::error::PipelineError;
use crate::extract::{Extractor, FetchMode};
use crate::manifest::ManifestLedger;
use crate::publish::{Publisher, TagOutcome};
use crate::state::StateStore;
use crate::storage::BlobStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineResult {
    pub entity: String,
    pub record_count: u64,
    pub file_count: usize,
    pub elapsed_seconds: f64,
    pub mode: ExtractionMode,
    /// Files whose status tag could not be updated
    pub tag_failures: usize,
}

#[derive(Debug)]
pub struct EntityFailure {
    pub entity: String,
    pub error: PipelineError,
}

#[derive(Debug)]
pub struct RunReport {
    pub partition: PartitionDate,
    pub results: Vec<PipelineResult>,
    pub failures: Vec<EntityFailure>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn total_records(&self) -> u64 {
        self.results.iter().map(|r| r.record_count).sum()
    }

    /// One log line per entity, then the totals
    pub fn log_summary(&self) {
        for result in &self.results {
            info!(
                entity = %result.entity,
                mode = %result.mode,
                records = result.record_count,
                files = result.file_count,
                elapsed_secs = %format!("{:.2}", result.elapsed_seconds),
                "Entity succeeded"
            );
            if result.tag_failures > 0 {
                warn!(
                    entity = %result.entity,
                    tag_failures = result.tag_failures,
                    "Some files were left with a stale status tag"
                );
            }
        }
        for failure in &self.failures {
            error!(entity = %failure.entity, error = %failure.error, "Entity failed");
        }
        info!(
            partition = %self.partition,
            succeeded = self.results.len(),
            failed = self.failures.len(),
            records = self.total_records(),
            elapsed_secs = %format!("{:.2}", self.elapsed.as_secs_f64()),
            "Pipeline run completed"
        );
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub partition: PartitionDate,
    pub full_refresh: bool,
    /// Restrict the run to these entities; empty means all
    pub only: Vec<String>,
}

impl RunOptions {
    pub fn new(partition: PartitionDate) -> Self {
        Self {
            partition,
            full_refresh: false,
            only: Vec::new(),
        }
    }

    pub fn full_refresh(mut self, full_refresh: bool) -> Self {
        self.full_refresh = full_refresh;
        self
    }

    pub fn only(mut self, entities: Vec<String>) -> Self {
        self.only = entities;
        self
    }
}

pub struct Orchestrator {
    extractor: Arc<Extractor>,
    batches: BatchProcessor,
    manifests: ManifestLedger,
    publisher: Publisher,
    state: StateStore,
    cache: Arc<dyn EdgeCache>,
    entities: Vec<EntitySpec>,
    fetch_mode: FetchMode,
}

impl Orchestrator {
    pub fn new(
        config: &PipelineConfig,
        extractor: Arc<Extractor>,
        store: Arc<dyn BlobStore>,
        cache: Arc<dyn EdgeCache>,
    ) -> Self {
        Self {
            extractor,
            batches: BatchProcessor::new(store.clone(), config.pipeline.batch_size),
            manifests: ManifestLedger::new(store.clone()),
            publisher: Publisher::new(store.clone(), config.pipeline.swap_retry),
            state: StateStore::new(store, config.pipeline.state_prefix.clone()),
            cache,
            entities: catalogue(config.upstream.page_size),
            fetch_mode: FetchMode::Concurrent,
        }
    }

    /// Replace the entity catalogue, keeping the given order
    pub fn with_entities(mut self, entities: Vec<EntitySpec>) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_fetch_mode(mut self, fetch_mode: FetchMode) -> Self {
        self.fetch_mode = fetch_mode;
        self
    }

    pub fn entities(&self) -> &[EntitySpec] {
        &self.entities
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    fn select(&self, only: &[String]) -> Result<Vec<&EntitySpec>, PipelineError> {
        if let Some(unknown) = only
            .iter()
            .find(|name| !self.entities.iter().any(|e| e.name == name.as_str()))
        {
            return Err(PipelineError::Config(format!("Unknown entity '{unknown}'")));
        }

        Ok(self
            .entities
            .iter()
            .filter(|e| only.is_empty() || only.iter().any(|name| name == e.name))
            .collect())
    }

    /// Run the selected entities in order and report on each
    ///
    /// Only an invalid entity selection fails the call; entity failures are
    /// collected in the report.
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport, PipelineError> {
        let started = Instant::now();
        let entities = self.select(&options.only)?;
        info!(
            partition = %options.partition,
            full_refresh = options.full_refresh,
            entities = entities.len(),
            "Pipeline run started"
        );

        let mut results = Vec::new();
        let mut failures = Vec::new();

        for entity in &entities {
            match self.run_entity(entity, options).await {
                Ok(result) => results.push(result),
                Err(e) => {
                    error!(entity = entity.name, error = %e, "Entity run failed, continuing");
                    failures.push(EntityFailure {
                        entity: entity.name.to_string(),
                        error: e,
                    });
                }
            }
        }

        let paths: Vec<String> = entities
            .iter()
            .map(|e| e.cache_path(&options.partition))
            .collect();
        if let Err(e) = self.cache.invalidate(&paths).await {
            error!(error = %e, "Edge cache invalidation failed");
        }

        Ok(RunReport {
            partition: options.partition,
            results,
            failures,
            elapsed: started.elapsed(),
        })
    }

    async fn cursor_for(
        &self,
        entity: &EntitySpec,
        full_refresh: bool,
    ) -> Result<Option<DateTime<Utc>>, PipelineError> {
        if !entity.is_incremental_capable() {
            info!(entity = entity.name, "Snapshot entity, always a full load");
            return Ok(None);
        }
        if full_refresh {
            info!(entity = entity.name, "Full refresh requested");
            return Ok(None);
        }
        Ok(self
            .state
            .get(entity.name)
            .await?
            .map(|checkpoint| checkpoint.last_run_time))
    }

    #[instrument(skip(self, entity, options), fields(entity = entity.name, partition = %options.partition))]
    pub async fn run_entity(
        &self,
        entity: &EntitySpec,
        options: &RunOptions,
    ) -> Result<PipelineResult, PipelineError> {
        let started = Instant::now();
        let run_start = Utc::now();
        let snapshot_entity = entity.kind == EntityKind::TimeSeries;

        let cursor = self.cursor_for(entity, options.full_refresh).await?;
        let mode = if cursor.is_some() {
            ExtractionMode::Incremental
        } else {
            ExtractionMode::Full
        };

        let previous_finals = if mode == ExtractionMode::Full && !snapshot_entity {
            let finals = self.publisher.list_final(&entity.entity_root()).await?;
            info!(count = finals.len(), "Final files to outdate after publish");
            finals
        } else {
            Vec::new()
        };

        let partition_prefix = entity.partition_prefix(&options.partition);
        let target_prefix = if snapshot_entity {
            let run_id = Uuid::new_v4().simple().to_string();
            entity.staging_prefix(&options.partition, &run_id[..8])
        } else {
            partition_prefix.clone()
        };

        let stream = self
            .extractor
            .extract(Arc::new(entity.clone()), cursor, self.fetch_mode);
        let batch = self
            .batches
            .process(stream, &target_prefix, snapshot_entity)
            .await?;

        if batch.total_count == 0 {
            info!("No new records, advancing checkpoint only");
            self.save_checkpoint(entity, run_start, 0, mode).await?;
            return Ok(PipelineResult {
                entity: entity.name.to_string(),
                record_count: 0,
                file_count: 0,
                elapsed_seconds: started.elapsed().as_secs_f64(),
                mode,
                tag_failures: 0,
            });
        }

        let manifest_key = entity.manifest_key(&options.partition);
        let (published, tag_failures) = if snapshot_entity {
            let moved = self
                .publisher
                .swap(&target_prefix, &batch.keys, &partition_prefix)
                .await?;
            self.manifests
                .update(&manifest_key, &moved, batch.total_count, run_start, true)
                .await?;
            let finalized = self.publisher.mark_final(&moved).await;
            (moved, finalized.failed.len())
        } else {
            self.manifests
                .update(
                    &manifest_key,
                    &batch.keys,
                    batch.total_count,
                    run_start,
                    mode == ExtractionMode::Full,
                )
                .await?;
            let outdated = if previous_finals.is_empty() {
                TagOutcome::default()
            } else {
                self.publisher.mark_outdated(&previous_finals).await
            };
            let finalized = self.publisher.mark_final(&batch.keys).await;
            (batch.keys, outdated.failed.len() + finalized.failed.len())
        };

        self.save_checkpoint(entity, run_start, batch.total_count, mode)
            .await?;

        let result = PipelineResult {
            entity: entity.name.to_string(),
            record_count: batch.total_count,
            file_count: published.len(),
            elapsed_seconds: started.elapsed().as_secs_f64(),
            mode,
            tag_failures,
        };
        info!(
            mode = %result.mode,
            records = result.record_count,
            files = result.file_count,
            tag_failures = result.tag_failures,
            "Entity run finished"
        );
        Ok(result)
    }

    async fn save_checkpoint(
        &self,
        entity: &EntitySpec,
        run_start: DateTime<Utc>,
        records: u64,
        mode: ExtractionMode,
    ) -> Result<(), PipelineError> {
        let mut metadata = Map::new();
        metadata.insert("records_processed".to_string(), json!(records));
        metadata.insert("mode".to_string(), json!(mode.as_str()));
        self.state.save_with(entity.name, run_start, metadata).await
    }
}
