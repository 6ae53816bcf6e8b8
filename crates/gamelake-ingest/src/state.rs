//! Per-entity extraction checkpoints
//!
//! Each entity owns one JSON document at `{prefix}{entity}.json`:
//!
//! ```json
//! {
//!   "last_run_time": "2025-01-15T10:00:00+00:00",
//!   "updated_at": "2025-01-15T10:42:13.120+00:00",
//!   "records_processed": 342000
//! }
//! ```
//!
//! Saving merges into the stored document, so keys written by other tools
//! survive.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::storage::{put_json, BlobStore, StorageError};

const LAST_RUN_TIME: &str = "last_run_time";
const UPDATED_AT: &str = "updated_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub entity: String,
    pub last_run_time: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Parse a stored timestamp; offset-less values are taken as UTC
fn parse_time(entity: &str, field: &str, raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }
    match NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        Ok(naive) => {
            warn!(entity, field, value = raw, "Timestamp has no timezone, assuming UTC");
            Some(naive.and_utc())
        }
        Err(_) => {
            warn!(entity, field, value = raw, "Unparsable timestamp");
            None
        }
    }
}

pub struct StateStore {
    store: Arc<dyn BlobStore>,
    prefix: String,
}

impl StateStore {
    pub fn new(store: Arc<dyn BlobStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, entity: &str) -> String {
        format!("{}{}.json", self.prefix, entity)
    }

    fn state_error(entity: &str, source: StorageError) -> PipelineError {
        PipelineError::State {
            entity: entity.to_string(),
            source,
        }
    }

    /// The stored document; `None` when missing or not a JSON object
    async fn read_document(
        &self,
        entity: &str,
    ) -> Result<Option<Map<String, Value>>, PipelineError> {
        let key = self.key(entity);
        let body = match self.store.get_object(&key).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(Self::state_error(entity, e)),
        };

        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(document)) => Ok(Some(document)),
            Ok(_) => {
                warn!(entity, key = %key, "State document is not a JSON object, ignoring it");
                Ok(None)
            }
            Err(e) => {
                warn!(
                    entity,
                    key = %key,
                    error = %e,
                    "State document is not valid JSON, ignoring it"
                );
                Ok(None)
            }
        }
    }

    /// Last checkpoint, or `None` when the entity has never completed a run
    pub async fn get(&self, entity: &str) -> Result<Option<Checkpoint>, PipelineError> {
        let Some(document) = self.read_document(entity).await? else {
            info!(entity, "No checkpoint stored");
            return Ok(None);
        };

        let Some(raw) = document.get(LAST_RUN_TIME).and_then(Value::as_str) else {
            warn!(entity, "Checkpoint has no last_run_time");
            return Ok(None);
        };

        let Some(last_run_time) = parse_time(entity, LAST_RUN_TIME, raw) else {
            return Ok(None);
        };
        let updated_at = document
            .get(UPDATED_AT)
            .and_then(Value::as_str)
            .and_then(|raw| parse_time(entity, UPDATED_AT, raw));

        debug!(entity, last_run_time = %last_run_time.to_rfc3339(), "Checkpoint loaded");
        Ok(Some(Checkpoint {
            entity: entity.to_string(),
            last_run_time,
            updated_at,
        }))
    }

    pub async fn save(&self, entity: &str, run_time: DateTime<Utc>) -> Result<(), PipelineError> {
        self.save_with(entity, run_time, Map::new()).await
    }

    /// Store `run_time` plus `metadata`, keeping unrelated keys already present
    pub async fn save_with(
        &self,
        entity: &str,
        run_time: DateTime<Utc>,
        metadata: Map<String, Value>,
    ) -> Result<(), PipelineError> {
        let mut document = self.read_document(entity).await?.unwrap_or_default();
        document.extend(metadata);
        document.insert(LAST_RUN_TIME.to_string(), Value::String(run_time.to_rfc3339()));
        document.insert(UPDATED_AT.to_string(), Value::String(Utc::now().to_rfc3339()));

        let key = self.key(entity);
        put_json(self.store.as_ref(), &key, &Value::Object(document))
            .await
            .map_err(|e| Self::state_error(entity, e))?;

        info!(entity, last_run_time = %run_time.to_rfc3339(), "Checkpoint saved");
        Ok(())
    }

    /// Forget the checkpoint so the next run is a full load
    pub async fn reset(&self, entity: &str) -> Result<(), PipelineError> {
        self.store
            .delete_object(&self.key(entity))
            .await
            .map_err(|e| Self::state_error(entity, e))?;
        info!(entity, "Checkpoint reset");
        Ok(())
    }

    /// Every entity with a stored document, with its last run time if readable
    pub async fn list(&self) -> Result<Vec<(String, Option<DateTime<Utc>>)>, PipelineError> {
        let keys = self
            .store
            .list_by_prefix(&self.prefix)
            .await
            .map_err(|e| Self::state_error("*", e))?;

        let mut entries = Vec::new();
        for key in keys {
            let Some(entity) = key
                .strip_prefix(self.prefix.as_str())
                .and_then(|rest| rest.strip_suffix(".json"))
                .filter(|name| !name.is_empty() && !name.contains('/'))
            else {
                continue;
            };
            let last_run_time = self.get(entity).await?.map(|c| c.last_run_time);
            entries.push((entity.to_string(), last_run_time));
        }
        Ok(entries)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBlobStore, Tags};
    use chrono::TimeZone;
    use serde_json::json;

    const PREFIX: &str = "pipeline/state/";

    fn state(store: &Arc<MemoryBlobStore>) -> StateStore {
        StateStore::new(store.clone(), PREFIX)
    }

    fn stored(store: &MemoryBlobStore, entity: &str) -> Value {
        let body = store.object(&format!("{PREFIX}{entity}.json")).unwrap().body;
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_none() {
        let store = Arc::new(MemoryBlobStore::new());
        assert_eq!(state(&store).get("games").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_save_then_get() {
        let store = Arc::new(MemoryBlobStore::new());
        let run = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();

        state(&store).save("games", run).await.unwrap();
        let checkpoint = state(&store).get("games").await.unwrap().unwrap();

        assert_eq!(checkpoint.entity, "games");
        assert_eq!(checkpoint.last_run_time, run);
        assert!(checkpoint.updated_at.is_some());
        assert_eq!(stored(&store, "games")["last_run_time"], "2025-01-15T10:00:00+00:00");
    }

    #[tokio::test]
    async fn test_save_preserves_unrelated_keys() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert(
            format!("{PREFIX}games.json"),
            json!({
                "owner": "analytics",
                "last_run_time": "2024-01-01T00:00:00+00:00",
            })
            .to_string(),
            Tags::new(),
        );
        let mut metadata = Map::new();
        metadata.insert("records_processed".to_string(), json!(42));

        let run = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        state(&store).save_with("games", run, metadata).await.unwrap();

        let document = stored(&store, "games");
        assert_eq!(document["owner"], "analytics");
        assert_eq!(document["records_processed"], 42);
        assert_eq!(document["last_run_time"], "2025-01-15T10:00:00+00:00");
    }

    #[tokio::test]
    async fn test_naive_stored_time_is_read_as_utc() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert(
            format!("{PREFIX}genres.json"),
            json!({ "last_run_time": "2025-01-15T10:00:00" }).to_string(),
            Tags::new(),
        );

        let checkpoint = state(&store).get("genres").await.unwrap().unwrap();
        assert_eq!(
            checkpoint.last_run_time,
            Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_corrupt_document_means_full_load() {
        let store = Arc::new(MemoryBlobStore::new());
        store.insert(format!("{PREFIX}themes.json"), "{ not json", Tags::new());
        assert_eq!(state(&store).get("themes").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_and_list() {
        let store = Arc::new(MemoryBlobStore::new());
        let run = Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap();
        let states = state(&store);
        states.save("games", run).await.unwrap();
        states.save("genres", run).await.unwrap();
        store.insert(format!("{PREFIX}themes.json"), "{}", Tags::new());

        let listed = states.list().await.unwrap();
        assert_eq!(
            listed,
            vec![
                ("games".to_string(), Some(run)),
                ("genres".to_string(), Some(run)),
                ("themes".to_string(), None),
            ]
        );

        states.reset("games").await.unwrap();
        assert_eq!(states.get("games").await.unwrap(), None);
        assert_eq!(states.list().await.unwrap().len(), 2);
    }
}
