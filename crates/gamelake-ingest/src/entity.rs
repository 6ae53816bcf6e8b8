//! Entity catalogue, query shapes and storage paths
//!
//! Each ingested dataset is described by a static [`EntitySpec`]. The
//! extractor only sees it through [`EntityQuery`]; the orchestrator uses
//! the path helpers to decide where a run writes.

use gamelake_common::types::PartitionDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::DEFAULT_PAGE_SIZE;

pub const MANIFEST_FILE: &str = "_manifest.json";
pub const TEMP_DIR_PREFIX: &str = "_temp_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Small lookup table, kept under `raw/dimensions/` without a date
    Dimension,
    /// Appended per partition with unique file names
    Fact,
    /// Point-in-time snapshot, replaced wholesale per partition
    TimeSeries,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMode {
    Full,
    Incremental,
}

impl ExtractionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMode::Full => "full",
            ExtractionMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the extractor needs to know about an entity
pub trait EntityQuery: Send + Sync {
    fn name(&self) -> &str;

    fn api_url(&self, base_url: &str) -> String;

    /// Full extraction query, without paging clauses
    fn base_query(&self) -> String;

    /// Query for records updated strictly after `since` (unix seconds)
    fn incremental_query(&self, since: i64) -> String;

    fn page_size(&self) -> u64;

    /// Snapshots are always fully re-extracted
    fn is_time_series(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySpec {
    pub name: &'static str,
    /// Path segment under the API root
    pub endpoint: &'static str,
    pub kind: EntityKind,
    pub fields: &'static str,
    /// Extra `where` condition applied to every query
    pub filter: Option<&'static str>,
    pub page_size: u64,
    /// Index in the fixed execution order
    pub position: usize,
}

impl EntitySpec {
    pub fn is_incremental_capable(&self) -> bool {
        self.kind != EntityKind::TimeSeries
    }

    /// Directory that receives this run's batch files (no trailing slash)
    pub fn partition_prefix(&self, partition: &PartitionDate) -> String {
        match self.kind {
            EntityKind::Dimension => format!("raw/dimensions/{}", self.name),
            EntityKind::Fact | EntityKind::TimeSeries => {
                format!("raw/{}/dt={}", self.name, partition)
            }
        }
    }

    pub fn manifest_key(&self, partition: &PartitionDate) -> String {
        format!("{}/{}", self.partition_prefix(partition), MANIFEST_FILE)
    }

    /// Run-scoped staging directory for the swap protocol
    pub fn staging_prefix(&self, partition: &PartitionDate, run_id: &str) -> String {
        format!(
            "{}/{}{}",
            self.partition_prefix(partition),
            TEMP_DIR_PREFIX,
            run_id
        )
    }

    /// Everything this entity has ever published, across partitions
    pub fn entity_root(&self) -> String {
        match self.kind {
            EntityKind::Dimension => format!("raw/dimensions/{}/", self.name),
            EntityKind::Fact | EntityKind::TimeSeries => format!("raw/{}/", self.name),
        }
    }

    /// Edge-cache path of the manifest readers poll
    pub fn cache_path(&self, partition: &PartitionDate) -> String {
        format!("/{}", self.manifest_key(partition))
    }
}

impl EntityQuery for EntitySpec {
    fn name(&self) -> &str {
        self.name
    }

    fn api_url(&self, base_url: &str) -> String {
        format!("{}/{}", base_url.trim_end_matches('/'), self.endpoint)
    }

    fn base_query(&self) -> String {
        match self.filter {
            Some(filter) => format!("fields {}; where {}; sort id asc;", self.fields, filter),
            None => format!("fields {}; sort id asc;", self.fields),
        }
    }

    fn incremental_query(&self, since: i64) -> String {
        match self.filter {
            Some(filter) => format!(
                "fields {}; where {} & updated_at > {}; sort id asc;",
                self.fields, filter, since
            ),
            None => format!(
                "fields {}; where updated_at > {}; sort id asc;",
                self.fields, since
            ),
        }
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn is_time_series(&self) -> bool {
        self.kind == EntityKind::TimeSeries
    }
}

const DIMENSIONS: [&str; 6] = [
    "platforms",
    "genres",
    "game_modes",
    "themes",
    "player_perspectives",
    "popularity_types",
];

const POPSCORE_FILTER: &str = "popularity_type = (1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 34)";

/// Every entity, in execution order: dimensions, then the fact table, then
/// the popularity snapshot.
pub fn catalogue(page_size: u64) -> Vec<EntitySpec> {
    let mut entities: Vec<EntitySpec> = DIMENSIONS
        .iter()
        .map(|&name| EntitySpec {
            name,
            endpoint: name,
            kind: EntityKind::Dimension,
            fields: "*",
            filter: None,
            page_size,
            position: 0,
        })
        .collect();

    entities.push(EntitySpec {
        name: "games",
        endpoint: "games",
        kind: EntityKind::Fact,
        fields: "*",
        filter: None,
        page_size,
        position: 0,
    });

    entities.push(EntitySpec {
        name: "popscore",
        endpoint: "popularity_primitives",
        kind: EntityKind::TimeSeries,
        fields: "game_id, popularity_type, value",
        filter: Some(POPSCORE_FILTER),
        page_size,
        position: 0,
    });

    for (position, entity) in entities.iter_mut().enumerate() {
        entity.position = position;
    }
    entities
}

pub fn default_catalogue() -> Vec<EntitySpec> {
    catalogue(DEFAULT_PAGE_SIZE)
}

/// Look an entity up by name
pub fn find(entities: &[EntitySpec], name: &str) -> Option<EntitySpec> {
    entities.iter().find(|e| e.name == name).cloned()
}
