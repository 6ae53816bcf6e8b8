//! Gamelake Ingest Library
//!
//! Incremental ingestion of the IGDB API into a date-partitioned S3 data
//! lake.
//!
//! # Components
//!
//! - **Rate limiting**: concurrency slots plus a token bucket ([`rate_limit`])
//! - **Extraction**: sequential or wave-based concurrent paging ([`extract`])
//! - **Batching**: fixed-size JSONL files tagged `temp` ([`batch`])
//! - **Manifests**: per-partition file ledger ([`manifest`])
//! - **Publishing**: tag-flip and temp-and-swap ([`publish`])
//! - **Checkpoints**: per-entity last run time ([`state`])
//! - **Orchestration**: fixed entity order, mode selection, reporting
//!   ([`orchestrator`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gamelake_common::types::PartitionDate;
//! use gamelake_ingest::{
//!     auth::StaticAuthProvider, cache::NoopEdgeCache, config::PipelineConfig,
//!     extract::Extractor, orchestrator::{Orchestrator, RunOptions},
//!     rate_limit::RateLimiter, storage::S3BlobStore,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::from_env()?;
//!     let limiter = Arc::new(RateLimiter::new(config.upstream.rate_limit)?);
//!     let auth = Arc::new(StaticAuthProvider::new(config.upstream.static_token.clone()));
//!     let extractor = Arc::new(Extractor::new(&config.upstream, auth, limiter)?);
//!     let store = Arc::new(S3BlobStore::new(&config.storage).await);
//!
//!     let orchestrator = Orchestrator::new(&config, extractor, store, Arc::new(NoopEdgeCache));
//!     let report = orchestrator.run(&RunOptions::new(PartitionDate::today())).await?;
//!     report.log_summary();
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod auth;
pub mod batch;
pub mod cache;
pub mod config;
pub mod entity;
pub mod error;
pub mod extract;
pub mod manifest;
pub mod orchestrator;
pub mod publish;
pub mod rate_limit;
pub mod retry;
pub mod state;
pub mod storage;

pub use error::{ExtractError, PipelineError, PublishError, WaveError};
