//! Gamelake Common Library
//!
//! Shared types, utilities, and error handling for the Gamelake workspace.
//!
//! # Overview
//!
//! - **Error Handling**: parsing errors for the shared types
//! - **Logging**: `tracing` subscriber setup driven by environment or a builder
//! - **Types**: partition dates and object lifecycle tags used by the data lake
//!
//! # Example
//!
//! ```no_run
//! use gamelake_common::logging::{init_logging, LogConfig};
//! use gamelake_common::types::PartitionDate;
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!     let partition: PartitionDate = "2025-01-15".parse()?;
//!     tracing::info!(%partition, "Partition selected");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};
