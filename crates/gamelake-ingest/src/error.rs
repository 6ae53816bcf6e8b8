//! Error types for the ingestion pipeline

use thiserror::Error;

use crate::storage::StorageError;

/// Failures while pulling pages from the upstream API
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Upstream request failed at offset {offset}: {source}")]
    Transport {
        offset: u64,
        #[source]
        source: reqwest::Error,
    },

    #[error("Upstream returned HTTP {status} at offset {offset}: {body}")]
    Status { status: u16, offset: u64, body: String },

    #[error("Undecodable page at offset {offset}: {source}")]
    Decode {
        offset: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("HTTP client setup failed: {0}")]
    Client(#[source] reqwest::Error),

    #[error(transparent)]
    Wave(#[from] WaveError),

    #[error("Rate limiter closed")]
    LimiterClosed(#[from] tokio::sync::AcquireError),

    #[error("Extraction task aborted: {0}")]
    Aborted(String),
}

impl ExtractError {
    /// Transport failures and any HTTP error status are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExtractError::Transport { .. } | ExtractError::Status { .. }
        )
    }
}

/// Every page failure of one concurrent wave
///
/// A failed wave is never partially committed, so all of its errors travel
/// together.
#[derive(Debug, Error)]
#[error("{} of {pages} pages failed in wave starting at offset {start_offset}", .failures.len())]
pub struct WaveError {
    pub start_offset: u64,
    pub pages: usize,
    pub failures: Vec<PageFailure>,
}

#[derive(Debug)]
pub struct PageFailure {
    pub offset: u64,
    pub error: ExtractError,
}

/// Failures while making a run's files visible
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Staged object '{key}' still not visible after {attempts} attempts")]
    EventualConsistency { key: String, attempts: u32 },

    #[error("Object '{key}' is not under staging prefix '{staging}'")]
    OutsideStaging { key: String, staging: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Why one entity's run failed
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Batch write failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Publish failed: {0}")]
    Publish(#[from] PublishError),

    #[error("State store failed for '{entity}': {source}")]
    State {
        entity: String,
        #[source]
        source: StorageError,
    },

    #[error("Manifest update failed for '{key}': {source}")]
    Manifest {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_errors_are_retryable() {
        let err = ExtractError::Status {
            status: 429,
            offset: 500,
            body: String::new(),
        };
        assert!(err.is_retryable());
        assert!(!ExtractError::Auth("expired".into()).is_retryable());
    }

    #[test]
    fn test_wave_error_message_counts_failures() {
        let wave = WaveError {
            start_offset: 1000,
            pages: 4,
            failures: vec![
                PageFailure {
                    offset: 1000,
                    error: ExtractError::Auth("a".into()),
                },
                PageFailure {
                    offset: 1500,
                    error: ExtractError::Auth("b".into()),
                },
            ],
        };
        assert_eq!(
            wave.to_string(),
            "2 of 4 pages failed in wave starting at offset 1000"
        );
        assert!(!ExtractError::from(wave).is_retryable());
    }
}
