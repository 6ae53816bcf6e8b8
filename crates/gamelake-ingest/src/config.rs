//! Configuration management
//!
//! One [`PipelineConfig`] is built at startup from the environment (and an
//! optional `.env`), validated, and passed by reference from there on.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::rate_limit::{RateLimitConfig, DEFAULT_MAX_CONCURRENCY, DEFAULT_REQUESTS_PER_SECOND};
use crate::retry::RetryPolicy;
use crate::storage::StorageConfig;

// ============================================================================
// Upstream Configuration Constants
// ============================================================================

/// Default IGDB API root; entity endpoints are appended to it.
pub const DEFAULT_BASE_URL: &str = "https://api.igdb.com/v4";

/// Default records requested per page.
pub const DEFAULT_PAGE_SIZE: u64 = 500;

/// Default number of pages fetched in parallel per wave.
pub const DEFAULT_WAVE_SIZE: usize = 8;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default margin subtracted from the checkpoint for incremental filters.
pub const DEFAULT_SAFETY_MARGIN_MINUTES: i64 = 5;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default records per batch file.
pub const DEFAULT_BATCH_SIZE: usize = 50_000;

/// Default key prefix for checkpoint documents.
pub const DEFAULT_STATE_PREFIX: &str = "pipeline/state/";

/// Default capacity of the extractor-to-writer channel, in records.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_000;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineSettings,
    pub cdn: CdnConfig,
}

#[derive(Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub client_id: String,
    pub static_token: String,
    pub rate_limit: RateLimitConfig,
    pub page_size: u64,
    pub wave_size: usize,
    pub page_retry: RetryPolicy,
    pub request_timeout_secs: u64,
    pub safety_margin_minutes: i64,
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("client_id", &self.client_id)
            .field("static_token", &"<redacted>")
            .field("rate_limit", &self.rate_limit)
            .field("page_size", &self.page_size)
            .field("wave_size", &self.wave_size)
            .field("page_retry", &self.page_retry)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("safety_margin_minutes", &self.safety_margin_minutes)
            .finish()
    }
}

impl UpstreamConfig {
    /// Defaults for everything except the endpoint and credentials
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        static_token: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: client_id.into(),
            static_token: static_token.into(),
            rate_limit: RateLimitConfig::default(),
            page_size: DEFAULT_PAGE_SIZE,
            wave_size: DEFAULT_WAVE_SIZE,
            page_retry: RetryPolicy::upstream_page(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            safety_margin_minutes: DEFAULT_SAFETY_MARGIN_MINUTES,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub state_prefix: String,
    pub swap_retry: RetryPolicy,
    pub channel_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            state_prefix: DEFAULT_STATE_PREFIX.to_string(),
            swap_retry: RetryPolicy::swap_copy(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CdnConfig {
    pub distribution_id: Option<String>,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let default_retry = RetryPolicy::upstream_page();
        let page_retry = RetryPolicy {
            max_attempts: env_or("IGDB_PAGE_MAX_ATTEMPTS", default_retry.max_attempts),
            ..default_retry
        };

        let config = PipelineConfig {
            upstream: UpstreamConfig {
                base_url: std::env::var("IGDB_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
                client_id: std::env::var("IGDB_CLIENT_ID").unwrap_or_default(),
                static_token: std::env::var("IGDB_STATIC_TOKEN").unwrap_or_default(),
                rate_limit: RateLimitConfig {
                    requests_per_second: env_or(
                        "IGDB_REQUESTS_PER_SECOND",
                        DEFAULT_REQUESTS_PER_SECOND,
                    ),
                    max_concurrency: env_or("IGDB_MAX_CONCURRENCY", DEFAULT_MAX_CONCURRENCY),
                },
                page_size: env_or("IGDB_PAGE_SIZE", DEFAULT_PAGE_SIZE),
                wave_size: env_or("IGDB_WAVE_SIZE", DEFAULT_WAVE_SIZE),
                page_retry,
                request_timeout_secs: env_or("IGDB_REQUEST_TIMEOUT", DEFAULT_REQUEST_TIMEOUT_SECS),
                safety_margin_minutes: env_or(
                    "INCREMENTAL_SAFETY_MARGIN_MINUTES",
                    DEFAULT_SAFETY_MARGIN_MINUTES,
                ),
            },
            storage: StorageConfig::from_env(),
            pipeline: PipelineSettings {
                batch_size: env_or("BATCH_SIZE", DEFAULT_BATCH_SIZE),
                state_prefix: std::env::var("STATE_PREFIX")
                    .unwrap_or_else(|_| DEFAULT_STATE_PREFIX.to_string()),
                swap_retry: RetryPolicy::swap_copy(),
                channel_capacity: env_or("EXTRACT_CHANNEL_CAPACITY", DEFAULT_CHANNEL_CAPACITY),
            },
            cdn: CdnConfig {
                distribution_id: std::env::var("CLOUDFRONT_DISTRIBUTION_ID")
                    .ok()
                    .filter(|id| !id.trim().is_empty()),
            },
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let upstream = &self.upstream;
        if upstream.client_id.trim().is_empty() {
            anyhow::bail!("IGDB_CLIENT_ID must be set");
        }
        if upstream.static_token.trim().is_empty() {
            anyhow::bail!("IGDB_STATIC_TOKEN must be set");
        }
        if upstream.page_size == 0 {
            anyhow::bail!("Page size must be greater than 0");
        }
        if upstream.wave_size == 0 {
            anyhow::bail!("Wave size must be greater than 0");
        }
        if upstream.rate_limit.max_concurrency == 0 {
            anyhow::bail!("Max concurrency must be greater than 0");
        }
        let rps = upstream.rate_limit.requests_per_second;
        if !(rps.is_finite() && rps > 0.0) {
            anyhow::bail!("Requests per second must be positive, got {rps}");
        }
        if upstream.page_retry.max_attempts == 0 {
            anyhow::bail!("Page retry attempts must be greater than 0");
        }
        if upstream.safety_margin_minutes < 0 {
            anyhow::bail!("Safety margin cannot be negative");
        }
        if self.pipeline.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }
        if self.pipeline.channel_capacity == 0 {
            anyhow::bail!("Extract channel capacity must be greater than 0");
        }
        if self.storage.bucket.trim().is_empty() {
            anyhow::bail!("S3_BUCKET_NAME must be set");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn valid() -> PipelineConfig {
        PipelineConfig {
            upstream: UpstreamConfig::new(DEFAULT_BASE_URL, "client", "token"),
            storage: StorageConfig::for_aws("ap-northeast-2", "lake"),
            pipeline: PipelineSettings::default(),
            cdn: CdnConfig::default(),
        }
    }

    #[test]
    fn test_defaults_validate() {
        let config = valid();
        config.validate().unwrap();
        assert_eq!(config.upstream.page_size, 500);
        assert_eq!(config.upstream.wave_size, 8);
        assert_eq!(config.pipeline.batch_size, 50_000);
        assert_eq!(config.pipeline.state_prefix, "pipeline/state/");
        assert_eq!(config.upstream.rate_limit.max_concurrency, 4);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = valid();
        config.pipeline.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.upstream.page_size = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.upstream.rate_limit.requests_per_second = 0.0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.storage.bucket = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", valid().upstream);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("\"token\""));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        std::env::set_var("IGDB_CLIENT_ID", "abc");
        std::env::set_var("IGDB_STATIC_TOKEN", "secret");
        std::env::set_var("S3_BUCKET_NAME", "gamelake-raw");
        std::env::set_var("BATCH_SIZE", "1000");
        std::env::set_var("IGDB_WAVE_SIZE", "16");
        std::env::set_var("CLOUDFRONT_DISTRIBUTION_ID", "E123");

        let config = PipelineConfig::from_env().unwrap();
        assert_eq!(config.upstream.client_id, "abc");
        assert_eq!(config.storage.bucket, "gamelake-raw");
        assert_eq!(config.pipeline.batch_size, 1000);
        assert_eq!(config.upstream.wave_size, 16);
        assert_eq!(config.cdn.distribution_id.as_deref(), Some("E123"));

        for key in [
            "IGDB_CLIENT_ID",
            "IGDB_STATIC_TOKEN",
            "S3_BUCKET_NAME",
            "BATCH_SIZE",
            "IGDB_WAVE_SIZE",
            "CLOUDFRONT_DISTRIBUTION_ID",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_requires_credentials() {
        std::env::remove_var("IGDB_CLIENT_ID");
        std::env::set_var("S3_BUCKET_NAME", "gamelake-raw");

        let err = PipelineConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("IGDB_CLIENT_ID"));

        std::env::remove_var("S3_BUCKET_NAME");
    }
}
