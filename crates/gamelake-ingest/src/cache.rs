//! Edge cache invalidation for published manifests

use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_cloudfront::{
    error::DisplayErrorContext,
    types::{InvalidationBatch, Paths},
    Client,
};
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Invalid invalidation request: {0}")]
    Build(String),

    #[error("Invalidation request failed: {0}")]
    Request(String),
}

#[async_trait]
pub trait EdgeCache: Send + Sync {
    async fn invalidate(&self, paths: &[String]) -> Result<(), CacheError>;
}

pub struct CloudFrontCache {
    client: Client,
    distribution_id: String,
}

impl CloudFrontCache {
    pub fn new(sdk_config: &SdkConfig, distribution_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(sdk_config),
            distribution_id: distribution_id.into(),
        }
    }
}

#[async_trait]
impl EdgeCache for CloudFrontCache {
    #[instrument(skip(self, paths), fields(distribution = %self.distribution_id, count = paths.len()))]
    async fn invalidate(&self, paths: &[String]) -> Result<(), CacheError> {
        if paths.is_empty() {
            return Ok(());
        }

        let quantity =
            i32::try_from(paths.len()).map_err(|e| CacheError::Build(e.to_string()))?;
        let paths_value = Paths::builder()
            .quantity(quantity)
            .set_items(Some(paths.to_vec()))
            .build()
            .map_err(|e| CacheError::Build(e.to_string()))?;
        let batch = InvalidationBatch::builder()
            .paths(paths_value)
            .caller_reference(Uuid::new_v4().to_string())
            .build()
            .map_err(|e| CacheError::Build(e.to_string()))?;

        self.client
            .create_invalidation()
            .distribution_id(&self.distribution_id)
            .invalidation_batch(batch)
            .send()
            .await
            .map_err(|e| CacheError::Request(DisplayErrorContext(&e).to_string()))?;

        info!("Edge cache invalidation requested");
        Ok(())
    }
}

/// Used when no distribution is configured
pub struct NoopEdgeCache;

#[async_trait]
impl EdgeCache for NoopEdgeCache {
    async fn invalidate(&self, paths: &[String]) -> Result<(), CacheError> {
        warn!(
            count = paths.len(),
            "No CloudFront distribution configured, skipping cache invalidation"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_cache_accepts_anything() {
        let paths = vec!["/raw/games/dt=2025-01-15/_manifest.json".to_string()];
        NoopEdgeCache.invalidate(&paths).await.unwrap();
        NoopEdgeCache.invalidate(&[]).await.unwrap();
    }
}
