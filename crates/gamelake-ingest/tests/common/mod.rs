//! Shared helpers for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use gamelake_ingest::{
    auth::StaticAuthProvider,
    cache::{CacheError, EdgeCache},
    config::{CdnConfig, PipelineConfig, PipelineSettings, UpstreamConfig},
    extract::Extractor,
    rate_limit::{RateLimitConfig, RateLimiter},
    retry::RetryPolicy,
    storage::StorageConfig,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::{Request, Respond, ResponseTemplate};

pub const CLIENT_ID: &str = "test-client";
pub const TOKEN: &str = "test-token";

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(5))
}

pub fn upstream_config(base_url: &str, page_size: u64, wave_size: usize) -> UpstreamConfig {
    let mut config = UpstreamConfig::new(base_url, CLIENT_ID, TOKEN);
    config.page_size = page_size;
    config.wave_size = wave_size;
    config.page_retry = fast_retry(3);
    config.rate_limit = RateLimitConfig {
        requests_per_second: 1000.0,
        max_concurrency: 8,
    };
    config
}

pub fn pipeline_config(base_url: &str, page_size: u64, batch_size: usize) -> PipelineConfig {
    PipelineConfig {
        upstream: upstream_config(base_url, page_size, 4),
        storage: StorageConfig::for_minio("http://localhost:9000", "test-lake"),
        pipeline: PipelineSettings {
            batch_size,
            swap_retry: fast_retry(5),
            ..PipelineSettings::default()
        },
        cdn: CdnConfig::default(),
    }
}

pub fn extractor(config: &UpstreamConfig) -> Arc<Extractor> {
    let limiter = RateLimiter::new(config.rate_limit).expect("valid limiter");
    Arc::new(
        Extractor::new(
            config,
            Arc::new(StaticAuthProvider::new(TOKEN)),
            Arc::new(limiter),
        )
        .expect("extractor"),
    )
}

pub fn record(id: u64) -> Value {
    json!({ "id": id, "name": format!("record-{id}"), "updated_at": 1_736_900_000 + id })
}

pub fn records(ids: std::ops::RangeInclusive<u64>) -> Vec<Value> {
    ids.map(record).collect()
}

/// `offset N;` from an upstream query body
pub fn offset_of(request: &Request) -> Option<usize> {
    let body = String::from_utf8_lossy(&request.body);
    let start = body.find("offset ")? + "offset ".len();
    let digits: String = body[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Serves `records` in pages according to each request's limit/offset
pub struct PagedResponder {
    pub records: Vec<Value>,
    pub page_size: usize,
}

impl Respond for PagedResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let offset = offset_of(request).unwrap_or(0);
        let page: Vec<Value> = self
            .records
            .iter()
            .skip(offset)
            .take(self.page_size)
            .cloned()
            .collect();
        ResponseTemplate::new(200).set_body_json(page)
    }
}

/// Records every invalidation request
#[derive(Default)]
pub struct RecordingCache {
    pub calls: Mutex<Vec<Vec<String>>>,
    pub fail: bool,
}

impl RecordingCache {
    pub fn failing() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl EdgeCache for RecordingCache {
    async fn invalidate(&self, paths: &[String]) -> Result<(), CacheError> {
        self.calls.lock().expect("lock").push(paths.to_vec());
        if self.fail {
            return Err(CacheError::Request("distribution not found".to_string()));
        }
        Ok(())
    }
}
