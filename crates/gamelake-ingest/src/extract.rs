//! Paginated extraction from the upstream API
//!
//! One generic [`Extractor`] serves every entity; per-entity behaviour comes
//! from [`EntityQuery`]. Records flow to the consumer through a bounded
//! channel fed by a spawned producer, so a slow writer throttles fetching.
//!
//! Two paging strategies are supported:
//!
//! - **Sequential**: one page at a time, stopping at the first empty page.
//! - **Concurrent**: waves of `wave_size` pages fetched together, each page
//!   retried on its own. A wave is yielded in offset order once every page
//!   has settled; any failure discards the whole wave and surfaces a
//!   [`WaveError`] carrying all page errors.

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::AuthProvider;
use crate::config::{UpstreamConfig, DEFAULT_CHANNEL_CAPACITY};
use crate::entity::{EntityQuery, ExtractionMode};
use crate::error::{ExtractError, PageFailure, WaveError};
use crate::rate_limit::RateLimiter;
use crate::retry::{retry, RetryPolicy};

/// One upstream record, kept as-is
pub type Record = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Sequential,
    Concurrent,
}

/// The fully resolved query for one extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    pub query: String,
    pub mode: ExtractionMode,
    /// Lower bound of the `updated_at` filter, when incremental
    pub since: Option<i64>,
}

pub struct Extractor {
    client: reqwest::Client,
    auth: Arc<dyn AuthProvider>,
    limiter: Arc<RateLimiter>,
    base_url: String,
    client_id: String,
    wave_size: usize,
    page_retry: RetryPolicy,
    safety_margin: TimeDelta,
    channel_capacity: usize,
}

impl Extractor {
    pub fn new(
        config: &UpstreamConfig,
        auth: Arc<dyn AuthProvider>,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self, ExtractError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(ExtractError::Client)?;

        Ok(Self {
            client,
            auth,
            limiter,
            base_url: config.base_url.clone(),
            client_id: config.client_id.clone(),
            wave_size: config.wave_size.max(1),
            page_retry: config.page_retry,
            safety_margin: TimeDelta::minutes(config.safety_margin_minutes),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        })
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Unix seconds used in the incremental filter: `floor(cursor - margin)`
    pub fn incremental_since(&self, cursor: DateTime<Utc>) -> i64 {
        (cursor - self.safety_margin).timestamp()
    }

    /// Resolve the query text and mode for an entity and optional cursor
    pub fn plan(&self, entity: &dyn EntityQuery, cursor: Option<DateTime<Utc>>) -> QueryPlan {
        match cursor {
            Some(cursor) if entity.is_time_series() => {
                warn!(
                    entity = entity.name(),
                    cursor = %cursor.to_rfc3339(),
                    "Time-series entity ignores the checkpoint; running a full extraction"
                );
                QueryPlan {
                    query: entity.base_query(),
                    mode: ExtractionMode::Full,
                    since: None,
                }
            }
            Some(cursor) => {
                let since = self.incremental_since(cursor);
                info!(
                    entity = entity.name(),
                    cursor = %cursor.to_rfc3339(),
                    margin_minutes = self.safety_margin.num_minutes(),
                    since,
                    "Incremental extraction"
                );
                QueryPlan {
                    query: entity.incremental_query(since),
                    mode: ExtractionMode::Incremental,
                    since: Some(since),
                }
            }
            None => {
                info!(entity = entity.name(), "Full extraction");
                QueryPlan {
                    query: entity.base_query(),
                    mode: ExtractionMode::Full,
                    since: None,
                }
            }
        }
    }

    /// Start extracting in the background and return the record stream
    pub fn extract(
        self: &Arc<Self>,
        entity: Arc<dyn EntityQuery>,
        cursor: Option<DateTime<Utc>>,
        fetch_mode: FetchMode,
    ) -> RecordStream {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let extractor = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let plan = extractor.plan(entity.as_ref(), cursor);
            let outcome = match fetch_mode {
                FetchMode::Sequential => {
                    extractor
                        .produce_sequential(entity.as_ref(), &plan, &tx)
                        .await
                }
                FetchMode::Concurrent => {
                    extractor
                        .produce_concurrent(entity.as_ref(), &plan, &tx)
                        .await
                }
            };

            match outcome {
                Ok(total) => info!(
                    entity = entity.name(),
                    records = total,
                    mode = %plan.mode,
                    "Extraction finished"
                ),
                Err(e) => {
                    warn!(entity = entity.name(), error = %e, "Extraction failed");
                    // Receiver may already be gone; nothing left to report to then
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        RecordStream {
            rx,
            handle: Some(handle),
        }
    }

    async fn produce_sequential(
        &self,
        entity: &dyn EntityQuery,
        plan: &QueryPlan,
        tx: &mpsc::Sender<Result<Record, ExtractError>>,
    ) -> Result<u64, ExtractError> {
        let token = self.auth.get_valid_token().await?;
        let url = entity.api_url(&self.base_url);
        let page_size = entity.page_size();
        let mut offset = 0;
        let mut total = 0;

        loop {
            let page = self
                .fetch_page(&url, &plan.query, page_size, offset, &token)
                .await?;
            if page.is_empty() {
                return Ok(total);
            }
            for record in page {
                if tx.send(Ok(record)).await.is_err() {
                    debug!(entity = entity.name(), "Consumer dropped, stopping extraction");
                    return Ok(total);
                }
                total += 1;
            }
            offset += page_size;
        }
    }

    async fn produce_concurrent(
        &self,
        entity: &dyn EntityQuery,
        plan: &QueryPlan,
        tx: &mpsc::Sender<Result<Record, ExtractError>>,
    ) -> Result<u64, ExtractError> {
        let token = self.auth.get_valid_token().await?;
        let url = entity.api_url(&self.base_url);
        let page_size = entity.page_size();
        let mut wave_start = 0;
        let mut total = 0;

        loop {
            let pages = self
                .fetch_wave(&url, &plan.query, page_size, wave_start, &token)
                .await?;
            debug!(entity = entity.name(), wave_start, "Wave completed");

            let exhausted = pages.iter().any(|(_, page)| page.is_empty());
            for (_, page) in pages {
                for record in page {
                    if tx.send(Ok(record)).await.is_err() {
                        debug!(entity = entity.name(), "Consumer dropped, stopping extraction");
                        return Ok(total);
                    }
                    total += 1;
                }
            }

            if exhausted {
                return Ok(total);
            }
            wave_start += self.wave_size as u64 * page_size;
        }
    }

    /// Fetch one wave; pages come back sorted by offset
    async fn fetch_wave(
        &self,
        url: &str,
        query: &str,
        page_size: u64,
        wave_start: u64,
        token: &str,
    ) -> Result<Vec<(u64, Vec<Record>)>, ExtractError> {
        let requests = (0..self.wave_size as u64).map(|i| {
            let offset = wave_start + i * page_size;
            async move {
                let page = self
                    .fetch_page_with_retry(url, query, page_size, offset, token)
                    .await;
                (offset, page)
            }
        });

        let mut pages = Vec::with_capacity(self.wave_size);
        let mut failures = Vec::new();
        for (offset, result) in join_all(requests).await {
            match result {
                Ok(page) => pages.push((offset, page)),
                Err(error) => failures.push(PageFailure { offset, error }),
            }
        }

        if !failures.is_empty() {
            return Err(WaveError {
                start_offset: wave_start,
                pages: self.wave_size,
                failures,
            }
            .into());
        }

        pages.sort_by_key(|(offset, _)| *offset);
        Ok(pages)
    }

    async fn fetch_page_with_retry(
        &self,
        url: &str,
        query: &str,
        page_size: u64,
        offset: u64,
        token: &str,
    ) -> Result<Vec<Record>, ExtractError> {
        let what = format!("Page fetch at offset {offset}");
        retry(&self.page_retry, &what, ExtractError::is_retryable, |_| {
            self.fetch_page(url, query, page_size, offset, token)
        })
        .await
    }

    async fn fetch_page(
        &self,
        url: &str,
        query: &str,
        page_size: u64,
        offset: u64,
        token: &str,
    ) -> Result<Vec<Record>, ExtractError> {
        let _permit = self.limiter.acquire().await?;
        let body = format!("{query} limit {page_size}; offset {offset};");
        debug!(url, body = %body, "Upstream request");

        let response = self
            .client
            .post(url)
            .header("Client-ID", &self.client_id)
            .bearer_auth(token)
            .body(body)
            .send()
            .await
            .map_err(|source| ExtractError::Transport { offset, source })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractError::Status {
                status: status.as_u16(),
                offset,
                body,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| ExtractError::Transport { offset, source })?;
        serde_json::from_slice(&bytes).map_err(|source| ExtractError::Decode { offset, source })
    }
}

/// Pull side of an extraction
///
/// Yields records in id order, then at most one error. A producer that dies
/// without reporting is surfaced as [`ExtractError::Aborted`].
pub struct RecordStream {
    rx: mpsc::Receiver<Result<Record, ExtractError>>,
    handle: Option<JoinHandle<()>>,
}

impl RecordStream {
    /// A finished stream over records already in memory
    pub fn from_records(records: Vec<Record>) -> Self {
        let (tx, rx) = mpsc::channel(records.len().max(1));
        for record in records {
            // Capacity covers every record, so this cannot fill up
            let _ = tx.try_send(Ok(record));
        }
        Self { rx, handle: None }
    }

    pub async fn next(&mut self) -> Option<Result<Record, ExtractError>> {
        if let Some(item) = self.rx.recv().await {
            return Some(item);
        }
        let handle = self.handle.take()?;
        match handle.await {
            Ok(()) => None,
            Err(e) => Some(Err(ExtractError::Aborted(e.to_string()))),
        }
    }

    /// Drain the stream into memory, stopping at the first error
    pub async fn collect(mut self) -> Result<Vec<Record>, ExtractError> {
        let mut records = Vec::new();
        while let Some(item) = self.next().await {
            records.push(item?);
        }
        Ok(records)
    }
}

impl Drop for RecordStream {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::StaticAuthProvider;
    use crate::entity::{find, default_catalogue};

    fn extractor(margin_minutes: i64) -> Extractor {
        let mut config = UpstreamConfig::new("http://localhost:1", "client", "token");
        config.safety_margin_minutes = margin_minutes;
        Extractor::new(
            &config,
            Arc::new(StaticAuthProvider::new("token")),
            Arc::new(RateLimiter::unlimited()),
        )
        .unwrap()
    }

    #[test]
    fn test_incremental_since_floors_after_margin() {
        let cursor = DateTime::parse_from_rfc3339("2025-01-15T10:00:00.750Z")
            .unwrap()
            .with_timezone(&Utc);
        let expected = DateTime::parse_from_rfc3339("2025-01-15T09:55:00Z")
            .unwrap()
            .timestamp();
        assert_eq!(extractor(5).incremental_since(cursor), expected);
    }

    #[test]
    fn test_plan_incremental_for_fact_entity() {
        let games = find(&default_catalogue(), "games").unwrap();
        let cursor = DateTime::from_timestamp(1_736_935_200, 0).unwrap();

        let plan = extractor(5).plan(&games, Some(cursor));
        assert_eq!(plan.mode, ExtractionMode::Incremental);
        assert_eq!(plan.since, Some(1_736_935_200 - 300));
        assert!(plan.query.contains("where updated_at > 1736934900;"));
        assert!(plan.query.contains("sort id asc"));
    }

    #[test]
    fn test_plan_ignores_cursor_for_time_series() {
        let popscore = find(&default_catalogue(), "popscore").unwrap();
        let cursor = DateTime::from_timestamp(1_736_935_200, 0).unwrap();

        let plan = extractor(5).plan(&popscore, Some(cursor));
        assert_eq!(plan.mode, ExtractionMode::Full);
        assert_eq!(plan.since, None);
        assert!(!plan.query.contains("updated_at"));
    }

    #[test]
    fn test_plan_without_cursor_is_full() {
        let genres = find(&default_catalogue(), "genres").unwrap();
        let plan = extractor(5).plan(&genres, None);
        assert_eq!(plan.mode, ExtractionMode::Full);
        assert_eq!(plan.query, "fields *; sort id asc;");
    }
}
