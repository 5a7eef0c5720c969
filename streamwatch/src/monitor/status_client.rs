//! Batched status queries with retry.
//!
//! [`StatusClient::get_statuses`] splits the entity set into batches no larger
//! than the API allows, runs them concurrently, and retries each failing batch
//! on its own. A batch that exhausts its attempts is reported in
//! [`StatusReport::failures`] and its entities are absent from the statuses:
//! they are unknown this cycle, not offline.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};

use super::api::{StatusApi, StatusApiError, StreamRecord};
use super::rate_limiter::RateLimiter;
use super::status::{StatusMap, StreamStatus};
use crate::config::MonitorConfig;
use crate::registry::EntityId;

/// Batching and retry settings.
#[derive(Debug, Clone)]
pub struct StatusClientConfig {
    pub batch_size: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_concurrent_batches: usize,
}

impl From<&MonitorConfig> for StatusClientConfig {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base,
            backoff_cap: config.backoff_cap,
            max_concurrent_batches: config.max_concurrent_batches,
        }
    }
}

impl Default for StatusClientConfig {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

/// A batch that failed after exhausting its attempts.
#[derive(Debug, Error)]
#[error("batch of {} entities failed after {attempts} attempt(s): {error}", .entities.len())]
pub struct BatchQueryError {
    pub entities: Vec<EntityId>,
    pub attempts: u32,
    #[source]
    pub error: StatusApiError,
}

/// Result of one `get_statuses` call.
#[derive(Debug, Default)]
pub struct StatusReport {
    pub statuses: StatusMap,
    pub failures: Vec<BatchQueryError>,
    /// Number of batches issued.
    pub batches: usize,
}

impl StatusReport {
    pub fn success_count(&self) -> usize {
        self.statuses.len()
    }

    /// Number of entities whose status is unknown this cycle.
    pub fn failure_count(&self) -> usize {
        self.failures.iter().map(|f| f.entities.len()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether any batch failed for lack of a usable access token: none could
    /// be obtained, or the API kept rejecting fresh ones.
    pub fn credential_failure(&self) -> bool {
        self.failures.iter().any(|f| {
            matches!(
                f.error,
                StatusApiError::Credential(_) | StatusApiError::Unauthorized
            )
        })
    }
}

/// Normalizing, batching front of a [`StatusApi`].
pub struct StatusClient {
    api: Arc<dyn StatusApi>,
    config: StatusClientConfig,
    rate_limiter: Option<RateLimiter>,
}

impl StatusClient {
    pub fn new(api: Arc<dyn StatusApi>, config: StatusClientConfig) -> Self {
        Self {
            api,
            config,
            rate_limiter: None,
        }
    }

    /// Take a token from `limiter` before every request.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Query the status of every entity in `ids`.
    pub async fn get_statuses(&self, ids: &BTreeSet<EntityId>) -> StatusReport {
        if ids.is_empty() {
            return StatusReport::default();
        }

        let ids: Vec<EntityId> = ids.iter().cloned().collect();
        let chunks: Vec<Vec<EntityId>> = ids
            .chunks(self.config.batch_size.max(1))
            .map(<[EntityId]>::to_vec)
            .collect();
        let batches = chunks.len();

        debug!(entities = ids.len(), batches, "Querying stream status");

        let results: Vec<_> = stream::iter(chunks)
            .map(|chunk| async move {
                let result = self.query_batch(&chunk).await;
                (chunk, result)
            })
            .buffer_unordered(self.config.max_concurrent_batches.max(1))
            .collect()
            .await;

        let mut report = StatusReport {
            batches,
            ..Default::default()
        };

        for (chunk, result) in results {
            match result {
                Ok(records) => merge_batch(&mut report.statuses, &chunk, records),
                Err(failure) => {
                    warn!(
                        entities = failure.entities.len(),
                        attempts = failure.attempts,
                        error = %failure.error,
                        "Status batch failed"
                    );
                    report.failures.push(failure);
                }
            }
        }

        debug!(
            success = report.success_count(),
            failed = report.failure_count(),
            "Status query complete"
        );

        report
    }

    async fn query_batch(&self, chunk: &[EntityId]) -> Result<Vec<StreamRecord>, BatchQueryError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            if let Some(limiter) = &self.rate_limiter {
                let waited = limiter.acquire().await;
                if !waited.is_zero() {
                    debug!(wait = ?waited, "Waited for request budget");
                }
            }

            let error = match self.api.fetch_batch(chunk).await {
                Ok(records) => return Ok(records),
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                return Err(BatchQueryError {
                    entities: chunk.to_vec(),
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.retry_delay(&error, attempt - 1);

            warn!(
                error = %error,
                delay = ?delay,
                "Status batch failed, retrying (attempt {}/{})",
                attempt + 1,
                max_attempts
            );

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Delay before retry number `retry` (zero-based) after `error`.
    ///
    /// A server hint wins over backoff but never exceeds `backoff_cap`.
    fn retry_delay(&self, error: &StatusApiError, retry: u32) -> Duration {
        match (error, error.retry_hint()) {
            // The rejected token is already invalidated; retry with a new one now.
            (StatusApiError::Unauthorized, _) => Duration::ZERO,
            (_, Some(hint)) => hint.min(self.config.backoff_cap),
            (_, None) => backoff_delay(self.config.backoff_base, self.config.backoff_cap, retry),
        }
    }
}

/// Record a status for every entity of a successful batch.
fn merge_batch(statuses: &mut StatusMap, chunk: &[EntityId], records: Vec<StreamRecord>) {
    let mut by_entity: HashMap<EntityId, StreamRecord> = records
        .into_iter()
        .map(|record| (record.entity_id(), record))
        .collect();

    for id in chunk {
        let status = by_entity
            .remove(id)
            .map(StreamRecord::into_status)
            .unwrap_or(StreamStatus::Offline);
        statuses.insert(id.clone(), status);
    }
}

/// Exponential backoff with ±25% jitter, never above `cap`.
pub fn backoff_delay(base: Duration, cap: Duration, retry: u32) -> Duration {
    let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let exponential = base_ms
        .saturating_mul(2u64.saturating_pow(retry))
        .min(cap_ms);

    let jitter_range = exponential / 4;
    let jitter: i64 = if jitter_range > 0 {
        let random_val = rand::random::<u64>() % jitter_range.saturating_mul(2).max(1);
        random_val as i64 - jitter_range as i64
    } else {
        0
    };

    Duration::from_millis(exponential.saturating_add_signed(jitter).min(cap_ms))
}
