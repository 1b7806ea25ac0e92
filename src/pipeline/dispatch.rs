//! Concurrent query dispatch with retry and backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;

use crate::error::{AppError, Result};
use crate::models::{Opportunity, Query, RetryConfig};
use crate::pipeline::recovery::{self, ErrorKind};
use crate::services::{SearchClient, build_params};

/// Outcome of executing a single query.
#[derive(Debug)]
pub struct QueryResult {
    pub query: Query,
    pub records: Vec<Opportunity>,
    pub success: bool,
    pub error: Option<AppError>,
    pub kind: Option<ErrorKind>,
    pub duration: Duration,
    pub retries: u32,
}

impl QueryResult {
    fn failed(query: Query, error: AppError, duration: Duration, retries: u32) -> Self {
        let kind = Some(recovery::classify(&error));
        Self {
            query,
            records: Vec::new(),
            success: false,
            error: Some(error),
            kind,
            duration,
            retries,
        }
    }

    /// Final error message, for reports.
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }
}

/// Runs configured queries concurrently against the search API.
///
/// Concurrency is bounded so upstream rate limits are respected; each query
/// is isolated, retried on transient failures, and bounded by the run
/// deadline including its backoff sleeps.
pub struct QueryDispatcher {
    client: Arc<dyn SearchClient>,
    retry: RetryConfig,
    lookback_days: i64,
    max_concurrent: usize,
    per_call_timeout: Duration,
}

impl QueryDispatcher {
    pub fn new(
        client: Arc<dyn SearchClient>,
        retry: RetryConfig,
        lookback_days: i64,
        max_concurrent: usize,
        per_call_timeout: Duration,
    ) -> Self {
        Self {
            client,
            retry,
            lookback_days,
            max_concurrent: max_concurrent.max(1),
            per_call_timeout,
        }
    }

    /// Execute every query, bounded by the concurrency limit and `deadline`.
    ///
    /// Disabled queries short-circuit into a failed result without occupying
    /// a concurrency slot or touching the network. Results from queries that
    /// finish before the deadline stay usable regardless of later failures.
    pub async fn run_all(&self, queries: &[Query], deadline: Instant) -> Vec<QueryResult> {
        let mut results: Vec<QueryResult> = Vec::with_capacity(queries.len());

        let enabled: Vec<&Query> = queries
            .iter()
            .filter(|query| {
                if !query.enabled {
                    results.push(QueryResult::failed(
                        (*query).clone(),
                        AppError::validation(format!("query '{}' is disabled", query.name)),
                        Duration::ZERO,
                        0,
                    ));
                    return false;
                }
                true
            })
            .collect();

        let mut stream = stream::iter(enabled)
            .map(|query| self.run_one(query, deadline))
            .buffer_unordered(self.max_concurrent);

        while let Some(result) = stream.next().await {
            results.push(result);
        }

        results
    }

    /// Execute one query with retry/backoff, respecting `deadline`.
    pub async fn run_one(&self, query: &Query, deadline: Instant) -> QueryResult {
        let start = Instant::now();
        let params = build_params(query, self.lookback_days);

        let mut retries = 0;
        let mut last_error: AppError;

        loop {
            match self.attempt(&params, deadline).await {
                Ok(response) => {
                    log::debug!(
                        "Query '{}' succeeded: {} records in {:?} ({} retries)",
                        query.name,
                        response.items.len(),
                        start.elapsed(),
                        retries
                    );
                    return QueryResult {
                        query: query.clone(),
                        records: response.items,
                        success: true,
                        error: None,
                        kind: None,
                        duration: start.elapsed(),
                        retries,
                    };
                }
                Err(error) => {
                    let kind = recovery::classify(&error);
                    if !kind.is_transient() {
                        log::debug!(
                            "Query '{}' failed with non-retryable {} error: {}",
                            query.name,
                            kind,
                            error
                        );
                        return QueryResult::failed(query.clone(), error, start.elapsed(), retries);
                    }
                    last_error = error;
                }
            }

            if retries >= self.retry.max_retries {
                break;
            }

            let delay = self.backoff_delay(retries);
            let wake = Instant::now() + delay;
            if wake >= deadline {
                // Sleeping past the deadline would ignore cancellation
                return QueryResult::failed(
                    query.clone(),
                    AppError::timeout(format!(
                        "query '{}' ran out of time during backoff",
                        query.name
                    )),
                    start.elapsed(),
                    retries,
                );
            }

            log::debug!(
                "Query '{}' failed (attempt {}), retrying in {:?}: {}",
                query.name,
                retries + 1,
                delay,
                last_error
            );
            tokio::time::sleep_until(wake).await;
            retries += 1;
        }

        log::warn!(
            "Query '{}' failed after {} attempts: {}",
            query.name,
            retries + 1,
            last_error
        );
        QueryResult::failed(query.clone(), last_error, start.elapsed(), retries)
    }

    /// One search call, bounded by the per-call timeout and the run deadline.
    async fn attempt(
        &self,
        params: &BTreeMap<String, String>,
        deadline: Instant,
    ) -> Result<crate::models::SearchResponse> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AppError::timeout("run deadline reached"));
        }

        let timeout = remaining.min(self.per_call_timeout);
        self.client.search(params, timeout).await
    }

    /// Exponential backoff with bounded, non-negative jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry.initial_delay_ms as f64
            * self.retry.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.retry.max_delay_ms as f64);

        let with_jitter = if self.retry.jitter {
            capped + capped * 0.1 * rand::random::<f64>()
        } else {
            capped
        };

        Duration::from_millis(with_jitter as u64)
    }
}
