//! Failure classification and partial-failure recovery.
//!
//! After the first dispatch pass, failed queries are grouped by error kind
//! and given one targeted recovery attempt each. If too many queries failed,
//! the run aborts instead: a systemic outage must not pass as "mostly fine".

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::AppError;
use crate::models::Query;
use crate::pipeline::dispatch::{QueryDispatcher, QueryResult};

/// Classified cause of a query failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorKind {
    Network,
    Timeout,
    RateLimit,
    Auth,
    Validation,
    ServerError,
    Unknown,
}

impl ErrorKind {
    /// Transient kinds are worth retrying; auth and validation failures are
    /// configuration problems that would fail identically.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::ServerError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Auth => "auth",
            ErrorKind::Validation => "validation",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error, inspecting the structured status code first and
/// falling back to message substring matching for unstructured errors.
pub fn classify(error: &AppError) -> ErrorKind {
    if let Some(status) = error.status_code() {
        return match status {
            401 | 403 => ErrorKind::Auth,
            429 => ErrorKind::RateLimit,
            400 | 422 => ErrorKind::Validation,
            500 | 502 | 503 | 504 => ErrorKind::ServerError,
            s if s >= 500 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        };
    }

    match error {
        AppError::Timeout(_) => return ErrorKind::Timeout,
        AppError::Validation(_) | AppError::Config(_) => return ErrorKind::Validation,
        AppError::Http(e) => {
            if e.is_timeout() {
                return ErrorKind::Timeout;
            }
            if e.is_connect() {
                return ErrorKind::Network;
            }
        }
        _ => {}
    }

    let message = error.to_string().to_lowercase();
    let contains_any =
        |needles: &[&str]| needles.iter().any(|needle| message.contains(needle));

    if contains_any(&["timeout", "deadline"]) {
        ErrorKind::Timeout
    } else if contains_any(&["network", "connection", "dns", "resolve"]) {
        ErrorKind::Network
    } else if contains_any(&["rate limit", "too many requests"]) {
        ErrorKind::RateLimit
    } else if contains_any(&["unauthorized", "forbidden", "authentication", "api key"]) {
        ErrorKind::Auth
    } else if contains_any(&["validation", "invalid", "bad request"]) {
        ErrorKind::Validation
    } else {
        ErrorKind::Unknown
    }
}

/// Dispatch results plus whether the run must abort.
#[derive(Debug)]
pub struct RecoveryOutcome {
    pub results: Vec<QueryResult>,
    /// Set when the failure ratio crossed the abort threshold; partial
    /// results are still returned for reporting.
    pub aborted: Option<AppError>,
}

/// Per-kind recovery strategy configuration.
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    /// Fraction of queries allowed to fail before aborting the run
    pub failure_threshold: f64,

    /// Cooldown before retrying rate-limited queries
    pub rate_limit_cooldown: Duration,

    /// Spacing between consecutive rate-limit retries
    pub rate_limit_spacing: Duration,

    /// Cooldown before retrying network/timeout failures
    pub network_cooldown: Duration,

    /// Cooldown before retrying unclassified failures
    pub unknown_cooldown: Duration,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            rate_limit_cooldown: Duration::from_secs(120),
            rate_limit_spacing: Duration::from_secs(30),
            network_cooldown: Duration::from_secs(30),
            unknown_cooldown: Duration::from_secs(30),
        }
    }
}

impl FailurePolicy {
    pub fn with_threshold(failure_threshold: f64) -> Self {
        Self {
            failure_threshold,
            ..Self::default()
        }
    }

    /// Run all queries, then attempt one recovery pass over the failures.
    ///
    /// The recovery pass only runs when the failure ratio is within the
    /// threshold; otherwise the outcome carries an abort error alongside the
    /// first-pass results.
    pub async fn run_with_recovery(
        &self,
        dispatcher: &QueryDispatcher,
        queries: &[Query],
        deadline: Instant,
    ) -> RecoveryOutcome {
        let mut results = dispatcher.run_all(queries, deadline).await;

        // Disabled queries fail during dispatch but say nothing about the
        // health of the upstream, so they count toward neither side of the
        // abort ratio.
        let failed = results
            .iter()
            .filter(|r| !r.success && r.query.enabled)
            .count();
        if failed == 0 {
            log::debug!("All {} queries executed successfully", results.len());
            return RecoveryOutcome {
                results,
                aborted: None,
            };
        }

        let total = results.iter().filter(|r| r.query.enabled).count();
        let ratio = failed as f64 / total as f64;
        if ratio > self.failure_threshold {
            return RecoveryOutcome {
                results,
                aborted: Some(AppError::FailureRatioExceeded {
                    failed,
                    total,
                    ratio: ratio * 100.0,
                    threshold: self.failure_threshold * 100.0,
                }),
            };
        }

        log::info!(
            "Initial dispatch: {} succeeded, {} failed; attempting recovery",
            total - failed,
            failed
        );
        self.retry_failures(dispatcher, &mut results, deadline).await;

        let still_failed = results.iter().filter(|r| !r.success).count();
        log::info!(
            "Final results: {} succeeded, {} failed",
            total - still_failed,
            still_failed
        );

        RecoveryOutcome {
            results,
            aborted: None,
        }
    }

    /// Apply the per-kind strategy to each failed result in place.
    async fn retry_failures(
        &self,
        dispatcher: &QueryDispatcher,
        results: &mut [QueryResult],
        deadline: Instant,
    ) {
        let mut groups: BTreeMap<ErrorKind, Vec<usize>> = BTreeMap::new();
        for (index, result) in results.iter().enumerate() {
            // Disabled queries are failures by definition but never recoverable
            if result.success || !result.query.enabled {
                continue;
            }
            let kind = result.kind.unwrap_or(ErrorKind::Unknown);
            groups.entry(kind).or_default().push(index);
        }

        for (kind, indices) in groups {
            match kind {
                ErrorKind::RateLimit => {
                    self.retry_spaced(
                        dispatcher,
                        results,
                        &indices,
                        deadline,
                        self.rate_limit_cooldown,
                        self.rate_limit_spacing,
                        RetryShape::AsIs,
                    )
                    .await;
                }
                ErrorKind::Network | ErrorKind::Timeout => {
                    self.retry_spaced(
                        dispatcher,
                        results,
                        &indices,
                        deadline,
                        self.network_cooldown,
                        Duration::ZERO,
                        RetryShape::AsIs,
                    )
                    .await;
                }
                ErrorKind::ServerError => {
                    self.retry_spaced(
                        dispatcher,
                        results,
                        &indices,
                        deadline,
                        Duration::ZERO,
                        Duration::ZERO,
                        RetryShape::Simplified,
                    )
                    .await;
                }
                ErrorKind::Validation => {
                    self.retry_spaced(
                        dispatcher,
                        results,
                        &indices,
                        deadline,
                        Duration::ZERO,
                        Duration::ZERO,
                        RetryShape::Fallback,
                    )
                    .await;
                }
                ErrorKind::Auth => {
                    log::info!("Skipping retry for {} auth failures", indices.len());
                }
                ErrorKind::Unknown => {
                    self.retry_spaced(
                        dispatcher,
                        results,
                        &indices,
                        deadline,
                        self.unknown_cooldown,
                        Duration::ZERO,
                        RetryShape::AsIs,
                    )
                    .await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn retry_spaced(
        &self,
        dispatcher: &QueryDispatcher,
        results: &mut [QueryResult],
        indices: &[usize],
        deadline: Instant,
        initial_wait: Duration,
        spacing: Duration,
        shape: RetryShape,
    ) {
        if !sleep_within(initial_wait, deadline).await {
            return;
        }

        for (position, &index) in indices.iter().enumerate() {
            if position > 0 && !sleep_within(spacing, deadline).await {
                return;
            }

            let original = &results[index];
            let query = match shape {
                RetryShape::AsIs => original.query.clone(),
                RetryShape::Simplified => original.query.simplified(),
                RetryShape::Fallback => original.query.fallback(),
            };

            log::info!(
                "Retrying query '{}' ({} recovery, was {})",
                query.name,
                shape,
                original.kind.unwrap_or(ErrorKind::Unknown)
            );

            let previous_retries = original.retries;
            let mut retried = dispatcher.run_one(&query, deadline).await;
            retried.retries += previous_retries + 1;
            // Keep the original query definition in the result for reporting
            retried.query = original.query.clone();
            results[index] = retried;
        }
    }
}

/// How a failed query is reshaped for its recovery attempt.
#[derive(Debug, Clone, Copy)]
enum RetryShape {
    AsIs,
    Simplified,
    Fallback,
}

impl fmt::Display for RetryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetryShape::AsIs => "direct",
            RetryShape::Simplified => "simplified",
            RetryShape::Fallback => "fallback",
        })
    }
}

/// Sleep for `duration` unless that would cross the deadline.
/// Returns false when the deadline makes the wait pointless.
async fn sleep_within(duration: Duration, deadline: Instant) -> bool {
    if duration.is_zero() {
        return true;
    }
    let wake = Instant::now() + duration;
    if wake >= deadline {
        return false;
    }
    tokio::time::sleep_until(wake).await;
    true
}

/// Human-readable execution report over all query results.
pub fn failure_report(results: &[QueryResult]) -> String {
    let total = results.len();
    let successful = results.iter().filter(|r| r.success).count();
    let failed = total - successful;
    let total_retries: u32 = results.iter().map(|r| r.retries).sum();

    let mut breakdown: BTreeMap<ErrorKind, usize> = BTreeMap::new();
    for result in results.iter().filter(|r| !r.success) {
        *breakdown
            .entry(result.kind.unwrap_or(ErrorKind::Unknown))
            .or_default() += 1;
    }

    let pct = |count: usize| {
        if total == 0 {
            0.0
        } else {
            count as f64 / total as f64 * 100.0
        }
    };

    let mut report = String::from("# Query Execution Report\n\n## Summary\n");
    let _ = writeln!(report, "- Total Queries: {}", total);
    let _ = writeln!(report, "- Successful: {} ({:.1}%)", successful, pct(successful));
    let _ = writeln!(report, "- Failed: {} ({:.1}%)", failed, pct(failed));
    let _ = writeln!(report, "- Total Retries: {}", total_retries);

    if !breakdown.is_empty() {
        report.push_str("\n## Error Breakdown\n");
        for (kind, count) in &breakdown {
            let _ = writeln!(report, "- {}: {}", kind, count);
        }

        report.push_str("\n## Failed Queries\n");
        for result in results.iter().filter(|r| !r.success) {
            let _ = writeln!(
                report,
                "- **{}**: {} ({}, {} retries)",
                result.query.name,
                result.error_message(),
                result.kind.unwrap_or(ErrorKind::Unknown),
                result.retries
            );
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap as ParamMap;
    use std::sync::Arc;
    use std::sync::Mutex;

    use crate::error::Result;
    use crate::models::{ParamValue, Priority, RetryConfig, SearchResponse};
    use crate::services::SearchClient;

    #[test]
    fn test_classify_by_status() {
        assert_eq!(classify(&AppError::api(401, "no")), ErrorKind::Auth);
        assert_eq!(classify(&AppError::api(403, "no")), ErrorKind::Auth);
        assert_eq!(classify(&AppError::api(429, "slow down")), ErrorKind::RateLimit);
        assert_eq!(classify(&AppError::api(400, "bad")), ErrorKind::Validation);
        assert_eq!(classify(&AppError::api(503, "down")), ErrorKind::ServerError);
        assert_eq!(classify(&AppError::api(418, "teapot")), ErrorKind::Unknown);
    }

    #[test]
    fn test_classify_by_variant_and_message() {
        assert_eq!(
            classify(&AppError::timeout("deadline reached")),
            ErrorKind::Timeout
        );
        assert_eq!(
            classify(&AppError::validation("disabled")),
            ErrorKind::Validation
        );
        let io = AppError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert_eq!(classify(&io), ErrorKind::Network);
        let opaque = AppError::Notify("something odd".to_string());
        assert_eq!(classify(&opaque), ErrorKind::Unknown);
    }

    #[test]
    fn test_transient_kinds() {
        assert!(ErrorKind::Network.is_transient());
        assert!(ErrorKind::RateLimit.is_transient());
        assert!(ErrorKind::ServerError.is_transient());
        assert!(!ErrorKind::Auth.is_transient());
        assert!(!ErrorKind::Validation.is_transient());
    }

    fn make_query(name: &str) -> Query {
        Query {
            name: name.to_string(),
            enabled: true,
            priority: Priority::Medium,
            recipients: vec![],
            lookback_days: None,
            parameters: ParamMap::new(),
        }
    }

    fn fast_policy() -> FailurePolicy {
        FailurePolicy {
            failure_threshold: 0.5,
            rate_limit_cooldown: Duration::from_millis(1),
            rate_limit_spacing: Duration::from_millis(1),
            network_cooldown: Duration::from_millis(1),
            unknown_cooldown: Duration::from_millis(1),
        }
    }

    fn fast_dispatcher(client: Arc<dyn SearchClient>) -> QueryDispatcher {
        QueryDispatcher::new(
            client,
            RetryConfig {
                max_retries: 0,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                backoff_factor: 2.0,
                jitter: false,
            },
            3,
            3,
            Duration::from_secs(5),
        )
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    /// Fails selected queries on the first call, succeeds on the second.
    struct RecoveringClient {
        fail_titles: Vec<&'static str>,
        seen: Mutex<Vec<String>>,
        status: u16,
    }

    #[async_trait]
    impl SearchClient for RecoveringClient {
        async fn search(
            &self,
            params: &ParamMap<String, String>,
            _timeout: Duration,
        ) -> Result<SearchResponse> {
            let title = params.get("title").cloned().unwrap_or_default();
            let mut seen = self.seen.lock().unwrap();
            let first_time = !seen.contains(&title);
            seen.push(title.clone());

            if first_time && self.fail_titles.contains(&title.as_str()) {
                return Err(AppError::api(self.status, "induced failure"));
            }
            Ok(SearchResponse::default())
        }
    }

    fn titled_query(name: &str, title: &str) -> Query {
        let mut query = make_query(name);
        query
            .parameters
            .insert("title".to_string(), ParamValue::Text(title.to_string()));
        query
    }

    #[tokio::test]
    async fn test_within_threshold_recovers() {
        let client = Arc::new(RecoveringClient {
            fail_titles: vec!["flaky"],
            seen: Mutex::new(Vec::new()),
            status: 503,
        });
        let dispatcher = fast_dispatcher(client);
        let queries = vec![
            titled_query("a", "solid-1"),
            titled_query("b", "flaky"),
            titled_query("c", "solid-2"),
        ];

        let outcome = fast_policy()
            .run_with_recovery(&dispatcher, &queries, far_deadline())
            .await;

        assert!(outcome.aborted.is_none());
        assert!(outcome.results.iter().all(|r| r.success));
        let recovered = outcome
            .results
            .iter()
            .find(|r| r.query.name == "b")
            .unwrap();
        assert_eq!(recovered.retries, 1);
    }

    #[tokio::test]
    async fn test_failure_ratio_aborts() {
        let client = Arc::new(RecoveringClient {
            fail_titles: vec!["f1", "f2"],
            seen: Mutex::new(Vec::new()),
            status: 503,
        });
        let dispatcher = fast_dispatcher(client);
        let queries = vec![titled_query("a", "f1"), titled_query("b", "f2")];

        let outcome = fast_policy()
            .run_with_recovery(&dispatcher, &queries, far_deadline())
            .await;

        assert!(matches!(
            outcome.aborted,
            Some(AppError::FailureRatioExceeded { failed: 2, total: 2, .. })
        ));
        // First-pass results are still available for the report
        assert_eq!(outcome.results.len(), 2);
    }

    #[tokio::test]
    async fn test_twenty_percent_failure_does_not_abort() {
        let client = Arc::new(RecoveringClient {
            fail_titles: vec!["bad"],
            seen: Mutex::new(Vec::new()),
            status: 500,
        });
        let dispatcher = fast_dispatcher(client);
        let queries: Vec<Query> = (0..4)
            .map(|i| titled_query(&format!("ok{i}"), "fine"))
            .chain(std::iter::once(titled_query("failing", "bad")))
            .collect();

        let outcome = fast_policy()
            .run_with_recovery(&dispatcher, &queries, far_deadline())
            .await;
        assert!(outcome.aborted.is_none());
    }

    #[tokio::test]
    async fn test_disabled_queries_do_not_tip_abort_ratio() {
        let client = Arc::new(RecoveringClient {
            fail_titles: vec!["flaky"],
            seen: Mutex::new(Vec::new()),
            status: 503,
        });
        let dispatcher = fast_dispatcher(client);

        let mut off_1 = titled_query("off-1", "unused-1");
        off_1.enabled = false;
        let mut off_2 = titled_query("off-2", "unused-2");
        off_2.enabled = false;
        let queries = vec![
            titled_query("a", "solid"),
            titled_query("b", "flaky"),
            off_1,
            off_2,
        ];

        // Counting the two disabled results would put the raw ratio at 3/4;
        // only the one enabled failure out of two enabled queries counts
        let outcome = fast_policy()
            .run_with_recovery(&dispatcher, &queries, far_deadline())
            .await;

        assert!(outcome.aborted.is_none());
        let recovered = outcome
            .results
            .iter()
            .find(|r| r.query.name == "b")
            .unwrap();
        assert!(recovered.success);
    }

    #[tokio::test]
    async fn test_auth_failures_not_retried() {
        let client = Arc::new(RecoveringClient {
            fail_titles: vec!["locked"],
            seen: Mutex::new(Vec::new()),
            status: 401,
        });
        let dispatcher = fast_dispatcher(client.clone());
        let queries = vec![
            titled_query("a", "open-1"),
            titled_query("b", "locked"),
            titled_query("c", "open-2"),
        ];

        let outcome = fast_policy()
            .run_with_recovery(&dispatcher, &queries, far_deadline())
            .await;

        let locked = outcome
            .results
            .iter()
            .find(|r| r.query.name == "b")
            .unwrap();
        assert!(!locked.success);
        assert_eq!(locked.retries, 0);
        // Exactly three calls: no second attempt for the auth failure
        assert_eq!(client.seen.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_failure_report_contents() {
        let ok = QueryResult {
            query: make_query("good"),
            records: vec![],
            success: true,
            error: None,
            kind: None,
            duration: Duration::from_millis(10),
            retries: 1,
        };
        let bad = QueryResult {
            query: make_query("bad"),
            records: vec![],
            success: false,
            error: Some(AppError::api(429, "too many requests")),
            kind: Some(ErrorKind::RateLimit),
            duration: Duration::from_millis(10),
            retries: 2,
        };

        let report = failure_report(&[ok, bad]);
        assert!(report.contains("Total Queries: 2"));
        assert!(report.contains("Successful: 1 (50.0%)"));
        assert!(report.contains("rate_limit: 1"));
        assert!(report.contains("**bad**"));
        assert!(report.contains("Total Retries: 3"));
    }
}
