//! End-to-end orchestration of one monitoring run.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::Result;
use crate::models::Config;
use crate::notify::Router;
use crate::pipeline::diff::{Differ, diff_report};
use crate::pipeline::dispatch::QueryDispatcher;
use crate::pipeline::recovery::{FailurePolicy, failure_report};
use crate::services::{CachingClient, HttpSearchClient, ResponseCache, SearchClient};
use crate::state::StateStore;

/// Outcome of one monitoring run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub queries_run: usize,
    pub queries_succeeded: usize,
    pub queries_failed: usize,
    pub new_records: usize,
    pub updated_records: usize,
    pub total_records: usize,
    pub notifications_sent: usize,
    pub notifications_queued: usize,
    pub expired: usize,
    pub pruned: usize,
    pub errors: Vec<String>,
}

impl RunReport {
    fn log_summary(&self) {
        log::info!("=== Run complete in {:?} ===", self.duration);
        log::info!(
            "Queries: {} run, {} succeeded, {} failed",
            self.queries_run,
            self.queries_succeeded,
            self.queries_failed
        );
        log::info!(
            "Records: {} total, {} new, {} updated, {} expired, {} pruned",
            self.total_records,
            self.new_records,
            self.updated_records,
            self.expired,
            self.pruned
        );
        if self.notifications_sent > 0 || self.notifications_queued > 0 {
            log::info!(
                "Notifications: {} sent, {} queued",
                self.notifications_sent,
                self.notifications_queued
            );
        }
        for error in &self.errors {
            log::warn!("Run error: {}", error);
        }
    }
}

/// Ties the pipeline together: dispatch, diff, notify, expire, persist.
pub struct Monitor {
    config: Config,
    dispatcher: QueryDispatcher,
    policy: FailurePolicy,
    differ: Differ,
    router: Router,
    store: StateStore,
    dry_run: bool,
    verbose: bool,
}

impl Monitor {
    /// Build a monitor with the production HTTP client and on-disk state.
    pub fn new(
        config: Config,
        api_key: &str,
        state_path: &Path,
        dry_run: bool,
        verbose: bool,
        lookback_override: Option<i64>,
    ) -> Result<Self> {
        let mut client: Arc<dyn SearchClient> =
            Arc::new(HttpSearchClient::new(&config.monitor, api_key)?);
        if config.cache.enabled {
            let cache = ResponseCache::open(
                &config.cache.dir,
                chrono::Duration::minutes(config.cache.ttl_minutes),
                config.cache.max_entries,
            )?;
            log::debug!("Response cache enabled at {}", config.cache.dir);
            client = Arc::new(CachingClient::new(client, cache));
        }
        let store = StateStore::load(state_path);
        let router = Router::from_config(&config.channels, &config.monitor)?;
        Ok(Self::assemble(
            config,
            client,
            store,
            router,
            dry_run,
            verbose,
            lookback_override,
        ))
    }

    /// Build a monitor from explicit parts. The seam the tests use.
    pub fn with_parts(
        config: Config,
        client: Arc<dyn SearchClient>,
        store: StateStore,
        router: Router,
        dry_run: bool,
        verbose: bool,
    ) -> Self {
        Self::assemble(config, client, store, router, dry_run, verbose, None)
    }

    fn assemble(
        config: Config,
        client: Arc<dyn SearchClient>,
        store: StateStore,
        router: Router,
        dry_run: bool,
        verbose: bool,
        lookback_override: Option<i64>,
    ) -> Self {
        let lookback = lookback_override.unwrap_or(config.monitor.lookback_days);
        let dispatcher = QueryDispatcher::new(
            client,
            config.retry.clone(),
            lookback,
            config.monitor.max_concurrent,
            Duration::from_secs(config.monitor.timeout_secs),
        );
        let policy = FailurePolicy::with_threshold(config.monitor.failure_threshold);
        let differ = Differ::new(verbose);
        Self {
            config,
            dispatcher,
            policy,
            differ,
            router,
            store,
            dry_run,
            verbose,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Execute one full run within `budget`.
    ///
    /// A run that exceeds the failure-ratio threshold, or cannot persist its
    /// state, returns an error; everything else is reported per query.
    pub async fn run(&self, budget: Duration) -> Result<RunReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start + budget;

        let queries: Vec<_> = self
            .config
            .enabled_queries()
            .into_iter()
            .cloned()
            .collect();
        log::info!(
            "Starting run: {} queries, budget {:?}{}",
            queries.len(),
            budget,
            if self.dry_run { " [dry run]" } else { "" }
        );

        let outcome = self
            .policy
            .run_with_recovery(&self.dispatcher, &queries, deadline)
            .await;

        for result in &outcome.results {
            self.store.update_query_metrics(
                &result.query.name,
                result.duration,
                result.records.len(),
                result.error.as_ref().map(|_| result.error_message()).as_deref(),
            );
        }

        if let Some(abort) = outcome.aborted {
            log::error!("{}", abort);
            log::info!("\n{}", failure_report(&outcome.results));
            return Err(abort);
        }

        let mut report = RunReport {
            started_at,
            finished_at: started_at,
            duration: Duration::ZERO,
            queries_run: outcome.results.len(),
            queries_succeeded: 0,
            queries_failed: 0,
            new_records: 0,
            updated_records: 0,
            total_records: 0,
            notifications_sent: 0,
            notifications_queued: 0,
            expired: 0,
            pruned: 0,
            errors: Vec::new(),
        };

        let mut seen_ids: HashSet<String> = HashSet::new();
        for result in &outcome.results {
            if !result.success {
                report.queries_failed += 1;
                report.errors.push(format!(
                    "query '{}': {}",
                    result.query.name,
                    result.error_message()
                ));
                continue;
            }
            report.queries_succeeded += 1;
            report.total_records += result.records.len();
            seen_ids.extend(result.records.iter().map(|r| r.id.clone()));

            let diff = self.differ.diff(&result.records, &self.store);
            report.new_records += diff.new.len();
            report.updated_records += diff.updated.len();
            if self.verbose && diff.has_changes() {
                log::debug!("\n{}", diff_report(&diff, &result.query.name));
            }

            if !diff.has_changes() {
                continue;
            }
            if self.dry_run {
                log::info!(
                    "[dry run] Would notify for '{}': {} new, {} updated",
                    result.query.name,
                    diff.new.len(),
                    diff.updated.len()
                );
                continue;
            }

            let routed = self.router.route(&result.query, &diff).await;
            report.notifications_sent += routed.sent;
            report.notifications_queued += routed.queued;
            report
                .errors
                .extend(routed.errors.iter().map(|e| e.to_string()));
        }

        // One-shot process: anything still queued goes out before we exit
        if !self.dry_run {
            let flushed = self.router.flush().await;
            report.notifications_sent += flushed.sent;
            report
                .errors
                .extend(flushed.errors.iter().map(|e| e.to_string()));
        }

        let expired = self.differ.find_expired(
            &seen_ids,
            &self.store,
            chrono::Duration::days(self.config.monitor.expiry_days),
        );
        if !expired.is_empty() {
            let ids: Vec<String> = expired.into_iter().map(|e| e.id).collect();
            report.expired = self.store.mark_expired(&ids);
            log::info!("Marked {} records as expired", report.expired);
        }

        report.pruned = self
            .store
            .prune(chrono::Duration::days(self.config.monitor.state_max_age_days));
        if report.pruned > 0 {
            log::info!("Pruned {} stale records from state", report.pruned);
        }

        self.store.set_last_run(Utc::now());
        if !self.dry_run {
            self.store.save()?;
        }

        report.finished_at = Utc::now();
        report.duration = start.elapsed();
        report.log_summary();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use crate::error::AppError;
    use crate::models::{Opportunity, ParamValue, Priority, Query, SearchResponse};
    use crate::notify::{Notification, Notifier};

    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, notification: &Notification) -> Result<()> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "recording"
        }

        fn is_enabled(&self) -> bool {
            true
        }
    }

    /// Serves a fixed record set for every query; can fail selected titles.
    struct FixedClient {
        records: Vec<Opportunity>,
        fail_titles: Vec<&'static str>,
    }

    #[async_trait]
    impl crate::services::SearchClient for FixedClient {
        async fn search(
            &self,
            params: &BTreeMap<String, String>,
            _timeout: Duration,
        ) -> Result<SearchResponse> {
            if let Some(title) = params.get("title") {
                if self.fail_titles.contains(&title.as_str()) {
                    return Err(AppError::api(401, "bad key"));
                }
            }
            Ok(SearchResponse {
                total: self.records.len(),
                items: self.records.clone(),
            })
        }
    }

    fn record(id: &str) -> Opportunity {
        Opportunity {
            id: id.to_string(),
            title: format!("Opportunity {id}"),
            posted_date: "2026-08-01".to_string(),
            notice_type: "solicitation".to_string(),
            deadline: None,
            set_aside: String::new(),
            classification_code: String::new(),
            description: "desc".to_string(),
            link: String::new(),
        }
    }

    fn config_with_queries(titles: &[&str]) -> Config {
        let queries = titles
            .iter()
            .map(|title| {
                let mut parameters = BTreeMap::new();
                parameters.insert(
                    "title".to_string(),
                    ParamValue::Text(title.to_string()),
                );
                Query {
                    name: format!("query-{title}"),
                    enabled: true,
                    priority: Priority::Medium,
                    recipients: vec![],
                    lookback_days: None,
                    parameters,
                }
            })
            .collect();
        let mut config = Config {
            queries,
            ..Config::default()
        };
        config.retry.max_retries = 0;
        config.retry.initial_delay_ms = 1;
        config.retry.jitter = false;
        config
    }

    fn monitor_with(
        client: FixedClient,
        config: Config,
        dry_run: bool,
    ) -> (Monitor, Arc<RecordingNotifier>) {
        let channel = Arc::new(RecordingNotifier {
            sent: Mutex::new(Vec::new()),
        });
        let router = Router::new(vec![channel.clone()], false, chrono::Duration::hours(4));
        let monitor = Monitor::with_parts(
            config,
            Arc::new(client),
            StateStore::in_memory(),
            router,
            dry_run,
            false,
        );
        (monitor, channel)
    }

    #[tokio::test]
    async fn test_full_run_reports_and_notifies() {
        let client = FixedClient {
            records: vec![record("A"), record("B")],
            fail_titles: vec![],
        };
        let (monitor, channel) = monitor_with(client, config_with_queries(&["roads"]), false);

        let report = monitor.run(Duration::from_secs(30)).await.unwrap();

        assert_eq!(report.queries_run, 1);
        assert_eq!(report.queries_succeeded, 1);
        assert_eq!(report.new_records, 2);
        assert_eq!(report.updated_records, 0);
        assert_eq!(report.notifications_sent, 1);
        assert!(report.errors.is_empty());
        assert_eq!(monitor.store().len(), 2);
        assert!(monitor.store().last_run().is_some());
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_second_run_is_quiet() {
        let records = vec![record("A")];
        let (monitor, channel) = monitor_with(
            FixedClient {
                records: records.clone(),
                fail_titles: vec![],
            },
            config_with_queries(&["roads"]),
            false,
        );

        monitor.run(Duration::from_secs(30)).await.unwrap();
        let second = monitor.run(Duration::from_secs(30)).await.unwrap();

        assert_eq!(second.new_records, 0);
        assert_eq!(second.updated_records, 0);
        assert_eq!(second.notifications_sent, 0);
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_skips_notifications() {
        let (monitor, channel) = monitor_with(
            FixedClient {
                records: vec![record("A")],
                fail_titles: vec![],
            },
            config_with_queries(&["roads"]),
            true,
        );

        let report = monitor.run(Duration::from_secs(30)).await.unwrap();

        assert_eq!(report.new_records, 1);
        assert_eq!(report.notifications_sent, 0);
        assert!(channel.sent.lock().unwrap().is_empty());
        // Diff classification still updates the in-memory state
        assert_eq!(monitor.store().len(), 1);
    }

    #[tokio::test]
    async fn test_partial_failure_reported_not_fatal() {
        let (monitor, _) = monitor_with(
            FixedClient {
                records: vec![record("A")],
                fail_titles: vec!["locked"],
            },
            config_with_queries(&["roads", "bridges", "locked"]),
            false,
        );

        let report = monitor.run(Duration::from_secs(30)).await.unwrap();

        assert_eq!(report.queries_failed, 1);
        assert_eq!(report.queries_succeeded, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("locked"));
        // Metrics recorded the failure
        let metrics = monitor.store().query_metrics("query-locked").unwrap();
        assert_eq!(metrics.error_count, 1);
    }

    #[tokio::test]
    async fn test_all_failed_aborts() {
        let (monitor, _) = monitor_with(
            FixedClient {
                records: vec![],
                fail_titles: vec!["x", "y"],
            },
            config_with_queries(&["x", "y"]),
            false,
        );

        let result = monitor.run(Duration::from_secs(30)).await;
        assert!(matches!(
            result,
            Err(AppError::FailureRatioExceeded { .. })
        ));
    }
}
