//! Notification routing: immediate fan-out vs digest batching.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Duration;
use futures::future::join_all;

use crate::error::AppError;
use crate::models::{ChannelsConfig, MonitorConfig, Priority, Query};
use crate::notify::digest::{DigestQueue, merge_by_priority};
use crate::notify::{
    EmailNotifier, IssueNotifier, Notification, Notifier, SlackNotifier, combine_send_errors,
};
use crate::pipeline::DiffResult;

/// Record count at which a notification bypasses the digest queue.
const IMMEDIATE_RECORD_THRESHOLD: usize = 10;

/// What routing one batch accomplished.
///
/// Delivery failures are collected rather than propagated so a broken channel
/// never blocks the rest of the run.
#[derive(Debug, Default)]
pub struct RouteOutcome {
    /// Notifications delivered to every enabled channel
    pub sent: usize,
    /// Notifications parked in the digest queue
    pub queued: usize,
    pub errors: Vec<AppError>,
}

impl RouteOutcome {
    fn absorb(&mut self, other: RouteOutcome) {
        self.sent += other.sent;
        self.queued += other.queued;
        self.errors.extend(other.errors);
    }
}

/// Fans notifications out to the registered channels.
///
/// The channel set is fixed at construction; there is no global registry.
pub struct Router {
    channels: Vec<Arc<dyn Notifier>>,
    digest_mode: bool,
    digest_max_age: Duration,
    queue: Mutex<DigestQueue>,
}

impl Router {
    pub fn new(channels: Vec<Arc<dyn Notifier>>, digest_mode: bool, digest_max_age: Duration) -> Self {
        Self {
            channels,
            digest_mode,
            digest_max_age,
            queue: Mutex::new(DigestQueue::new()),
        }
    }

    /// Build a router with every channel enabled in configuration.
    pub fn from_config(
        channels: &ChannelsConfig,
        monitor: &MonitorConfig,
    ) -> crate::error::Result<Self> {
        let mut registered: Vec<Arc<dyn Notifier>> = Vec::new();
        if channels.email.enabled {
            registered.push(Arc::new(EmailNotifier::new(channels.email.clone())?));
        }
        if channels.webhook.enabled {
            registered.push(Arc::new(SlackNotifier::new(channels.webhook.clone())?));
        }
        if channels.issues.enabled {
            registered.push(Arc::new(IssueNotifier::new(channels.issues.clone())?));
        }

        log::info!(
            "Notification channels: [{}]",
            registered
                .iter()
                .map(|c| c.kind())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self::new(
            registered,
            monitor.digest_mode,
            Duration::hours(monitor.digest_max_age_hours),
        ))
    }

    pub fn enabled_kinds(&self) -> Vec<&'static str> {
        self.channels
            .iter()
            .filter(|c| c.is_enabled())
            .map(|c| c.kind())
            .collect()
    }

    /// Route one query's diff: one notification per non-empty category.
    pub async fn route(&self, query: &Query, diff: &DiffResult) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        if !diff.new.is_empty() {
            let notification = Notification::for_new(query, diff.new.clone());
            outcome.absorb(self.dispatch(notification).await);
        }
        if !diff.updated.is_empty() {
            let notification = Notification::for_updated(query, diff.updated.clone());
            outcome.absorb(self.dispatch(notification).await);
        }

        if self.digest_mode {
            let due = self
                .lock_queue()
                .should_flush(self.digest_max_age);
            if due {
                outcome.absorb(self.flush().await);
            }
        }

        outcome
    }

    /// Send immediately or park in the digest queue.
    async fn dispatch(&self, notification: Notification) -> RouteOutcome {
        let mut outcome = RouteOutcome::default();

        if let Err(error) = notification.validate() {
            outcome.errors.push(error);
            return outcome;
        }

        if !self.digest_mode || should_send_immediately(&notification) {
            match self.deliver(&notification).await {
                Ok(()) => outcome.sent += 1,
                Err(error) => outcome.errors.push(error),
            }
        } else {
            self.lock_queue().add(notification);
            outcome.queued += 1;
        }

        outcome
    }

    /// Merge and send everything currently queued.
    pub async fn flush(&self) -> RouteOutcome {
        let pending = self.lock_queue().take_all();
        if pending.is_empty() {
            return RouteOutcome::default();
        }

        log::info!("Flushing digest queue ({} pending)", pending.len());
        let mut outcome = RouteOutcome::default();
        for digest in merge_by_priority(pending) {
            match self.deliver(&digest).await {
                Ok(()) => outcome.sent += 1,
                Err(error) => outcome.errors.push(error),
            }
        }
        outcome
    }

    pub fn pending_count(&self) -> usize {
        self.lock_queue().len()
    }

    /// Invoke every enabled channel concurrently, aggregating failures.
    async fn deliver(&self, notification: &Notification) -> crate::error::Result<()> {
        let enabled: Vec<&Arc<dyn Notifier>> =
            self.channels.iter().filter(|c| c.is_enabled()).collect();
        if enabled.is_empty() {
            log::debug!("No notification channels enabled; dropping '{}'", notification.subject);
            return Ok(());
        }

        let sends = enabled.iter().map(|channel| async {
            (channel.kind(), channel.send(notification).await)
        });
        let failures: Vec<(&'static str, AppError)> = join_all(sends)
            .await
            .into_iter()
            .filter_map(|(kind, result)| result.err().map(|error| (kind, error)))
            .collect();

        if failures.is_empty() {
            log::info!(
                "Sent '{}' via {} channel(s)",
                notification.subject,
                enabled.len()
            );
            Ok(())
        } else {
            Err(combine_send_errors(failures))
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, DigestQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// High priority, an urgent deadline, or a large batch bypasses the digest.
fn should_send_immediately(notification: &Notification) -> bool {
    notification.priority == Priority::High
        || notification.has_urgent_deadline()
        || notification.records.len() >= IMMEDIATE_RECORD_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    use crate::models::Opportunity;

    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        enabled: bool,
    }

    impl RecordingNotifier {
        fn new(enabled: bool) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                enabled,
            })
        }

        fn sent_subjects(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|n| n.subject.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, notification: &Notification) -> crate::error::Result<()> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "recording"
        }

        fn is_enabled(&self) -> bool {
            self.enabled
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn send(&self, _notification: &Notification) -> crate::error::Result<()> {
            Err(AppError::notify("channel down"))
        }

        fn kind(&self) -> &'static str {
            "failing"
        }

        fn is_enabled(&self) -> bool {
            true
        }
    }

    fn query(name: &str, priority: Priority) -> Query {
        Query {
            name: name.to_string(),
            enabled: true,
            priority,
            recipients: vec![],
            lookback_days: None,
            parameters: BTreeMap::new(),
        }
    }

    fn record(id: &str) -> Opportunity {
        Opportunity {
            id: id.to_string(),
            title: format!("Opportunity {id}"),
            posted_date: String::new(),
            notice_type: String::new(),
            deadline: None,
            set_aside: String::new(),
            classification_code: String::new(),
            description: String::new(),
            link: String::new(),
        }
    }

    fn diff_with_new(count: usize) -> DiffResult {
        DiffResult {
            new: (0..count).map(|i| record(&format!("N{i}"))).collect(),
            ..DiffResult::default()
        }
    }

    #[tokio::test]
    async fn test_immediate_when_digest_off() {
        let channel = RecordingNotifier::new(true);
        let router = Router::new(vec![channel.clone()], false, Duration::hours(4));

        let outcome = router
            .route(&query("q", Priority::Low), &diff_with_new(1))
            .await;

        assert_eq!(outcome.sent, 1);
        assert_eq!(outcome.queued, 0);
        assert_eq!(channel.sent_subjects().len(), 1);
    }

    #[tokio::test]
    async fn test_low_priority_queued_in_digest_mode() {
        let channel = RecordingNotifier::new(true);
        let router = Router::new(vec![channel.clone()], true, Duration::hours(4));

        let outcome = router
            .route(&query("q", Priority::Low), &diff_with_new(1))
            .await;

        assert_eq!(outcome.sent, 0);
        assert_eq!(outcome.queued, 1);
        assert_eq!(router.pending_count(), 1);
        assert!(channel.sent_subjects().is_empty());
    }

    #[tokio::test]
    async fn test_high_priority_bypasses_digest() {
        let channel = RecordingNotifier::new(true);
        let router = Router::new(vec![channel.clone()], true, Duration::hours(4));

        let outcome = router
            .route(&query("q", Priority::High), &diff_with_new(1))
            .await;

        assert_eq!(outcome.sent, 1);
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_large_batch_bypasses_digest() {
        let channel = RecordingNotifier::new(true);
        let router = Router::new(vec![channel.clone()], true, Duration::hours(4));

        let outcome = router
            .route(&query("q", Priority::Low), &diff_with_new(10))
            .await;

        assert_eq!(outcome.sent, 1);
        assert_eq!(outcome.queued, 0);
    }

    #[tokio::test]
    async fn test_urgent_deadline_bypasses_digest() {
        let channel = RecordingNotifier::new(true);
        let router = Router::new(vec![channel.clone()], true, Duration::hours(4));

        let mut urgent = record("U");
        urgent.deadline = Some(
            (chrono::Utc::now().date_naive() + Duration::days(2))
                .format("%Y-%m-%d")
                .to_string(),
        );
        let diff = DiffResult {
            new: vec![urgent],
            ..DiffResult::default()
        };

        let outcome = router.route(&query("q", Priority::Low), &diff).await;
        assert_eq!(outcome.sent, 1);
    }

    #[tokio::test]
    async fn test_flush_merges_queue() {
        let channel = RecordingNotifier::new(true);
        let router = Router::new(vec![channel.clone()], true, Duration::hours(4));

        router
            .route(&query("alpha", Priority::Low), &diff_with_new(1))
            .await;
        router
            .route(&query("beta", Priority::Low), &diff_with_new(2))
            .await;
        assert_eq!(router.pending_count(), 2);

        let outcome = router.flush().await;
        assert_eq!(outcome.sent, 1);
        assert_eq!(router.pending_count(), 0);

        let subjects = channel.sent_subjects();
        assert_eq!(subjects.len(), 1);
        assert!(subjects[0].starts_with("Digest: 3 opportunities"));
    }

    #[tokio::test]
    async fn test_channel_failure_aggregated_not_fatal() {
        let good = RecordingNotifier::new(true);
        let router = Router::new(
            vec![good.clone(), Arc::new(FailingNotifier)],
            false,
            Duration::hours(4),
        );

        let outcome = router
            .route(&query("q", Priority::High), &diff_with_new(1))
            .await;

        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].to_string().contains("failing"));
        // The healthy channel still received the notification
        assert_eq!(good.sent_subjects().len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_channel_not_invoked() {
        let disabled = RecordingNotifier::new(false);
        let router = Router::new(vec![disabled.clone()], false, Duration::hours(4));

        let outcome = router
            .route(&query("q", Priority::High), &diff_with_new(1))
            .await;

        // No enabled channels: delivery is a logged no-op
        assert_eq!(outcome.sent, 1);
        assert!(disabled.sent_subjects().is_empty());
    }

    #[tokio::test]
    async fn test_empty_diff_sends_nothing() {
        let channel = RecordingNotifier::new(true);
        let router = Router::new(vec![channel.clone()], false, Duration::hours(4));

        let outcome = router
            .route(&query("q", Priority::High), &DiffResult::default())
            .await;

        assert_eq!(outcome.sent, 0);
        assert!(channel.sent_subjects().is_empty());
    }
}
