//! Digest batching for low-urgency notifications.
//!
//! Queued notifications are merged per priority bucket into a single digest
//! notification when flushed, so a quiet day produces one message instead of
//! a trickle.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use crate::models::Priority;
use crate::notify::{Category, Notification, Summary};
use crate::utils::{count_upcoming_deadlines, join_names};

/// A queued notification with the time it entered the queue.
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub notification: Notification,
    pub created_at: DateTime<Utc>,
}

/// In-memory queue of notifications awaiting a digest flush.
#[derive(Debug, Default)]
pub struct DigestQueue {
    pending: Vec<PendingNotification>,
}

impl DigestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, notification: Notification) {
        log::debug!(
            "Queued notification for digest: {} (priority: {})",
            notification.query_name,
            notification.priority.as_str()
        );
        self.pending.push(PendingNotification {
            notification,
            created_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn oldest_pending(&self) -> Option<DateTime<Utc>> {
        self.pending.iter().map(|p| p.created_at).min()
    }

    /// Whether the oldest queued item has waited at least `max_age`.
    pub fn should_flush(&self, max_age: Duration) -> bool {
        match self.oldest_pending() {
            Some(oldest) => Utc::now() - oldest >= max_age,
            None => false,
        }
    }

    /// Drain the queue. Items added after this snapshot join the next cycle.
    pub fn take_all(&mut self) -> Vec<PendingNotification> {
        std::mem::take(&mut self.pending)
    }
}

/// Merge queued notifications into one digest per priority bucket.
///
/// Within a bucket, records are concatenated oldest-first, counts summed,
/// and the upcoming-deadline count recomputed over the merged records.
pub fn merge_by_priority(pending: Vec<PendingNotification>) -> Vec<Notification> {
    let mut buckets: BTreeMap<Priority, Vec<PendingNotification>> = BTreeMap::new();
    for item in pending {
        buckets
            .entry(item.notification.priority)
            .or_default()
            .push(item);
    }

    let mut digests = Vec::with_capacity(buckets.len());
    for (priority, mut group) in buckets {
        group.sort_by_key(|p| p.created_at);

        let mut records = Vec::new();
        let mut recipients: Vec<String> = Vec::new();
        let mut query_names: Vec<String> = Vec::new();
        let mut new = 0;
        let mut updated = 0;

        for item in &group {
            records.extend(item.notification.records.iter().cloned());
            new += item.notification.summary.new;
            updated += item.notification.summary.updated;
            if !query_names.contains(&item.notification.query_name) {
                query_names.push(item.notification.query_name.clone());
            }
            for recipient in &item.notification.recipients {
                if !recipients.contains(recipient) {
                    recipients.push(recipient.clone());
                }
            }
        }

        let subject = digest_subject(priority, new + updated, &query_names);
        let upcoming_deadlines = count_upcoming_deadlines(&records, 30);

        // An update-only bucket must not render as "new" in the channels
        let category = if new == 0 && updated > 0 {
            Category::Updated
        } else {
            Category::New
        };

        digests.push(Notification {
            query_name: format!("digest ({})", priority.as_str()),
            priority,
            recipients,
            subject,
            category,
            records,
            summary: Summary {
                new,
                updated,
                upcoming_deadlines,
            },
            timestamp: Utc::now(),
        });
    }

    digests
}

fn digest_subject(priority: Priority, total: usize, query_names: &[String]) -> String {
    let scope = if query_names.len() <= 3 {
        join_names(query_names)
    } else {
        format!("{} queries", query_names.len())
    };
    format!(
        "Digest: {} opportunit{} ({}) - {}",
        total,
        if total == 1 { "y" } else { "ies" },
        priority.as_str(),
        scope
    )
}
