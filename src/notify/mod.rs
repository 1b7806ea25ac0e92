// src/notify/mod.rs

//! Notification construction and delivery.
//!
//! - `Notifier` is the delivery seam each channel implements
//! - `Router` fans notifications out to every enabled channel
//! - `DigestQueue` batches low-urgency notifications between flushes

pub mod digest;
pub mod email;
pub mod github;
pub mod router;
pub mod slack;

use chrono::{DateTime, Utc};
use serde::Serialize;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::{Opportunity, Priority, Query};
use crate::utils::count_upcoming_deadlines;

pub use digest::DigestQueue;
pub use email::EmailNotifier;
pub use github::IssueNotifier;
pub use router::Router;
pub use slack::SlackNotifier;

/// A delivery channel for notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification. Must be a no-op `Ok` when disabled.
    async fn send(&self, notification: &Notification) -> Result<()>;

    /// Channel name for logs and error aggregation.
    fn kind(&self) -> &'static str;

    fn is_enabled(&self) -> bool;
}

/// Whether a notification reports new listings or changed ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    New,
    Updated,
}

/// Quick stats attached to every notification.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Summary {
    pub new: usize,
    pub updated: usize,
    pub upcoming_deadlines: usize,
}

/// One notification, ready for any channel to render and deliver.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub query_name: String,
    pub priority: Priority,
    pub recipients: Vec<String>,
    pub subject: String,
    pub category: Category,
    pub records: Vec<Opportunity>,
    pub summary: Summary,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Notification for newly discovered records of one query.
    pub fn for_new(query: &Query, records: Vec<Opportunity>) -> Self {
        let subject = format!(
            "{} new opportunit{}: {}",
            records.len(),
            if records.len() == 1 { "y" } else { "ies" },
            query.name
        );
        let summary = Summary {
            new: records.len(),
            updated: 0,
            upcoming_deadlines: count_upcoming_deadlines(&records, 30),
        };
        Self::build(query, subject, Category::New, records, summary)
    }

    /// Notification for records whose content changed since the last run.
    pub fn for_updated(query: &Query, records: Vec<Opportunity>) -> Self {
        let subject = format!(
            "{} updated opportunit{}: {}",
            records.len(),
            if records.len() == 1 { "y" } else { "ies" },
            query.name
        );
        let summary = Summary {
            new: 0,
            updated: records.len(),
            upcoming_deadlines: count_upcoming_deadlines(&records, 30),
        };
        Self::build(query, subject, Category::Updated, records, summary)
    }

    fn build(
        query: &Query,
        subject: String,
        category: Category,
        records: Vec<Opportunity>,
        summary: Summary,
    ) -> Self {
        Self {
            query_name: query.name.clone(),
            priority: query.priority,
            recipients: query.recipients.clone(),
            subject,
            category,
            records,
            summary,
            timestamp: Utc::now(),
        }
    }

    /// Check the notification is well-formed before any channel is invoked.
    pub fn validate(&self) -> Result<()> {
        if self.query_name.trim().is_empty() {
            return Err(AppError::validation("notification query name is empty"));
        }
        if self.subject.trim().is_empty() {
            return Err(AppError::validation("notification subject is empty"));
        }
        if self.records.is_empty() {
            return Err(AppError::validation("notification carries no records"));
        }
        Ok(())
    }

    /// Any record due within the next 3 days.
    pub fn has_urgent_deadline(&self) -> bool {
        self.records.iter().any(|r| r.deadline_within_days(3))
    }
}

/// Aggregate per-channel failures into one error, preserving each message.
pub(crate) fn combine_send_errors(failures: Vec<(&'static str, AppError)>) -> AppError {
    let combined = failures
        .iter()
        .map(|(kind, error)| format!("{}: {}", kind, error))
        .collect::<Vec<_>>()
        .join("; ");
    AppError::notify(combined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn query(name: &str, priority: Priority) -> Query {
        Query {
            name: name.to_string(),
            enabled: true,
            priority,
            recipients: vec!["ops@example.com".to_string()],
            lookback_days: None,
            parameters: BTreeMap::new(),
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
            description: String::new(),
            link: format!("https://example.com/{id}"),
        }
    }

    #[test]
    fn test_for_new_builds_subject_and_summary() {
        let n = Notification::for_new(&query("bridges", Priority::High), vec![record("A")]);
        assert_eq!(n.subject, "1 new opportunity: bridges");
        assert_eq!(n.summary.new, 1);
        assert_eq!(n.summary.updated, 0);
        assert_eq!(n.category, Category::New);
        assert_eq!(n.priority, Priority::High);
        assert_eq!(n.recipients, vec!["ops@example.com".to_string()]);
    }

    #[test]
    fn test_for_updated_counts_updated() {
        let n = Notification::for_updated(
            &query("roads", Priority::Low),
            vec![record("A"), record("B")],
        );
        assert_eq!(n.subject, "2 updated opportunities: roads");
        assert_eq!(n.summary.updated, 2);
        assert_eq!(n.summary.new, 0);
    }

    #[test]
    fn test_validate_rejects_empty_records() {
        let mut n = Notification::for_new(&query("q", Priority::Medium), vec![record("A")]);
        n.records.clear();
        assert!(n.validate().is_err());
    }

    #[test]
    fn test_urgent_deadline_detection() {
        let mut r = record("A");
        let soon = (Utc::now().date_naive() + chrono::Duration::days(2))
            .format("%Y-%m-%d")
            .to_string();
        r.deadline = Some(soon);
        let n = Notification::for_new(&query("q", Priority::Low), vec![r]);
        assert!(n.has_urgent_deadline());
    }

    #[test]
    fn test_combine_send_errors_joins_messages() {
        let combined = combine_send_errors(vec![
            ("slack", AppError::notify("webhook returned 500")),
            ("email", AppError::notify("mail API unreachable")),
        ]);
        let message = combined.to_string();
        assert!(message.contains("slack"));
        assert!(message.contains("email"));
        assert!(message.contains("webhook returned 500"));
    }
}
