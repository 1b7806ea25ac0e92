//! Issue-tracker channel: one issue per urgent record, or a summary issue.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::{IssueConfig, Opportunity, Priority};
use crate::notify::{Notification, Notifier};

pub struct IssueNotifier {
    config: IssueConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct IssueRequest {
    title: String,
    body: String,
    labels: Vec<String>,
}

impl IssueNotifier {
    pub fn new(config: IssueConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent("bidwatch")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { config, client })
    }

    async fn create_issue(&self, issue: &IssueRequest) -> Result<()> {
        let url = format!(
            "{}/repos/{}/{}/issues",
            self.config.api_url.trim_end_matches('/'),
            self.config.owner,
            self.config.repository
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .header("Accept", "application/vnd.github+json")
            .json(issue)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::notify(format!(
                "issue creation returned {}",
                status.as_u16()
            )));
        }
        log::debug!("Created issue: {}", issue.title);
        Ok(())
    }

    fn labels(&self, priority: Priority, urgent: bool) -> Vec<String> {
        let mut labels = self.config.labels.clone();
        labels.push(format!("priority-{}", priority.as_str()));
        if urgent {
            labels.push("urgent-deadline".to_string());
        }
        labels
    }
}

#[async_trait]
impl Notifier for IssueNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.config.token.is_empty()
            || self.config.owner.is_empty()
            || self.config.repository.is_empty()
        {
            return Err(AppError::config(
                "issue channel enabled without token/owner/repository",
            ));
        }

        // High priority gets one trackable issue per record; anything else
        // gets a single summary issue.
        if notification.priority == Priority::High {
            for record in &notification.records {
                let issue = IssueRequest {
                    title: format!("{}: {}", record.id, record.title),
                    body: render_record_body(record, notification),
                    labels: self.labels(notification.priority, record.deadline_within_days(3)),
                };
                self.create_issue(&issue).await?;
            }
            Ok(())
        } else {
            let issue = IssueRequest {
                title: notification.subject.clone(),
                body: render_summary_body(notification),
                labels: self.labels(notification.priority, false),
            };
            self.create_issue(&issue).await
        }
    }

    fn kind(&self) -> &'static str {
        "issues"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

fn render_record_body(record: &Opportunity, notification: &Notification) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "## {}", record.title);
    let _ = writeln!(body, "- ID: `{}`", record.id);
    if !record.notice_type.is_empty() {
        let _ = writeln!(body, "- Type: {}", record.notice_type);
    }
    if let Some(deadline) = &record.deadline {
        let _ = writeln!(body, "- Deadline: **{}**", deadline);
    }
    if !record.set_aside.is_empty() {
        let _ = writeln!(body, "- Set-aside: {}", record.set_aside);
    }
    if !record.link.is_empty() {
        let _ = writeln!(body, "- [View listing]({})", record.link);
    }
    if !record.description.is_empty() {
        let _ = writeln!(body, "\n{}", record.description);
    }
    let _ = writeln!(body, "\n_Query: {}_", notification.query_name);
    body
}

fn render_summary_body(notification: &Notification) -> String {
    let mut body = String::new();
    let _ = writeln!(
        body,
        "{} new, {} updated (query: {})\n",
        notification.summary.new,
        notification.summary.updated,
        notification.query_name
    );
    for record in &notification.records {
        let entry = if record.link.is_empty() {
            record.title.clone()
        } else {
            format!("[{}]({})", record.title, record.link)
        };
        match &record.deadline {
            Some(deadline) => {
                let _ = writeln!(body, "- {} (due {})", entry, deadline);
            }
            None => {
                let _ = writeln!(body, "- {}", entry);
            }
        }
    }
    body
}
