//! Chat webhook channel (Slack-compatible incoming webhook).

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::{Priority, WebhookConfig};
use crate::notify::{Notification, Notifier};

/// Records listed in full before the message switches to a "+N more" line.
const MAX_LISTED: usize = 10;

pub struct SlackNotifier {
    config: WebhookConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
}

impl SlackNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.config.url.is_empty() {
            return Err(AppError::config("webhook channel enabled without a URL"));
        }

        let payload = WebhookPayload {
            text: render_message(notification),
            username: self.config.username.as_deref(),
            channel: self.config.channel.as_deref(),
        };

        let response = self
            .client
            .post(&self.config.url)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::notify(format!(
                "webhook returned {}",
                status.as_u16()
            )));
        }
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "slack"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

fn render_message(notification: &Notification) -> String {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "{} *{}*",
        priority_marker(notification.priority),
        notification.subject
    );

    let summary = &notification.summary;
    if summary.new > 0 {
        let _ = writeln!(text, "New: {}", summary.new);
    }
    if summary.updated > 0 {
        let _ = writeln!(text, "Updated: {}", summary.updated);
    }
    if summary.upcoming_deadlines > 0 {
        let _ = writeln!(text, "Deadlines in 30 days: {}", summary.upcoming_deadlines);
    }
    text.push('\n');

    for record in notification.records.iter().take(MAX_LISTED) {
        let title = if record.link.is_empty() {
            record.title.clone()
        } else {
            format!("<{}|{}>", record.link, record.title)
        };
        match &record.deadline {
            Some(deadline) => {
                let _ = writeln!(text, "• {} (due {})", title, deadline);
            }
            None => {
                let _ = writeln!(text, "• {}", title);
            }
        }
    }
    if notification.records.len() > MAX_LISTED {
        let _ = writeln!(text, "... and {} more", notification.records.len() - MAX_LISTED);
    }

    text
}

fn priority_marker(priority: Priority) -> &'static str {
    match priority {
        Priority::High => ":rotating_light:",
        Priority::Medium => ":bell:",
        Priority::Low => ":page_with_curl:",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::models::{Opportunity, Query};

    fn notification(count: usize) -> Notification {
        let query = Query {
            name: "roads".to_string(),
            enabled: true,
            priority: Priority::High,
            recipients: vec![],
            lookback_days: None,
            parameters: BTreeMap::new(),
        };
        let records = (0..count)
            .map(|i| Opportunity {
                id: format!("R{i}"),
                title: format!("Road Work {i}"),
                posted_date: String::new(),
                notice_type: String::new(),
                deadline: if i == 0 {
                    Some("2026-09-15".to_string())
                } else {
                    None
                },
                set_aside: String::new(),
                classification_code: String::new(),
                description: String::new(),
                link: format!("https://example.com/R{i}"),
            })
            .collect();
        Notification::for_new(&query, records)
    }

    #[test]
    fn test_render_includes_subject_and_links() {
        let text = render_message(&notification(2));
        assert!(text.contains(":rotating_light:"));
        assert!(text.contains("*2 new opportunities: roads*"));
        assert!(text.contains("<https://example.com/R0|Road Work 0> (due 2026-09-15)"));
        assert!(text.contains("New: 2"));
    }

    #[test]
    fn test_render_truncates_long_lists() {
        let text = render_message(&notification(14));
        assert!(text.contains("... and 4 more"));
        assert!(!text.contains("Road Work 12"));
    }

    #[tokio::test]
    async fn test_disabled_channel_is_noop() {
        let notifier = SlackNotifier::new(WebhookConfig::default()).unwrap();
        assert!(!notifier.is_enabled());
        assert!(notifier.send(&notification(1)).await.is_ok());
    }
}
