//! Email channel, delivered through an HTTP mail submission API.

use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::models::EmailConfig;
use crate::notify::{Notification, Notifier};

pub struct EmailNotifier {
    config: EmailConfig,
    client: Client,
}

#[derive(Debug, Serialize)]
struct MailRequest<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    text: String,
    html: String,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { config, client })
    }

    /// Recipients from the notification when present, config defaults otherwise.
    fn recipients<'a>(&'a self, notification: &'a Notification) -> &'a [String] {
        if notification.recipients.is_empty() {
            &self.config.to_addresses
        } else {
            &notification.recipients
        }
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        if self.config.api_url.is_empty() || self.config.from_address.is_empty() {
            return Err(AppError::config(
                "email channel enabled without api_url/from_address",
            ));
        }
        let to = self.recipients(notification);
        if to.is_empty() {
            return Err(AppError::config("email channel has no recipients"));
        }

        let request = MailRequest {
            from: &self.config.from_address,
            to,
            subject: &notification.subject,
            text: render_text(notification),
            html: render_html(notification),
        };

        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_token)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::notify(format!(
                "mail API returned {}",
                status.as_u16()
            )));
        }

        log::debug!("Mail submitted to {} recipient(s)", to.len());
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "email"
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}

fn render_text(notification: &Notification) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "{}", notification.subject);
    let _ = writeln!(body, "Query: {}", notification.query_name);
    let _ = writeln!(
        body,
        "New: {}  Updated: {}  Deadlines in 30 days: {}",
        notification.summary.new,
        notification.summary.updated,
        notification.summary.upcoming_deadlines
    );
    body.push('\n');

    for record in &notification.records {
        let _ = writeln!(body, "- {} ({})", record.title, record.id);
        if let Some(deadline) = &record.deadline {
            let _ = writeln!(body, "  Due: {}", deadline);
        }
        if !record.link.is_empty() {
            let _ = writeln!(body, "  {}", record.link);
        }
    }
    body
}

fn render_html(notification: &Notification) -> String {
    let mut body = String::new();
    let _ = writeln!(body, "<h2>{}</h2>", escape(&notification.subject));
    let _ = writeln!(
        body,
        "<p>New: {} &middot; Updated: {} &middot; Deadlines in 30 days: {}</p>",
        notification.summary.new,
        notification.summary.updated,
        notification.summary.upcoming_deadlines
    );
    body.push_str("<ul>\n");
    for record in &notification.records {
        let title = escape(&record.title);
        let entry = if record.link.is_empty() {
            title
        } else {
            format!("<a href=\"{}\">{}</a>", escape(&record.link), title)
        };
        match &record.deadline {
            Some(deadline) => {
                let _ = writeln!(body, "<li>{} (due {})</li>", entry, escape(deadline));
            }
            None => {
                let _ = writeln!(body, "<li>{}</li>", entry);
            }
        }
    }
    body.push_str("</ul>\n");
    body
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
