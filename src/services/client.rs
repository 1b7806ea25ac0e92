//! Upstream search API client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{AppError, Result};
use crate::models::{MonitorConfig, SearchResponse};

/// The search operation the dispatcher depends on.
///
/// A trait seam so query execution is testable without a network.
#[async_trait]
pub trait SearchClient: Send + Sync {
    /// Execute a search. `timeout` bounds the whole call; implementations
    /// must return promptly once it elapses.
    async fn search(
        &self,
        params: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<SearchResponse>;
}

/// reqwest-backed [`SearchClient`].
pub struct HttpSearchClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpSearchClient {
    /// Create a client from monitor configuration and an API key.
    pub fn new(config: &MonitorConfig, api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.api_url.clone(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(
        &self,
        params: &BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<SearchResponse> {
        if self.api_key.is_empty() {
            return Err(AppError::config("API key is required"));
        }

        let mut url = url::Url::parse(&self.base_url)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("api_key", &self.api_key);
            for (key, value) in params {
                if !value.is_empty() {
                    pairs.append_pair(key, value);
                }
            }
        }

        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .timeout(timeout)
            .send()
            .await?;

        if let Some(remaining) = response.headers().get("X-RateLimit-Remaining") {
            log::debug!("Rate limit remaining: {:?}", remaining);
        }

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(AppError::api(status.as_u16(), truncate(&message, 300)));
        }

        Ok(response.json::<SearchResponse>().await?)
    }
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut end = limit;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
