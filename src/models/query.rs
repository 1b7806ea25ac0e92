//! Search query configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Notification urgency level attached to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// A typed query parameter value.
///
/// Parameter maps are validated at configuration load; by the time the core
/// runs, every value converts to a wire string without error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Text(String),
    List(Vec<String>),
    Number(i64),
    Flag(bool),
}

impl ParamValue {
    /// Convert to the wire representation used in request parameters.
    ///
    /// Lists join with commas, which is how the upstream API accepts
    /// multi-valued parameters.
    pub fn to_param(&self) -> String {
        match self {
            ParamValue::Text(s) => s.trim().to_string(),
            ParamValue::List(items) => items.join(","),
            ParamValue::Number(n) => n.to_string(),
            ParamValue::Flag(b) => b.to_string(),
        }
    }

    /// Whether the value carries no usable content.
    pub fn is_empty(&self) -> bool {
        match self {
            ParamValue::Text(s) => s.trim().is_empty(),
            ParamValue::List(items) => items.is_empty(),
            ParamValue::Number(_) | ParamValue::Flag(_) => false,
        }
    }
}

/// A configured search query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Unique query name, used for reporting and state metrics
    pub name: String,

    /// Disabled queries are skipped without a network call
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Notification priority for this query's results
    #[serde(default = "default_priority")]
    pub priority: Priority,

    /// Recipients for this query's notifications
    #[serde(default)]
    pub recipients: Vec<String>,

    /// Per-query lookback override in days
    #[serde(default)]
    pub lookback_days: Option<i64>,

    /// Search parameters forwarded to the upstream API.
    ///
    /// BTreeMap keeps serialization order stable across runs.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamValue>,
}

fn default_enabled() -> bool {
    true
}

fn default_priority() -> Priority {
    Priority::Medium
}

/// Parameters considered essential when a query is simplified.
const ESSENTIAL_PARAMS: [&str; 2] = ["title", "organization"];

impl Query {
    /// A reduced version of this query, keeping only essential parameters.
    ///
    /// Used as a recovery strategy when the upstream rejects or chokes on the
    /// full parameter set.
    pub fn simplified(&self) -> Query {
        let mut simplified = self.clone();
        simplified.parameters = self
            .parameters
            .iter()
            .filter(|(key, _)| ESSENTIAL_PARAMS.contains(&key.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        // Narrow multi-type searches down to plain solicitations
        if self.parameters.contains_key("notice_type") {
            simplified.parameters.insert(
                "notice_type".to_string(),
                ParamValue::Text("solicitation".to_string()),
            );
        }
        simplified
    }

    /// A minimal fallback query carrying a single best-effort search term.
    pub fn fallback(&self) -> Query {
        let mut fallback = self.clone();
        let mut params = BTreeMap::new();

        if let Some(title) = self.parameters.get("title") {
            params.insert("title".to_string(), title.clone());
        } else if let Some(org) = self.parameters.get("organization") {
            params.insert("organization".to_string(), org.clone());
        } else {
            // Last resort: any solicitation
            params.insert(
                "notice_type".to_string(),
                ParamValue::Text("solicitation".to_string()),
            );
        }

        fallback.parameters = params;
        fallback
    }

    /// Validate the query definition.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("query name is empty".to_string());
        }
        if let Some(days) = self.lookback_days {
            if days <= 0 {
                return Err(format!("query '{}': lookback_days must be > 0", self.name));
            }
        }
        for (key, value) in &self.parameters {
            if key.trim().is_empty() {
                return Err(format!("query '{}': empty parameter name", self.name));
            }
            if value.is_empty() {
                return Err(format!("query '{}': parameter '{}' is empty", self.name, key));
            }
        }
        Ok(())
    }
}
