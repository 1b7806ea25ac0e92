//! Opportunity record structures.

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A single opportunity record fetched from the listing API.
///
/// Read-only to the monitoring core; only the identity-relevant fields are
/// modeled here, not the full upstream schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Opportunity {
    /// Stable upstream identifier
    pub id: String,

    /// Opportunity title
    pub title: String,

    /// Date the opportunity was posted (YYYY-MM-DD)
    #[serde(default)]
    pub posted_date: String,

    /// Notice type (solicitation, presolicitation, award, ...)
    #[serde(default)]
    pub notice_type: String,

    /// Response deadline (YYYY-MM-DD), absent for some notice types
    #[serde(default)]
    pub deadline: Option<String>,

    /// Set-aside code, empty when unrestricted
    #[serde(default)]
    pub set_aside: String,

    /// Industry classification code
    #[serde(default)]
    pub classification_code: String,

    /// Free-text description
    #[serde(default)]
    pub description: String,

    /// Link to the upstream listing page
    #[serde(default)]
    pub link: String,
}

impl Opportunity {
    /// Parse the response deadline, if present and well-formed.
    ///
    /// An absent or unparseable deadline is never an error; it simply means
    /// no deadline-based handling applies to this record.
    pub fn parsed_deadline(&self) -> Option<NaiveDate> {
        self.deadline
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    }

    /// Whether the deadline falls within the next `days` days (exclusive of
    /// past deadlines).
    pub fn deadline_within_days(&self, days: i64) -> bool {
        let Some(deadline) = self.parsed_deadline() else {
            return false;
        };
        let today = Utc::now().date_naive();
        deadline > today && deadline <= today + Duration::days(days)
    }
}

/// Response payload of the upstream search operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Total matching records upstream (may exceed the returned page)
    #[serde(default)]
    pub total: usize,

    /// Returned records
    #[serde(default)]
    pub items: Vec<Opportunity>,
}
