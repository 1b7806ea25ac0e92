//! Request parameter construction.
//!
//! Turns a configured [`Query`] into the flat string map the upstream search
//! API accepts: posted-date window from the lookback setting, pagination
//! defaults, then the query's own typed parameters.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};

use crate::models::Query;

const PAGE_LIMIT: &str = "100";

/// Build the wire parameter map for `query`.
///
/// The query's own `lookback_days` overrides the global default.
pub fn build_params(query: &Query, default_lookback_days: i64) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();

    let lookback = query.lookback_days.unwrap_or(default_lookback_days).max(1);
    let to = Utc::now().date_naive();
    let from = to - Duration::days(lookback);
    params.insert("posted_from".to_string(), from.format("%Y-%m-%d").to_string());
    params.insert("posted_to".to_string(), to.format("%Y-%m-%d").to_string());

    params.insert("limit".to_string(), PAGE_LIMIT.to_string());
    params.insert("offset".to_string(), "0".to_string());

    for (key, value) in &query.parameters {
        let converted = value.to_param();
        if !converted.is_empty() {
            params.insert(key.clone(), converted);
        }
    }

    params
}
