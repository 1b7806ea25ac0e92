//! Diff classification against the tracked state.
//!
//! Each fetched record is classified as New, Updated, or Existing by the
//! corresponding state-store upsert, so classification and state update
//! happen atomically per record and never read stale state in a second pass.

use std::collections::HashSet;
use std::fmt::Write as _;

use chrono::{Duration, Utc};

use crate::models::Opportunity;
use crate::state::{StateStore, TrackedState, UpsertOutcome};

/// Partition of one query's fetched records.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    pub new: Vec<Opportunity>,
    pub updated: Vec<Opportunity>,
    pub existing: Vec<Opportunity>,
}

impl DiffResult {
    pub fn has_changes(&self) -> bool {
        !self.new.is_empty() || !self.updated.is_empty()
    }

    pub fn total(&self) -> usize {
        self.new.len() + self.updated.len() + self.existing.len()
    }
}

/// Classifier for fetched record batches.
#[derive(Debug, Clone, Default)]
pub struct Differ {
    verbose: bool,
}

impl Differ {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Classify `records` against the store, updating it as a side effect.
    ///
    /// Per-record classification is independent; ordering of the batch does
    /// not affect the resulting partition. The partition is exact:
    /// `new + updated + existing == records.len()`.
    pub fn diff(&self, records: &[Opportunity], store: &StateStore) -> DiffResult {
        let mut result = DiffResult::default();

        for record in records {
            // Pre-upsert snapshot, only consulted for verbose field logging
            let previous = if self.verbose {
                store.get(&record.id)
            } else {
                None
            };

            match store.upsert(record) {
                UpsertOutcome::New => {
                    if self.verbose {
                        log::debug!("NEW: {} - {}", record.id, record.title);
                    }
                    result.new.push(record.clone());
                }
                UpsertOutcome::Updated => {
                    if self.verbose {
                        let fields = previous
                            .as_ref()
                            .map(|prev| changed_fields(prev, record).join(", "))
                            .unwrap_or_default();
                        log::debug!("UPDATED: {} - {} ({})", record.id, record.title, fields);
                    }
                    result.updated.push(record.clone());
                }
                UpsertOutcome::Unchanged => result.existing.push(record.clone()),
            }
        }

        if self.verbose {
            log::debug!(
                "Diff complete: {} new, {} updated, {} existing",
                result.new.len(),
                result.updated.len(),
                result.existing.len()
            );
        }

        result
    }

    /// Tracked entries absent from the current batch and unseen for longer
    /// than `max_age`. Does not mutate the store; callers decide whether to
    /// flag them via [`StateStore::mark_expired`].
    pub fn find_expired(
        &self,
        current_ids: &HashSet<String>,
        store: &StateStore,
        max_age: Duration,
    ) -> Vec<TrackedState> {
        let cutoff = Utc::now() - max_age;

        let expired: Vec<TrackedState> = store
            .entries()
            .into_iter()
            .filter(|entry| {
                !entry.expired && !current_ids.contains(&entry.id) && entry.last_seen < cutoff
            })
            .collect();

        if self.verbose && !expired.is_empty() {
            log::debug!("Detected {} expired records", expired.len());
        }

        expired
    }
}

/// Names of identity fields that differ between the stored snapshot and the
/// current record. Used only for logging and reports.
fn changed_fields(previous: &TrackedState, current: &Opportunity) -> Vec<&'static str> {
    let mut fields = Vec::new();

    if previous.title != current.title {
        fields.push("title");
    }
    if previous.deadline != current.deadline {
        fields.push("deadline");
    }
    if fields.is_empty() {
        // Fingerprint moved without a tracked display field changing
        fields.push("content");
    }
    fields
}

/// Human-readable summary of a diff for one query.
pub fn diff_report(diff: &DiffResult, query_name: &str) -> String {
    const LISTED: usize = 5;

    let mut report = String::new();
    let _ = writeln!(report, "=== Diff for query: {} ===", query_name);
    let _ = writeln!(report, "New: {}", diff.new.len());
    let _ = writeln!(report, "Updated: {}", diff.updated.len());
    let _ = writeln!(report, "Existing: {}", diff.existing.len());

    for (label, records) in [("NEW", &diff.new), ("UPDATED", &diff.updated)] {
        if records.is_empty() {
            continue;
        }
        let _ = writeln!(report, "\n{}:", label);
        for record in records.iter().take(LISTED) {
            let _ = writeln!(report, "  - {}: {}", record.id, record.title);
        }
        if records.len() > LISTED {
            let _ = writeln!(report, "  ... and {} more", records.len() - LISTED);
        }
    }

    report
}
