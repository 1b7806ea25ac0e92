//! Tracked-state store implementation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::Opportunity;
use crate::pipeline::fingerprint;

/// How an upsert classified the observed record, decided in one critical
/// section so classification never races a concurrent update to the same ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First observation, or reappearance of an expired entry
    New,
    /// Fingerprint changed since the last observation
    Updated,
    /// Fingerprint unchanged; only `last_seen` moved
    Unchanged,
}

impl UpsertOutcome {
    pub fn is_new(&self) -> bool {
        matches!(self, UpsertOutcome::New)
    }
}

/// Persisted metadata for a single tracked opportunity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackedState {
    pub id: String,

    /// Cached for reporting
    pub title: String,

    /// Set once at first observation, immutable afterwards
    pub first_seen: DateTime<Utc>,

    /// Bumped on every observation
    pub last_seen: DateTime<Utc>,

    /// Bumped only when the fingerprint changes
    pub last_modified: DateTime<Utc>,

    /// Content hash over identity fields
    pub fingerprint: String,

    /// Cached deadline for reminder purposes
    #[serde(default)]
    pub deadline: Option<String>,

    /// Set when the record disappeared from active listings; a flagged entry
    /// that reappears is reported as New again rather than Updated.
    #[serde(default)]
    pub expired: bool,
}

/// Execution metrics kept per configured query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub last_executed: Option<DateTime<Utc>>,
    pub execution_count: u64,
    pub error_count: u64,
    #[serde(default)]
    pub last_error: String,
    /// Rolling average execution time in milliseconds
    pub average_ms: u64,
    pub last_record_count: usize,
    pub total_records_found: usize,
}

/// On-disk layout of the state file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    opportunities: HashMap<String, TrackedState>,

    #[serde(default)]
    last_run: Option<DateTime<Utc>>,

    #[serde(default)]
    query_metrics: HashMap<String, QueryMetrics>,
}

#[derive(Debug, Default)]
struct Inner {
    data: StateFile,
    dirty: bool,
}

/// Durable, concurrency-safe store of per-record tracking state.
///
/// Readers take a shared lock; each upsert takes the exclusive lock for one
/// map-entry mutation only. No I/O happens under the lock except the
/// temp-file write inside [`StateStore::save`], which is the final snapshot.
#[derive(Debug)]
pub struct StateStore {
    inner: RwLock<Inner>,
    path: Option<PathBuf>,
}

impl StateStore {
    /// Create an in-memory store with no backing file.
    pub fn in_memory() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            path: None,
        }
    }

    /// Load the store from `path`.
    ///
    /// A missing file yields an empty store. A corrupt file is logged and
    /// also yields an empty store; corruption must never abort a run.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        let data = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<StateFile>(&bytes) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!(
                        "Corrupt state file {}, starting fresh: {}",
                        path.display(),
                        e
                    );
                    StateFile::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StateFile::default(),
            Err(e) => {
                log::warn!(
                    "Unreadable state file {}, starting fresh: {}",
                    path.display(),
                    e
                );
                StateFile::default()
            }
        };

        Self {
            inner: RwLock::new(Inner { data, dirty: false }),
            path: Some(path),
        }
    }

    /// Retrieve the tracked state for a record ID.
    pub fn get(&self, id: &str) -> Option<TrackedState> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.data.opportunities.get(id).cloned()
    }

    /// Insert or update tracking state for `record`.
    ///
    /// A missing entry is created (New); a previously expired entry that
    /// reappears is also reported as New. Otherwise `last_seen` is always
    /// bumped, and `last_modified` plus the fingerprint only when the
    /// content hash changed (Updated vs Unchanged).
    pub fn upsert(&self, record: &Opportunity) -> UpsertOutcome {
        let now = Utc::now();
        let hash = fingerprint(record);

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.dirty = true;

        match inner.data.opportunities.get_mut(&record.id) {
            Some(existing) => {
                existing.last_seen = now;

                let reappeared = existing.expired;
                let changed = existing.fingerprint != hash;
                if changed || reappeared {
                    existing.last_modified = now;
                    existing.fingerprint = hash;
                    existing.title = record.title.clone();
                    existing.deadline = record.deadline.clone();
                }
                existing.expired = false;

                if reappeared {
                    UpsertOutcome::New
                } else if changed {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Unchanged
                }
            }
            None => {
                inner.data.opportunities.insert(
                    record.id.clone(),
                    TrackedState {
                        id: record.id.clone(),
                        title: record.title.clone(),
                        first_seen: now,
                        last_seen: now,
                        last_modified: now,
                        fingerprint: hash,
                        deadline: record.deadline.clone(),
                        expired: false,
                    },
                );
                UpsertOutcome::New
            }
        }
    }

    /// Flag entries as expired. Returns how many entries changed.
    pub fn mark_expired(&self, ids: &[String]) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut changed = 0;

        for id in ids {
            if let Some(entry) = inner.data.opportunities.get_mut(id) {
                if !entry.expired {
                    entry.expired = true;
                    changed += 1;
                }
            }
        }

        if changed > 0 {
            inner.dirty = true;
        }
        changed
    }

    /// Remove entries whose `last_seen` is older than `max_age`.
    pub fn prune(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let before = inner.data.opportunities.len();
        inner.data.opportunities.retain(|_, opp| opp.last_seen >= cutoff);
        let removed = before - inner.data.opportunities.len();

        if removed > 0 {
            inner.dirty = true;
        }
        removed
    }

    /// Snapshot of all tracked entries.
    pub fn entries(&self) -> Vec<TrackedState> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.data.opportunities.values().cloned().collect()
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.data.opportunities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record the completion time of a monitoring run.
    pub fn set_last_run(&self, t: DateTime<Utc>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.data.last_run = Some(t);
        inner.dirty = true;
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.data.last_run
    }

    /// Fold one execution into the rolling metrics for `query_name`.
    pub fn update_query_metrics(
        &self,
        query_name: &str,
        duration: std::time::Duration,
        record_count: usize,
        error: Option<&str>,
    ) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let metrics = inner
            .data
            .query_metrics
            .entry(query_name.to_string())
            .or_default();

        metrics.last_executed = Some(Utc::now());
        metrics.execution_count += 1;
        metrics.last_record_count = record_count;
        metrics.total_records_found += record_count;

        let elapsed_ms = duration.as_millis() as u64;
        if metrics.execution_count == 1 {
            metrics.average_ms = elapsed_ms;
        } else {
            let total = metrics.average_ms * (metrics.execution_count - 1) + elapsed_ms;
            metrics.average_ms = total / metrics.execution_count;
        }

        match error {
            Some(msg) => {
                metrics.error_count += 1;
                metrics.last_error = msg.to_string();
            }
            None => metrics.last_error.clear(),
        }

        inner.dirty = true;
    }

    pub fn query_metrics(&self, query_name: &str) -> Option<QueryMetrics> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.data.query_metrics.get(query_name).cloned()
    }

    /// Summary statistics over the tracked entries.
    pub fn stats(&self) -> StateStats {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        let mut stats = StateStats {
            total_tracked: inner.data.opportunities.len(),
            last_run: inner.data.last_run,
            total_queries: inner.data.query_metrics.len(),
            ..StateStats::default()
        };

        for opp in inner.data.opportunities.values() {
            let age_days = (now - opp.first_seen).num_days();
            if age_days <= 7 {
                stats.tracked_last_week += 1;
            }
            if age_days <= 30 {
                stats.tracked_last_month += 1;
            }
        }

        let total: u64 = inner
            .data
            .query_metrics
            .values()
            .map(|m| m.execution_count)
            .sum();
        let errors: u64 = inner
            .data
            .query_metrics
            .values()
            .map(|m| m.error_count)
            .sum();
        if total > 0 {
            stats.query_success_rate = (total - errors) as f64 / total as f64;
        }

        stats
    }

    /// Persist the store to its backing file atomically.
    ///
    /// Serializes under the lock to a temp file, then renames over the
    /// target so a crash mid-write never corrupts the on-disk state.
    /// No-op for in-memory stores and when nothing changed since load.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let tmp = path.with_extension("tmp");
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if !inner.dirty {
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let bytes = serde_json::to_vec_pretty(&inner.data)?;
        std::fs::write(&tmp, bytes)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        // Only a completed rename counts as persisted; a failed save must
        // leave the store dirty so the next save retries.
        inner.dirty = false;
        Ok(())
    }
}

/// Summary statistics about the tracked state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateStats {
    pub total_tracked: usize,
    pub tracked_last_week: usize,
    pub tracked_last_month: usize,
    pub last_run: Option<DateTime<Utc>>,
    pub total_queries: usize,
    pub query_success_rate: f64,
}
