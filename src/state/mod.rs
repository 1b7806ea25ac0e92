// src/state/mod.rs

//! Persistent tracking state for monitored opportunities.
//!
//! The store owns one [`TrackedState`] entry per record ID and is the only
//! component that mutates them. Entries survive across runs in a single JSON
//! file written atomically (temp file + rename).

mod store;

pub use store::{QueryMetrics, StateStats, StateStore, TrackedState, UpsertOutcome};
