// src/pipeline/mod.rs

//! Pipeline stages for a monitoring run.
//!
//! - `dispatch`: run configured queries concurrently with retry/backoff
//! - `recovery`: classify failures and apply per-kind recovery strategies
//! - `diff`: classify fetched records against the tracked state
//! - `monitor`: orchestrate a full run end to end

pub mod diff;
pub mod dispatch;
pub mod fingerprint;
pub mod monitor;
pub mod recovery;

pub use diff::{DiffResult, Differ};
pub use dispatch::{QueryDispatcher, QueryResult};
pub use fingerprint::fingerprint;
pub use monitor::{Monitor, RunReport};
pub use recovery::{ErrorKind, FailurePolicy, classify, failure_report};
