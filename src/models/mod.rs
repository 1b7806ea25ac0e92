// src/models/mod.rs

//! Domain models for the monitor application.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod opportunity;
mod query;

// Re-export all public types
pub use config::{
    ChannelsConfig, Config, EmailConfig, IssueConfig, MonitorConfig, RetryConfig, WebhookConfig,
};
pub use opportunity::{Opportunity, SearchResponse};
pub use query::{ParamValue, Priority, Query};
