// src/services/mod.rs

//! Service layer for the monitor application.
//!
//! - Upstream search access (`SearchClient` / `HttpSearchClient`)
//! - Request parameter construction (`build_params`)
//! - Response caching (`ResponseCache` / `CachingClient`)

mod cache;
mod client;
mod params;

pub use cache::{CacheStats, CachingClient, ResponseCache};
pub use client::{HttpSearchClient, SearchClient};
pub use params::build_params;
