// src/lib.rs

//! bidwatch library

pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod services;
pub mod state;
pub mod utils;
