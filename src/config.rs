// src/config.rs

//! Configuration loading utilities.

use std::path::Path;

use crate::error::{AppError, Result};
use crate::models::Config;

/// Load and validate configuration from a TOML file.
///
/// Unlike [`Config::load_or_default`], this fails loudly; it backs the
/// `validate` subcommand and anything else that must not run on defaults.
pub fn load_validated(path: &Path) -> Result<Config> {
    let config = Config::load(path)
        .map_err(|e| AppError::config(format!("loading {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

/// Read the upstream API key from the environment.
pub fn api_key_from_env() -> Result<String> {
    std::env::var("BIDWATCH_API_KEY")
        .map_err(|_| AppError::config("BIDWATCH_API_KEY environment variable is not set"))
}
