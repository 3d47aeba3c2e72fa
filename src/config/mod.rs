//! Configuration management for the request-defense gateway.
//!
//! This module handles loading application configuration from an optional
//! TOML file and `SHIELD__`-prefixed environment variables.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

pub const DEFAULT_CONFIG_FILE: &str = "config/default.toml";

/// Load configuration from the file named by `CONFIG_FILE` and the environment
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
    load_from(&config_file)
}

/// Environment variables override file values, e.g.
/// `SHIELD__RATE_LIMIT__DEFAULT_LIMIT=50` or `SHIELD__STORAGE__BACKEND=redis`.
pub fn load_from(config_file: &str) -> Result<Config, ConfigError> {
    let config = ConfigBuilder::builder()
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("rate_limit.default_limit", 100)?
        .set_default("rate_limit.window_seconds", 60)?
        .add_source(File::with_name(config_file).required(false))
        .add_source(
            Environment::with_prefix("SHIELD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    config.try_deserialize()
}
