//! Configuration management for the tansaek engine
//!
//! Configuration is loaded from a TOML file, from `TANSAEK_*` environment
//! variables, or both (file first, then environment overrides). Every section
//! has defaults, so an empty file is a valid configuration.
//!
//! ```toml
//! [executor]
//! max_concurrency = 8
//!
//! [executor.rate_limiter]
//! max_per_domain = 2
//!
//! [processor.timeouts]
//! per_url_ms = 15000
//!
//! [iteration]
//! max_iterations = 4
//! convergence_threshold = 0.05
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::concurrency::ParallelExecutorConfig;
use crate::crawler::{HttpScraperConfig, UrlProcessorConfig};
use crate::error::{Error, Result};
use crate::iteration::IterationConfig;
use crate::storage::CheckpointConfig;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "TANSAEK_";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executor: ParallelExecutorConfig,
    pub processor: UrlProcessorConfig,
    pub scraper: HttpScraperConfig,
    pub iteration: IterationConfig,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

/// Parse an override if set; a malformed value is a configuration error
fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_var(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            Error::config(format!("{ENV_PREFIX}{name}: cannot parse '{raw}'"))
        }),
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        toml::from_str(&content).map_err(|e| {
            Error::config(format!(
                "Failed to parse TOML config file {}: {e}",
                path.display()
            ))
        })
    }

    /// File (when given) plus environment overrides, validated
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay the supported `TANSAEK_*` variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_parse("MAX_CONCURRENCY")? {
            self.executor.max_concurrency = v;
        }
        if let Some(v) = env_parse("MAX_PER_DOMAIN")? {
            self.executor.rate_limiter.max_per_domain = v;
            self.processor.parallel.max_per_domain = v;
        }
        if let Some(v) = env_parse("ENABLE_ADAPTIVE")? {
            self.executor.enable_adaptive = v;
        }
        if let Some(v) = env_parse("MAX_RETRIES")? {
            self.executor.retry.max_retries = v;
            self.processor.retry.max_retries = v;
        }
        if let Some(v) = env_parse("REQUEST_INTERVAL_MS")? {
            self.processor.parallel.request_interval_ms = v;
        }
        if let Some(v) = env_parse("PER_URL_TIMEOUT_MS")? {
            self.processor.timeouts.per_url_ms = v;
        }
        if let Some(v) = env_parse("CACHE_MAX_ENTRIES")? {
            self.processor.cache.max_entries = v;
        }
        if let Some(v) = env_parse("MAX_ITERATIONS")? {
            self.iteration.max_iterations = v;
        }
        if let Some(v) = env_parse("CONVERGENCE_THRESHOLD")? {
            self.iteration.convergence_threshold = v;
        }
        if let Some(v) = env_var("USER_AGENT") {
            self.scraper.user_agent = Some(v);
        }
        if let Some(v) = env_var("CHECKPOINT_DIR") {
            self.checkpoint.dir = v.into();
        }
        if let Some(v) = env_var("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env_var("LOG_FORMAT") {
            self.logging.format = v;
        }
        Ok(())
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.executor.validate()?;
        self.processor.validate()?;
        self.iteration.validate()?;

        if self.scraper.timeout_ms == 0 {
            return Err(Error::config("scraper.timeout_ms must be greater than 0"));
        }
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(Error::config(format!(
                "logging.format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }
}
