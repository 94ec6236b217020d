//! Crate-level error type
//!
//! Only setup work can fail through [`Result`]: building a component from an
//! invalid config, loading a config file, reading or writing a checkpoint.
//! A URL that cannot be fetched is not an `Err`; it shows up as a failed
//! `TaskResult` or `UrlProcessResult` and the run carries on.

use std::io;
use thiserror::Error;

pub use crate::utils::error::{FetchError, QueueError};

/// Behaviour shared by the crate's error types
pub trait EngineErrorTrait: std::error::Error {
    /// Whether repeating the failed operation could plausibly succeed
    fn is_recoverable(&self) -> bool;

    /// Coarse grouping used by logs and the CLI exit path
    fn category(&self) -> ErrorCategory;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Talking to remote hosts
    Network,
    /// Queue capacity and task admission
    Scheduling,
    /// Checkpoints and the local filesystem
    Storage,
    /// Rejected settings
    Config,
    Other,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Scheduling => "scheduling",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("queue rejected task: {0}")]
    Queue(#[from] QueueError),

    /// A setting failed validation or could not be parsed
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Session `name` could not be saved or restored
    #[error("checkpoint '{name}' unusable: {reason}")]
    Checkpoint { name: String, reason: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http client: {0}")]
    Http(#[from] reqwest::Error),

    /// Anything raised by caller-supplied code (planners, task closures)
    #[error("{0:#}")]
    External(#[from] anyhow::Error),
}

impl EngineErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_recoverable(),
            // a full queue drains as running tasks finish
            Self::Queue(_) => true,
            Self::Io(_) | Self::Http(_) => true,
            Self::Config(_) | Self::Checkpoint { .. } | Self::Json(_) | Self::External(_) => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch(_) | Self::Http(_) => ErrorCategory::Network,
            Self::Queue(_) => ErrorCategory::Scheduling,
            Self::Checkpoint { .. } | Self::Io(_) | Self::Json(_) => ErrorCategory::Storage,
            Self::Config(_) => ErrorCategory::Config,
            Self::External(_) => ErrorCategory::Other,
        }
    }
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn checkpoint(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Checkpoint {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
