//! Error types for fetching and task scheduling
//!
//! These are the domain-level errors raised inside a single fetch attempt or
//! queue operation. They are wrapped by [`crate::error::Error`] at module
//! boundaries.

use thiserror::Error;

/// Errors that can occur during a single fetch attempt
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP transport error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Rate limit exceeded (HTTP 429)
    #[error("Rate limit exceeded")]
    RateLimit,

    /// Non-success status code
    #[error("Server responded with status {status}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Whether repeating the request may succeed
        retryable: bool,
    },

    /// Attempt did not finish before its deadline
    #[error("Request timeout")]
    Timeout,

    /// Content decoding error
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// No source (primary or fallback) produced content
    #[error("All sources exhausted for {url}: {last_error}")]
    Exhausted {
        /// The URL that could not be retrieved
        url: String,
        /// Message of the last error seen
        last_error: String,
    },

    /// Failure raised by a custom scraper or fallback implementation
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Whether a retry of the same request may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_builder() && !e.is_redirect(),
            Self::RateLimit | Self::Timeout => true,
            Self::Status { retryable, .. } => *retryable,
            Self::Decode(_) | Self::InvalidUrl(_) | Self::Exhausted { .. } => false,
            Self::Other(_) => true,
        }
    }

    /// Classify an HTTP status code
    ///
    /// Retry on 429, 500, 502, 503 and 504; everything else is final.
    pub fn from_status(status: u16) -> Self {
        if status == 429 {
            return Self::RateLimit;
        }
        Self::Status {
            status,
            retryable: matches!(status, 500 | 502 | 503 | 504),
        }
    }
}

/// Errors raised by the priority queue
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue already holds `max_size` tasks
    #[error("Queue is full (max size {max_size})")]
    Full { max_size: usize },

    /// A task with the same id is already queued
    #[error("Task {0} is already queued")]
    Duplicate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(FetchError::from_status(429), FetchError::RateLimit));
        assert!(FetchError::from_status(503).is_recoverable());
        assert!(FetchError::from_status(500).is_recoverable());
        assert!(!FetchError::from_status(404).is_recoverable());
        assert!(!FetchError::from_status(403).is_recoverable());
    }

    #[test]
    fn test_timeout_is_recoverable() {
        assert!(FetchError::Timeout.is_recoverable());
        assert!(!FetchError::InvalidUrl("nope".into()).is_recoverable());
    }
}
