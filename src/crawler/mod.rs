//! Fetching: the scraper seam, the HTTP implementation and per-URL orchestration
//!
//! The engine never interprets page content. Anything implementing [`Scraper`]
//! can be plugged into a [`UrlProcessor`]; [`HttpScraper`] is the production
//! implementation.

pub mod fallback;
pub mod fetcher;
pub mod processor;
pub mod url;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::utils::error::FetchError;

pub use fallback::{ArchiveSource, FallbackKind, FallbackSource, MirrorSource};
pub use fetcher::{HttpScraper, HttpScraperConfig};
pub use processor::{
    FallbackConfig, ParallelConfig, TimeoutConfig, UrlProcessResult, UrlProcessor,
    UrlProcessorConfig,
};

/// Per-request options passed through to the scraper
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Overrides the scraper's own request timeout
    pub timeout: Option<Duration>,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
}

impl FetchOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// What a scraper returns for one URL
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedPage {
    pub content: String,
    pub title: Option<String>,
    pub content_type: Option<String>,
    /// Free-form details (status, final URL, ...)
    pub metadata: HashMap<String, String>,
}

impl ScrapedPage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Content retrieval for one URL
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<ScrapedPage, FetchError>;
}
