//! Alternate content sources consulted after the primary fetch gives up

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use url::Url;

use super::{FetchOptions, ScrapedPage, Scraper};
use crate::utils::error::FetchError;

/// Default Wayback Machine prefix
pub const DEFAULT_ARCHIVE_PREFIX: &str = "https://web.archive.org/web/";

/// Kind of fallback source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackKind {
    /// Stale entry still resident in the content cache
    Cache,
    /// Web archive snapshot
    Archive,
    /// Mirror host
    Mirror,
}

impl FallbackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Archive => "archive",
            Self::Mirror => "mirror",
        }
    }
}

impl fmt::Display for FallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network-backed fallback
///
/// The cache fallback is handled by the processor itself since it needs the
/// processor's cache; sources registered here cover archive and mirror.
#[async_trait]
pub trait FallbackSource: Send + Sync {
    fn kind(&self) -> FallbackKind;

    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<ScrapedPage, FetchError>;
}

/// Fetches archived snapshots as `{prefix}{url}`
pub struct ArchiveSource {
    scraper: Arc<dyn Scraper>,
    prefix: String,
}

impl ArchiveSource {
    pub fn new(scraper: Arc<dyn Scraper>) -> Self {
        Self::with_prefix(scraper, DEFAULT_ARCHIVE_PREFIX)
    }

    pub fn with_prefix(scraper: Arc<dyn Scraper>, prefix: impl Into<String>) -> Self {
        Self {
            scraper,
            prefix: prefix.into(),
        }
    }

    pub fn archive_url(&self, url: &str) -> String {
        format!("{}{}", self.prefix, url)
    }
}

#[async_trait]
impl FallbackSource for ArchiveSource {
    fn kind(&self) -> FallbackKind {
        FallbackKind::Archive
    }

    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<ScrapedPage, FetchError> {
        let archived = self.archive_url(url);
        tracing::debug!(url = %url, archive_url = %archived, "Trying archive fallback");
        self.scraper.fetch(&archived, options).await
    }
}

/// Rewrites the host of a URL to a configured mirror
pub struct MirrorSource {
    scraper: Arc<dyn Scraper>,
    /// lower-cased host -> mirror host
    mirrors: HashMap<String, String>,
}

impl MirrorSource {
    pub fn new(scraper: Arc<dyn Scraper>, mirrors: HashMap<String, String>) -> Self {
        let mirrors = mirrors
            .into_iter()
            .map(|(host, mirror)| (host.to_lowercase(), mirror))
            .collect();
        Self { scraper, mirrors }
    }

    /// Mirror URL for `url`, or `None` when its host has no mirror
    pub fn mirror_url(&self, url: &str) -> Option<String> {
        let mut parsed = Url::parse(url).ok()?;
        let host = parsed.host_str()?.to_lowercase();
        let mirror = self.mirrors.get(&host)?;
        parsed.set_host(Some(mirror)).ok()?;
        Some(parsed.to_string())
    }
}

#[async_trait]
impl FallbackSource for MirrorSource {
    fn kind(&self) -> FallbackKind {
        FallbackKind::Mirror
    }

    async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<ScrapedPage, FetchError> {
        let mirrored = self
            .mirror_url(url)
            .ok_or_else(|| FetchError::Other(format!("No mirror configured for {url}")))?;
        tracing::debug!(url = %url, mirror_url = %mirrored, "Trying mirror fallback");
        self.scraper.fetch(&mirrored, options).await
    }
}
