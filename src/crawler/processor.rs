//! Per-URL orchestration
//!
//! For each URL: cache lookup, then the scraper under the processor's own
//! retry policy, then the configured fallback chain. Fresh primary content is
//! written back to the cache.
//!
//! Concurrency of [`UrlProcessor::process_many`] is bounded either by the
//! processor's own global semaphore and domain limiter (`parallel.*`) or, when
//! one is attached, by a shared [`ParallelExecutor`]'s limits.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::fallback::{ArchiveSource, FallbackKind, FallbackSource, MirrorSource, DEFAULT_ARCHIVE_PREFIX};
use super::{FetchOptions, ScrapedPage, Scraper};
use crate::cache::{CacheConfig, CacheEntry, ContentCache};
use crate::concurrency::{DomainRateLimiter, ParallelExecutor, RateLimiterConfig, Semaphore};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::metrics;
use crate::utils::duration_ms;
use crate::utils::error::FetchError;
use crate::utils::retry::RetryConfig;

/// Which fallbacks to try, and in what order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Allow serving an expired but resident cache entry
    pub use_cache: bool,
    pub priority: Vec<FallbackKind>,
    /// Prefix for archive lookups, see [`ArchiveSource`]
    pub archive_prefix: String,
    /// host -> mirror host, see [`MirrorSource`]
    pub mirrors: HashMap<String, String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            use_cache: true,
            priority: vec![FallbackKind::Cache, FallbackKind::Archive, FallbackKind::Mirror],
            archive_prefix: DEFAULT_ARCHIVE_PREFIX.to_string(),
            mirrors: HashMap::new(),
        }
    }
}

/// Bounds for `process_many` when no executor is attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_concurrent: usize,
    pub max_per_domain: usize,
    /// Minimum spacing between requests to one domain (0 = none)
    pub request_interval_ms: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_per_domain: 2,
            request_interval_ms: 0,
        }
    }
}

/// Deadlines in milliseconds; 0 disables the corresponding timer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// One fetch attempt
    pub per_url_ms: u64,
    /// One `process_many` round inside the research loop
    pub per_iteration_ms: u64,
    /// The whole research loop
    pub total_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            per_url_ms: 30_000,
            per_iteration_ms: 5 * 60_000,
            total_ms: 30 * 60_000,
        }
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl TimeoutConfig {
    pub fn per_url(&self) -> Option<Duration> {
        non_zero(self.per_url_ms)
    }

    pub fn per_iteration(&self) -> Option<Duration> {
        non_zero(self.per_iteration_ms)
    }

    pub fn total(&self) -> Option<Duration> {
        non_zero(self.total_ms)
    }
}

/// Configuration for [`UrlProcessor`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlProcessorConfig {
    pub retry: RetryConfig,
    pub fallback: FallbackConfig,
    pub cache: CacheConfig,
    pub parallel: ParallelConfig,
    pub timeouts: TimeoutConfig,
}

impl UrlProcessorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.parallel.max_concurrent == 0 {
            return Err(Error::config("processor.parallel.max_concurrent must be at least 1"));
        }
        if self.parallel.max_per_domain == 0 {
            return Err(Error::config("processor.parallel.max_per_domain must be at least 1"));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(Error::config("processor.retry.multiplier must be >= 1.0"));
        }
        self.cache.validate()
    }

    fn limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_per_domain: self.parallel.max_per_domain,
            min_interval_ms: self.parallel.request_interval_ms,
            ..Default::default()
        }
    }
}

/// Outcome of processing one URL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlProcessResult {
    pub url: String,
    pub success: bool,
    pub content: Option<String>,
    pub title: Option<String>,
    pub error: Option<String>,
    /// Primary fetch attempts; 0 when served from a fresh cache entry
    pub attempts: u32,
    pub processing_time_ms: u64,
    pub used_cache: bool,
    pub fallback: Option<FallbackKind>,
}

impl UrlProcessResult {
    fn from_page(url: &str, page: ScrapedPage, attempts: u32, started: Instant) -> Self {
        Self {
            url: url.to_string(),
            success: true,
            content: Some(page.content),
            title: page.title,
            error: None,
            attempts,
            processing_time_ms: duration_ms(started.elapsed()),
            used_cache: false,
            fallback: None,
        }
    }

    fn from_cache(url: &str, entry: CacheEntry, attempts: u32, started: Instant) -> Self {
        Self {
            url: url.to_string(),
            success: true,
            content: Some(entry.content),
            title: None,
            error: None,
            attempts,
            processing_time_ms: duration_ms(started.elapsed()),
            used_cache: true,
            fallback: None,
        }
    }

    fn failed(url: &str, error: String, attempts: u32, started: Instant) -> Self {
        Self {
            url: url.to_string(),
            success: false,
            content: None,
            title: None,
            error: Some(error),
            attempts,
            processing_time_ms: duration_ms(started.elapsed()),
            used_cache: false,
            fallback: None,
        }
    }
}

enum Limits {
    Own {
        semaphore: Semaphore,
        limiter: DomainRateLimiter,
    },
    Executor(Arc<ParallelExecutor<UrlProcessResult>>),
}

/// Cache-first, retrying, fallback-aware URL fetcher
pub struct UrlProcessor {
    config: UrlProcessorConfig,
    scraper: Arc<dyn Scraper>,
    cache: Arc<ContentCache>,
    fallbacks: Vec<Arc<dyn FallbackSource>>,
    limits: Limits,
    events: EventBus,
}

impl UrlProcessor {
    /// Fails with [`Error::Config`] on invalid settings
    pub fn new(config: UrlProcessorConfig, scraper: Arc<dyn Scraper>) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(ContentCache::new(config.cache.clone())?);
        let limits = Limits::Own {
            semaphore: Semaphore::new(config.parallel.max_concurrent)?,
            limiter: DomainRateLimiter::new(config.limiter_config())?,
        };

        Ok(Self {
            config,
            scraper,
            cache,
            fallbacks: Vec::new(),
            limits,
            events: EventBus::default(),
        })
    }

    /// Run every fetch attempt under `executor`'s global and domain limits
    pub fn with_executor(mut self, executor: Arc<ParallelExecutor<UrlProcessResult>>) -> Self {
        self.events = executor.events().clone();
        self.limits = Limits::Executor(executor);
        self
    }

    /// Share a cache with other processors
    pub fn with_cache(mut self, cache: Arc<ContentCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_fallback(mut self, source: Arc<dyn FallbackSource>) -> Self {
        self.fallbacks.push(source);
        self
    }

    /// Register archive and mirror sources from `fallback` config, using this
    /// processor's scraper
    pub fn with_configured_fallbacks(mut self) -> Self {
        let priority = &self.config.fallback.priority;
        if priority.contains(&FallbackKind::Archive) && !self.config.fallback.archive_prefix.is_empty() {
            self.fallbacks.push(Arc::new(ArchiveSource::with_prefix(
                Arc::clone(&self.scraper),
                self.config.fallback.archive_prefix.clone(),
            )));
        }
        if priority.contains(&FallbackKind::Mirror) && !self.config.fallback.mirrors.is_empty() {
            self.fallbacks.push(Arc::new(MirrorSource::new(
                Arc::clone(&self.scraper),
                self.config.fallback.mirrors.clone(),
            )));
        }
        self
    }

    /// Registered network fallbacks, in registration order
    pub fn fallback_kinds(&self) -> Vec<FallbackKind> {
        self.fallbacks.iter().map(|s| s.kind()).collect()
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &UrlProcessorConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Process one URL; never fails, errors end up in the result
    pub async fn process(&self, url: &str) -> UrlProcessResult {
        let started = Instant::now();

        if let Some(entry) = self.cache.get(url) {
            debug!(url = %url, "Cache hit");
            self.events.emit(EngineEvent::CacheHit {
                url: url.to_string(),
            });
            metrics::record_url("cached");
            return UrlProcessResult::from_cache(url, entry, 0, started);
        }

        let options = FetchOptions {
            timeout: self.config.timeouts.per_url(),
            ..Default::default()
        };

        let attempted = self
            .config
            .retry
            .run(
                |_| self.fetch_once(url, &options),
                FetchError::is_recoverable,
                |retry, delay, error| {
                    metrics::record_retry("processor");
                    self.events.emit(EngineEvent::Retrying {
                        id: url.to_string(),
                        url: url.to_string(),
                        retry,
                        delay_ms: duration_ms(delay),
                        error: error.to_string(),
                    });
                },
            )
            .await;
        let attempts = attempted.attempts();

        let error = match attempted.result {
            Ok(page) => {
                self.cache
                    .insert(url, &page.content, page.content_type.clone());
                metrics::record_url("fetched");
                return UrlProcessResult::from_page(url, page, attempts, started);
            }
            Err(e) => e,
        };

        warn!(url = %url, attempts, error = %error, "Primary fetch failed");

        if let Some(result) = self.try_fallbacks(url, &options, attempts, started).await {
            metrics::record_url("fallback");
            return result;
        }

        metrics::record_url("failed");
        UrlProcessResult::failed(url, error.to_string(), attempts, started)
    }

    /// Process all `urls` concurrently; results come back in input order
    pub async fn process_many(&self, urls: &[String]) -> Vec<UrlProcessResult> {
        let started = Instant::now();
        let results = join_all(urls.iter().map(|url| self.process(url))).await;

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(
            total = results.len(),
            succeeded,
            failed = results.len() - succeeded,
            elapsed_ms = duration_ms(started.elapsed()),
            "Processed URL batch"
        );
        results
    }

    async fn fetch_once(&self, url: &str, options: &FetchOptions) -> std::result::Result<ScrapedPage, FetchError> {
        let attempt = with_deadline(options.timeout, self.scraper.fetch(url, options));
        match &self.limits {
            Limits::Own { semaphore, limiter } => {
                let _permit = semaphore.acquire().await;
                limiter.with_limit(url, || attempt).await
            }
            Limits::Executor(executor) => executor.run_guarded(url, || attempt).await,
        }
    }

    async fn try_fallbacks(
        &self,
        url: &str,
        options: &FetchOptions,
        attempts: u32,
        started: Instant,
    ) -> Option<UrlProcessResult> {
        for kind in &self.config.fallback.priority {
            if *kind == FallbackKind::Cache {
                if !self.config.fallback.use_cache {
                    continue;
                }
                if let Some(entry) = self.cache.get_stale(url) {
                    info!(url = %url, "Serving stale cache entry");
                    let mut result = UrlProcessResult::from_cache(url, entry, attempts, started);
                    result.fallback = Some(FallbackKind::Cache);
                    return Some(result);
                }
                continue;
            }

            for source in self.fallbacks.iter().filter(|s| s.kind() == *kind) {
                match with_deadline(options.timeout, source.fetch(url, options)).await {
                    Ok(page) => {
                        info!(url = %url, fallback = %kind, "Fallback succeeded");
                        let mut result = UrlProcessResult::from_page(url, page, attempts, started);
                        result.fallback = Some(*kind);
                        return Some(result);
                    }
                    Err(e) => {
                        debug!(url = %url, fallback = %kind, error = %e, "Fallback failed");
                    }
                }
            }
        }
        None
    }
}

async fn with_deadline<F>(deadline: Option<Duration>, fut: F) -> std::result::Result<ScrapedPage, FetchError>
where
    F: std::future::Future<Output = std::result::Result<ScrapedPage, FetchError>>,
{
    match deadline {
        Some(deadline) => tokio::time::timeout(deadline, fut)
            .await
            .unwrap_or(Err(FetchError::Timeout)),
        None => fut.await,
    }
}
