//! Per-domain concurrency and pacing limiter
//!
//! Each domain gets its own semaphore so a burst against one host never
//! starves another. Optional request pacing (minimum interval, or a quota per
//! time window) is enforced with keyed `governor` rate limiters.

use chrono::{DateTime, Utc};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::utils::extract_domain;

/// Buckets tracked before idle ones are pruned
const MAX_TRACKED_DOMAINS: usize = 1000;

/// Per-domain limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Maximum concurrent operations against one domain
    pub max_per_domain: usize,

    /// Optional cap on requests started per window, per domain
    pub requests_per_window: Option<u32>,

    /// Window length in milliseconds (for the quota and for window statistics)
    pub window_ms: u64,

    /// Minimum spacing between request starts on one domain (0 disables)
    pub min_interval_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_per_domain: 2,
            requests_per_window: None,
            window_ms: 60_000,
            min_interval_ms: 0,
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_per_domain == 0 {
            return Err(Error::config("max_per_domain must be greater than 0"));
        }
        if self.window_ms == 0 {
            return Err(Error::config("window_ms must be greater than 0"));
        }
        if self.requests_per_window == Some(0) {
            return Err(Error::config("requests_per_window must be greater than 0"));
        }
        Ok(())
    }
}

/// Snapshot of one domain's bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainWindowState {
    pub domain: String,
    pub in_flight_count: usize,
    pub window_start: DateTime<Utc>,
    pub permits_available: usize,
    pub requests_in_window: u64,
    pub total_requests: u64,
}

#[derive(Debug)]
struct DomainBucket {
    semaphore: Arc<Semaphore>,
    window_started: Instant,
    window_start: DateTime<Utc>,
    requests_in_window: u64,
    total_requests: u64,
}

impl DomainBucket {
    fn new(max_per_domain: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_per_domain)),
            window_started: Instant::now(),
            window_start: Utc::now(),
            requests_in_window: 0,
            total_requests: 0,
        }
    }

    fn record_start(&mut self, window: Duration) {
        if self.window_started.elapsed() >= window {
            self.window_started = Instant::now();
            self.window_start = Utc::now();
            self.requests_in_window = 0;
        }
        self.requests_in_window += 1;
        self.total_requests += 1;
    }
}

/// Held while an operation runs against a domain
#[derive(Debug)]
pub struct DomainPermit {
    domain: String,
    _permit: Option<OwnedSemaphorePermit>,
}

impl DomainPermit {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

/// Keyed per-domain limiter
pub struct DomainRateLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<String, DomainBucket>>,
    interval_limiter: Option<DefaultKeyedRateLimiter<String>>,
    window_limiter: Option<DefaultKeyedRateLimiter<String>>,
}

impl std::fmt::Debug for DomainRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRateLimiter")
            .field("config", &self.config)
            .field("tracked_domains", &self.tracked_domains())
            .finish()
    }
}

impl DomainRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        config.validate()?;

        let interval_limiter = if config.min_interval_ms > 0 {
            Quota::with_period(Duration::from_millis(config.min_interval_ms))
                .map(RateLimiter::keyed)
        } else {
            None
        };

        let window_limiter = match config.requests_per_window.and_then(NonZeroU32::new) {
            Some(burst) => {
                let period = Duration::from_millis(config.window_ms) / burst.get();
                let quota = Quota::with_period(period.max(Duration::from_nanos(1)))
                    .ok_or_else(|| Error::config("requests_per_window yields a zero period"))?
                    .allow_burst(burst);
                Some(RateLimiter::keyed(quota))
            }
            None => None,
        };

        Ok(Self {
            config,
            buckets: Mutex::new(HashMap::new()),
            interval_limiter,
            window_limiter,
        })
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, DomainBucket>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Suspend until `url`'s domain has spare capacity
    pub async fn acquire(&self, url: &str) -> DomainPermit {
        let domain = extract_domain(url);

        // Lock only long enough to fetch the semaphore; never across an await.
        let semaphore = {
            let mut buckets = self.buckets();
            if buckets.len() >= MAX_TRACKED_DOMAINS && !buckets.contains_key(&domain) {
                self.prune_idle_locked(&mut buckets);
            }
            let bucket = buckets
                .entry(domain.clone())
                .or_insert_with(|| DomainBucket::new(self.config.max_per_domain));
            Arc::clone(&bucket.semaphore)
        };

        // Only a closed semaphore refuses; pacing still applies without the slot.
        let permit = semaphore.acquire_owned().await.ok();
        if permit.is_none() {
            tracing::warn!(domain = %domain, "Domain semaphore closed, proceeding without a slot");
        }

        if let Some(limiter) = &self.interval_limiter {
            limiter.until_key_ready(&domain).await;
        }
        if let Some(limiter) = &self.window_limiter {
            limiter.until_key_ready(&domain).await;
        }

        let window = Duration::from_millis(self.config.window_ms);
        if let Some(bucket) = self.buckets().get_mut(&domain) {
            bucket.record_start(window);
        }

        tracing::trace!(domain = %domain, "Domain permit acquired");
        DomainPermit {
            domain,
            _permit: permit,
        }
    }

    /// Run `f` once `url`'s domain has capacity; capacity is returned on every exit path
    pub async fn with_limit<F, Fut, T>(&self, url: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire(url).await;
        f().await
    }

    /// State of one domain, if it has been seen
    pub fn domain_state(&self, domain: &str) -> Option<DomainWindowState> {
        let key = extract_domain(domain);
        self.buckets()
            .get(&key)
            .map(|bucket| self.snapshot(&key, bucket))
    }

    /// State of every tracked domain, sorted by name
    pub fn stats(&self) -> Vec<DomainWindowState> {
        let buckets = self.buckets();
        let mut states: Vec<_> = buckets
            .iter()
            .map(|(domain, bucket)| self.snapshot(domain, bucket))
            .collect();
        states.sort_by(|a, b| a.domain.cmp(&b.domain));
        states
    }

    fn snapshot(&self, domain: &str, bucket: &DomainBucket) -> DomainWindowState {
        let available = bucket.semaphore.available_permits();
        DomainWindowState {
            domain: domain.to_string(),
            in_flight_count: self.config.max_per_domain.saturating_sub(available),
            window_start: bucket.window_start,
            permits_available: available,
            requests_in_window: bucket.requests_in_window,
            total_requests: bucket.total_requests,
        }
    }

    /// Number of domains with a bucket
    pub fn tracked_domains(&self) -> usize {
        self.buckets().len()
    }

    pub fn max_per_domain(&self) -> usize {
        self.config.max_per_domain
    }

    /// Drop buckets with nothing in flight, along with settled pacing state
    pub fn reset(&self) {
        let mut buckets = self.buckets();
        self.prune_idle_locked(&mut buckets);
        for bucket in buckets.values_mut() {
            bucket.requests_in_window = 0;
            bucket.total_requests = 0;
        }
    }

    fn prune_idle_locked(&self, buckets: &mut HashMap<String, DomainBucket>) {
        let max_per_domain = self.config.max_per_domain;
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.semaphore.available_permits() < max_per_domain);
        let pruned = before - buckets.len();
        if pruned > 0 {
            tracing::debug!(pruned, remaining = buckets.len(), "Pruned idle domain buckets");
        }

        // keyed governor state grows with every domain seen; drop keys that
        // are back to a fresh quota
        for limiter in [&self.interval_limiter, &self.window_limiter]
            .into_iter()
            .flatten()
        {
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    /// Domains with live pacing state
    pub fn paced_domains(&self) -> usize {
        [&self.interval_limiter, &self.window_limiter]
            .into_iter()
            .flatten()
            .map(|limiter| limiter.len())
            .max()
            .unwrap_or(0)
    }
}
