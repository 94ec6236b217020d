//! In-memory content cache for fetched pages
//!
//! Entries expire after a TTL and the cache is bounded both by entry count and
//! by total content bytes. When a new entry does not fit, expired entries are
//! purged first, then least-recently-used entries are evicted (recency is the
//! last successful `get` or `set`).
//!
//! Expired entries are never returned by [`ContentCache::get`], but they stay
//! resident until purged so [`ContentCache::get_stale`] can serve them as a
//! last-resort fallback.
//!
//! # Example
//!
//! ```rust,ignore
//! use tansaek::cache::{CacheConfig, ContentCache};
//!
//! let cache = ContentCache::new(CacheConfig::default())?;
//! cache.insert("https://example.com", "<html>…</html>", Some("text/html".into()));
//! let hit = cache.get("https://example.com");
//! ```

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::metrics;
use crate::utils::{content_hash, format_bytes};

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on the summed content size (default: 50 MiB)
    pub max_size_bytes: u64,

    /// Upper bound on the number of entries
    pub max_entries: usize,

    /// TTL applied by `insert` (default: 1 hour)
    pub default_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: 50 * 1024 * 1024,
            max_entries: 1000,
            default_ttl_ms: 3_600_000,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(Error::config("cache.max_entries must be greater than 0"));
        }
        if self.max_size_bytes == 0 {
            return Err(Error::config("cache.max_size_bytes must be greater than 0"));
        }
        if self.default_ttl_ms == 0 {
            return Err(Error::config("cache.default_ttl_ms must be greater than 0"));
        }
        Ok(())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

/// A cached page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub content: String,
    pub content_type: Option<String>,
    /// SHA-256 of `content`
    pub hash: String,
    pub fetched_at: DateTime<Utc>,
    pub ttl_expires_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        url: impl Into<String>,
        content: impl Into<String>,
        content_type: Option<String>,
        ttl: Duration,
    ) -> Self {
        let content = content.into();
        let now = Utc::now();
        let ttl_expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            url: url.into(),
            hash: content_hash(&content),
            size_bytes: content.len() as u64,
            content,
            content_type,
            fetched_at: now,
            ttl_expires_at,
            access_count: 0,
            last_accessed_at: now,
        }
    }

    /// Lifetime granted at creation
    pub fn ttl(&self) -> Duration {
        (self.ttl_expires_at - self.fetched_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Time left before `ttl_expires_at`; zero once it has passed
    pub fn remaining_ttl(&self) -> Duration {
        (self.ttl_expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.ttl())
    }
}

/// Hit/miss accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    /// hits / (hits + misses); 0 before any lookup
    pub hit_rate: f64,
    pub entries: usize,
    pub total_bytes: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    expires: Instant,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }
}

#[derive(Debug)]
struct Store {
    entries: LruCache<String, Slot>,
    total_bytes: u64,
}

impl Store {
    fn remove(&mut self, url: &str) -> Option<Slot> {
        let slot = self.entries.pop(url)?;
        self.total_bytes -= slot.entry.size_bytes;
        Some(slot)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.is_expired(now))
            .map(|(url, _)| url.clone())
            .collect();
        for url in &expired {
            self.remove(url);
        }
        expired.len()
    }
}

/// TTL + LRU bounded content cache; safe to share across tasks
#[derive(Debug)]
pub struct ContentCache {
    config: CacheConfig,
    store: Mutex<Store>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ContentCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: Mutex::new(Store {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a fresh entry; counts exactly one hit or one miss
    pub fn get(&self, url: &str) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut store = self.store();

        // Only a fresh entry is promoted in the LRU order.
        let is_fresh = store
            .entries
            .peek(url)
            .is_some_and(|slot| !slot.is_expired(now));
        let fresh = if is_fresh {
            store.entries.get_mut(url).map(|slot| {
                slot.entry.access_count += 1;
                slot.entry.last_accessed_at = Utc::now();
                slot.entry.clone()
            })
        } else {
            None
        };
        drop(store);

        if fresh.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache("hit");
            tracing::trace!(url, "Cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache("miss");
        }
        fresh
    }

    /// Look up an entry even if expired, without touching counters or recency
    pub fn get_stale(&self, url: &str) -> Option<CacheEntry> {
        self.store().entries.peek(url).map(|slot| slot.entry.clone())
    }

    /// Whether a fresh entry exists, without touching counters or recency
    pub fn contains(&self, url: &str) -> bool {
        let now = Instant::now();
        self.store()
            .entries
            .peek(url)
            .is_some_and(|slot| !slot.is_expired(now))
    }

    /// Store `content` under `url` with the default TTL
    pub fn insert(&self, url: &str, content: &str, content_type: Option<String>) -> bool {
        self.set(CacheEntry::new(
            url,
            content,
            content_type,
            self.config.default_ttl(),
        ))
    }

    /// Insert or overwrite an entry
    ///
    /// The entry expires at its own `ttl_expires_at`; one whose deadline has
    /// already passed is stored expired and only reachable via
    /// [`get_stale`](Self::get_stale). Returns false if the entry alone
    /// exceeds `max_size_bytes`.
    pub fn set(&self, entry: CacheEntry) -> bool {
        if entry.size_bytes > self.config.max_size_bytes {
            tracing::warn!(
                url = %entry.url,
                size = %format_bytes(entry.size_bytes),
                limit = %format_bytes(self.config.max_size_bytes),
                "Entry larger than cache capacity, not cached"
            );
            return false;
        }

        let now = Instant::now();
        let expires = now
            .checked_add(entry.remaining_ttl())
            .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600));
        let mut store = self.store();
        store.remove(&entry.url);

        let fits = |store: &Store| {
            store.entries.len() < self.config.max_entries
                && store.total_bytes + entry.size_bytes <= self.config.max_size_bytes
        };

        if !fits(&*store) {
            let purged = store.purge_expired(now);
            if purged > 0 {
                tracing::debug!(purged, "Purged expired cache entries");
            }
        }

        let mut evicted = 0u64;
        while !fits(&*store) {
            match store.entries.pop_lru() {
                Some((url, slot)) => {
                    store.total_bytes -= slot.entry.size_bytes;
                    evicted += 1;
                    tracing::debug!(url = %url, "Evicted least recently used cache entry");
                }
                None => break,
            }
        }

        store.total_bytes += entry.size_bytes;
        store
            .entries
            .put(entry.url.clone(), Slot { entry, expires });
        drop(store);

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            for _ in 0..evicted {
                metrics::record_cache("eviction");
            }
        }
        true
    }

    pub fn remove(&self, url: &str) -> Option<CacheEntry> {
        self.store().remove(url).map(|slot| slot.entry)
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.store().purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.store().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.store().total_bytes
    }

    /// Remove all entries and zero the counters
    pub fn clear(&self) {
        let mut store = self.store();
        store.entries.clear();
        store.total_bytes = 0;
        drop(store);
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let store = self.store();

        CacheStats {
            hit_count: hits,
            miss_count: misses,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            entries: store.entries.len(),
            total_bytes: store.total_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max_entries: usize, max_size_bytes: u64) -> ContentCache {
        ContentCache::new(CacheConfig {
            max_entries,
            max_size_bytes,
            default_ttl_ms: 1_000,
        })
        .unwrap()
    }

    #[test]
    fn test_invalid_config() {
        assert!(ContentCache::new(CacheConfig {
            max_entries: 0,
            ..Default::default()
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_set_then_get_round_trip() {
        let cache = cache(10, 1024);
        assert!(cache.insert("https://a.test", "hello", Some("text/html".into())));

        let entry = cache.get("https://a.test").unwrap();
        assert_eq!(entry.content, "hello");
        assert_eq!(entry.content_type.as_deref(), Some("text/html"));
        assert_eq!(entry.hash, content_hash("hello"));
        assert_eq!(entry.access_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_not_returned() {
        let cache = cache(10, 1024);
        cache.insert("https://a.test", "hello", None);
        tokio::time::advance(Duration::from_millis(1_001)).await;

        assert!(cache.get("https://a.test").is_none());
        assert!(!cache.contains("https://a.test"));
        // Still resident for stale fallback until purged.
        assert_eq!(cache.get_stale("https://a.test").unwrap().content, "hello");
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get_stale("https://a.test").is_none());
    }

    #[tokio::test]
    async fn test_entry_past_its_deadline_is_not_revived() {
        let cache = cache(10, 1024);
        let mut entry = CacheEntry::new("https://old.test", "old", None, Duration::from_secs(3600));
        entry.fetched_at = Utc::now() - chrono::Duration::hours(2);
        entry.ttl_expires_at = Utc::now() - chrono::Duration::hours(1);

        assert!(cache.set(entry));
        assert!(cache.get("https://old.test").is_none());
        assert!(!cache.contains("https://old.test"));
        assert_eq!(cache.get_stale("https://old.test").unwrap().content, "old");
    }

    #[tokio::test]
    async fn test_restored_entry_keeps_remaining_lifetime() {
        let cache = cache(10, 1024);
        let mut entry = CacheEntry::new("https://half.test", "half", None, Duration::from_secs(3600));
        entry.fetched_at = Utc::now() - chrono::Duration::minutes(30);
        entry.ttl_expires_at = Utc::now() + chrono::Duration::minutes(30);

        assert!(entry.remaining_ttl() <= Duration::from_secs(30 * 60));
        assert!(entry.remaining_ttl() > Duration::from_secs(29 * 60));
        assert!(cache.set(entry));
        assert!(cache.get("https://half.test").is_some());
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let cache = cache(10, 1024);
        cache.insert("https://a.test", "x", None);
        for _ in 0..5 {
            assert!(cache.get("https://a.test").is_some());
        }
        for _ in 0..3 {
            assert!(cache.get("https://missing.test").is_none());
        }

        let stats = cache.get_stats();
        assert_eq!(stats.hit_count, 5);
        assert_eq!(stats.miss_count, 3);
        assert_eq!(stats.hit_rate, 5.0 / 8.0);
    }

    #[test]
    fn test_hit_rate_zero_without_lookups() {
        assert_eq!(cache(1, 1).get_stats().hit_rate, 0.0);
    }

    #[tokio::test]
    async fn test_lru_eviction_by_count() {
        let cache = cache(2, 1024);
        cache.insert("https://a.test", "a", None);
        cache.insert("https://b.test", "b", None);
        // Touch a so b becomes least recently used.
        cache.get("https://a.test");
        cache.insert("https://c.test", "c", None);

        assert!(cache.contains("https://a.test"));
        assert!(!cache.contains("https://b.test"));
        assert!(cache.contains("https://c.test"));
        assert_eq!(cache.get_stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction_by_size() {
        let cache = cache(10, 10);
        cache.insert("https://a.test", "aaaa", None);
        cache.insert("https://b.test", "bbbb", None);
        cache.insert("https://c.test", "cccccccc", None);

        assert!(!cache.contains("https://a.test"));
        assert!(!cache.contains("https://b.test"));
        assert!(cache.contains("https://c.test"));
        assert_eq!(cache.total_bytes(), 8);
        assert_eq!(cache.get_stats().evictions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_purged_before_lru() {
        let cache = cache(2, 1024);
        cache.insert("https://long.test", "l", None);
        cache.set(CacheEntry::new(
            "https://short.test",
            "s",
            None,
            Duration::from_millis(10),
        ));
        tokio::time::advance(Duration::from_millis(20)).await;

        // long.test is least recently used, but the expired short.test goes first.
        cache.insert("https://new.test", "n", None);
        assert!(cache.contains("https://long.test"));
        assert!(cache.contains("https://new.test"));
        assert!(cache.get_stale("https://short.test").is_none());
        assert_eq!(cache.get_stats().evictions, 0);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let cache = cache(10, 4);
        assert!(!cache.insert("https://big.test", "too large", None));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_updates_size() {
        let cache = cache(10, 1024);
        cache.insert("https://a.test", "12345", None);
        cache.insert("https://a.test", "12", None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes(), 2);
    }
}
