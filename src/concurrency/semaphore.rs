//! Global in-flight bound with a runtime-adjustable limit
//!
//! Built on `tokio::sync::Semaphore`, which is FIFO-fair and cancel-safe.
//! Raising the limit adds permits; lowering it retires permits, taking idle
//! ones immediately and the rest as running holders release them.

use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedSemaphorePermit;

use crate::error::{Error, Result};

/// Point-in-time view of the semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SemaphoreStats {
    /// Upper bound configured at construction
    pub max_permits: usize,
    /// Current limit (the effective concurrency)
    pub limit: usize,
    /// Permits held by running operations
    pub in_flight: usize,
    /// Permits free right now
    pub available: usize,
    /// Callers suspended in `acquire`
    pub waiting: usize,
}

#[derive(Debug)]
struct Bounds {
    limit: usize,
    /// Permits still to be retired once holders release them
    debt: usize,
}

#[derive(Debug)]
struct Shared {
    permits: Arc<tokio::sync::Semaphore>,
    bounds: Mutex<Bounds>,
    in_flight: AtomicUsize,
    waiting: AtomicUsize,
    max_permits: usize,
}

impl Shared {
    fn bounds(&self) -> MutexGuard<'_, Bounds> {
        // The guarded data is two integers; a poisoned lock still holds valid values.
        self.bounds.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Counting semaphore bounding concurrent operations
#[derive(Debug, Clone)]
pub struct Semaphore {
    shared: Arc<Shared>,
}

/// Held while an operation runs; releasing happens on drop
#[derive(Debug)]
pub struct SemaphorePermit {
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(permit) = self.permit.take() {
            let mut bounds = self.shared.bounds();
            if bounds.debt > 0 {
                bounds.debt -= 1;
                permit.forget();
            }
            // otherwise the permit returns to the pool when it drops here
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Semaphore {
    /// Create a semaphore allowing `max_permits` concurrent holders
    pub fn new(max_permits: usize) -> Result<Self> {
        if max_permits == 0 {
            return Err(Error::config("max_concurrency must be greater than 0"));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                permits: Arc::new(tokio::sync::Semaphore::new(max_permits)),
                bounds: Mutex::new(Bounds {
                    limit: max_permits,
                    debt: 0,
                }),
                in_flight: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                max_permits,
            }),
        })
    }

    /// Wait for a permit
    ///
    /// Waiters are served in arrival order. Dropping the returned future
    /// while suspended gives up the place in line without leaking a permit.
    pub async fn acquire(&self) -> SemaphorePermit {
        self.shared.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = WaitingGuard(&self.shared.waiting);

        let permit = Arc::clone(&self.shared.permits)
            .acquire_owned()
            .await
            .ok();
        drop(guard);

        // The inner semaphore is never closed, so `permit` is always Some.
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        SemaphorePermit {
            permit,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Run `f` while holding a permit; the permit is released on every exit path
    pub async fn with_semaphore<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        f().await
    }

    /// Change the number of concurrent holders, clamped to `1..=max_permits`
    pub fn set_limit(&self, new_limit: usize) {
        let new_limit = new_limit.clamp(1, self.shared.max_permits);
        let mut bounds = self.shared.bounds();
        let old_limit = bounds.limit;

        if new_limit > old_limit {
            let mut grow = new_limit - old_limit;
            // Cancel outstanding retirements before minting new permits.
            let cancelled = grow.min(bounds.debt);
            bounds.debt -= cancelled;
            grow -= cancelled;
            if grow > 0 {
                self.shared.permits.add_permits(grow);
            }
        } else if new_limit < old_limit {
            let mut shrink = old_limit - new_limit;
            while shrink > 0 {
                match Arc::clone(&self.shared.permits).try_acquire_owned() {
                    Ok(idle) => {
                        idle.forget();
                        shrink -= 1;
                    }
                    Err(_) => break,
                }
            }
            bounds.debt += shrink;
        }

        if new_limit != old_limit {
            tracing::debug!(old_limit, new_limit, "Semaphore limit changed");
        }
        bounds.limit = new_limit;
    }

    /// Current limit
    pub fn limit(&self) -> usize {
        self.shared.bounds().limit
    }

    /// Permits currently held
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> SemaphoreStats {
        let limit = self.limit();
        SemaphoreStats {
            max_permits: self.shared.max_permits,
            limit,
            in_flight: self.in_flight(),
            available: self.shared.permits.available_permits(),
            waiting: self.shared.waiting.load(Ordering::SeqCst),
        }
    }

    /// Return to the construction-time limit
    pub fn reset(&self) {
        self.set_limit(self.shared.max_permits);
    }
}
