//! Adaptive concurrency control
//!
//! The controller recomputes the effective concurrency on a timer, not on
//! every task completion. Each tick combines the [`ResourceMonitor`] window
//! with the success/failure counts fed in since the previous tick:
//!
//! - pressure at or above 1.0 shrinks the target multiplicatively
//! - pressure below `relax_below` with at least one recent success grows it by one
//! - anything in between holds steady
//!
//! Pressure is the larger of `error_rate / error_rate_threshold` and
//! `p95_latency / target_latency_ms`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::resource_monitor::ResourceMonitor;
use crate::error::{Error, Result};
use crate::metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Lower bound for the effective concurrency
    pub min_concurrency: usize,

    /// Recompute period in milliseconds
    pub adjustment_interval_ms: u64,

    /// Error rate treated as full pressure
    pub error_rate_threshold: f64,

    /// p95 latency treated as full pressure (milliseconds)
    pub target_latency_ms: u64,

    /// Factor applied when shrinking
    pub decrease_factor: f64,

    /// Pressure below which the target may grow
    pub relax_below: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 1,
            adjustment_interval_ms: 5_000,
            error_rate_threshold: 0.2,
            target_latency_ms: 10_000,
            decrease_factor: 0.5,
            relax_below: 0.5,
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self, max_concurrency: usize) -> Result<()> {
        if self.min_concurrency == 0 {
            return Err(Error::config("adaptive.min_concurrency must be greater than 0"));
        }
        if self.min_concurrency > max_concurrency {
            return Err(Error::config(format!(
                "adaptive.min_concurrency ({}) exceeds max_concurrency ({max_concurrency})",
                self.min_concurrency
            )));
        }
        if self.adjustment_interval_ms == 0 {
            return Err(Error::config(
                "adaptive.adjustment_interval_ms must be greater than 0",
            ));
        }
        if !(self.error_rate_threshold > 0.0 && self.error_rate_threshold <= 1.0) {
            return Err(Error::config(
                "adaptive.error_rate_threshold must be in (0, 1]",
            ));
        }
        if !(self.decrease_factor > 0.0 && self.decrease_factor < 1.0) {
            return Err(Error::config("adaptive.decrease_factor must be in (0, 1)"));
        }
        Ok(())
    }
}

/// Controller state as seen by the executor
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConcurrencySnapshot {
    pub effective_concurrency: usize,
    pub recent_success_count: u64,
    pub recent_failure_count: u64,
    pub pressure_score: f64,
    pub running: bool,
}

#[derive(Debug)]
struct ControllerState {
    config: AdaptiveConfig,
    max_concurrency: usize,
    enabled: bool,
    monitor: Arc<ResourceMonitor>,
    effective: AtomicUsize,
    recent_success: AtomicU64,
    recent_failure: AtomicU64,
    recent_latency_ms: AtomicU64,
    pressure_bits: AtomicU64,
}

impl ControllerState {
    fn pressure(&self) -> f64 {
        f64::from_bits(self.pressure_bits.load(Ordering::Relaxed))
    }

    fn pressure_of(&self, error_rate: f64, latency_ms: f64) -> f64 {
        let error_pressure = error_rate / self.config.error_rate_threshold;
        let latency_pressure = if self.config.target_latency_ms > 0 {
            latency_ms / self.config.target_latency_ms as f64
        } else {
            0.0
        };
        error_pressure.max(latency_pressure)
    }

    fn recompute(&self) -> usize {
        let current = self.effective.load(Ordering::SeqCst);
        if !self.enabled {
            return current;
        }

        let successes = self.recent_success.swap(0, Ordering::SeqCst);
        let failures = self.recent_failure.swap(0, Ordering::SeqCst);
        let recent_latency = self.recent_latency_ms.swap(0, Ordering::SeqCst);
        let window = self.monitor.snapshot();

        let recent_total = successes + failures;
        let (error_rate, latency_ms) = if recent_total > 0 {
            (
                failures as f64 / recent_total as f64,
                (recent_latency as f64 / recent_total as f64).max(window.p95_latency_ms as f64),
            )
        } else {
            (window.error_rate, window.p95_latency_ms as f64)
        };
        let pressure = self.pressure_of(error_rate, latency_ms);
        self.pressure_bits.store(pressure.to_bits(), Ordering::Relaxed);

        // window samples alone report pressure but never move the target
        if recent_total == 0 {
            return current;
        }

        let next = if pressure >= 1.0 {
            let shrunk = (current as f64 * self.config.decrease_factor).floor() as usize;
            shrunk.min(current.saturating_sub(1)).max(self.config.min_concurrency)
        } else if pressure < self.config.relax_below && successes > 0 {
            (current + 1).min(self.max_concurrency)
        } else {
            current
        };

        if next != current {
            tracing::debug!(
                from = current,
                to = next,
                pressure,
                error_rate,
                "Adjusted effective concurrency"
            );
            self.effective.store(next, Ordering::SeqCst);
            metrics::set_effective_concurrency(next);
        }
        next
    }
}

#[derive(Debug)]
struct Ticker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Timer-driven effective-concurrency controller
#[derive(Debug)]
pub struct AdaptiveConcurrencyController {
    state: Arc<ControllerState>,
    ticker: Mutex<Option<Ticker>>,
    running: AtomicBool,
}

impl AdaptiveConcurrencyController {
    /// `enabled == false` pins the effective concurrency at `max_concurrency`
    pub fn new(
        config: AdaptiveConfig,
        max_concurrency: usize,
        enabled: bool,
        monitor: Arc<ResourceMonitor>,
    ) -> Result<Self> {
        if max_concurrency == 0 {
            return Err(Error::config("max_concurrency must be greater than 0"));
        }
        config.validate(max_concurrency)?;

        Ok(Self {
            state: Arc::new(ControllerState {
                config,
                max_concurrency,
                enabled,
                monitor,
                effective: AtomicUsize::new(max_concurrency),
                recent_success: AtomicU64::new(0),
                recent_failure: AtomicU64::new(0),
                recent_latency_ms: AtomicU64::new(0),
                pressure_bits: AtomicU64::new(0f64.to_bits()),
            }),
            ticker: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    fn ticker(&self) -> MutexGuard<'_, Option<Ticker>> {
        self.ticker.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_success(&self, duration_ms: u64) {
        self.state.recent_success.fetch_add(1, Ordering::SeqCst);
        self.state
            .recent_latency_ms
            .fetch_add(duration_ms, Ordering::SeqCst);
    }

    pub fn record_failure(&self, duration_ms: u64) {
        self.state.recent_failure.fetch_add(1, Ordering::SeqCst);
        self.state
            .recent_latency_ms
            .fetch_add(duration_ms, Ordering::SeqCst);
    }

    /// Run one recomputation now and return the new effective concurrency
    pub fn recompute(&self) -> usize {
        self.state.recompute()
    }

    pub fn effective_concurrency(&self) -> usize {
        self.state.effective.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Begin periodic recomputation; a no-op when disabled or already running
    pub fn start(&self) {
        if !self.state.enabled {
            return;
        }
        let mut ticker = self.ticker();
        if ticker.is_some() {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!("Adaptive controller start requested outside a tokio runtime");
                return;
            }
        };

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let state = Arc::clone(&self.state);
        let period = Duration::from_millis(state.config.adjustment_interval_ms);

        let handle = runtime.spawn(async move {
            let mut ticks = interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticks.tick().await;

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        state.recompute();
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("Adaptive controller stopping");
                        break;
                    }
                }
            }
        });

        *ticker = Some(Ticker { shutdown, handle });
        self.running.store(true, Ordering::SeqCst);
        tracing::debug!(
            interval_ms = self.state.config.adjustment_interval_ms,
            "Adaptive controller started"
        );
    }

    /// Halt periodic recomputation; the current target is kept
    pub fn stop(&self) {
        if let Some(ticker) = self.ticker().take() {
            let _ = ticker.shutdown.send(true);
            ticker.handle.abort();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        ConcurrencySnapshot {
            effective_concurrency: self.effective_concurrency(),
            recent_success_count: self.state.recent_success.load(Ordering::SeqCst),
            recent_failure_count: self.state.recent_failure.load(Ordering::SeqCst),
            pressure_score: self.state.pressure(),
            running: self.is_running(),
        }
    }

    /// Stop, clear history, return to `max_concurrency`
    pub fn reset(&self) {
        self.stop();
        self.state.recent_success.store(0, Ordering::SeqCst);
        self.state.recent_failure.store(0, Ordering::SeqCst);
        self.state.recent_latency_ms.store(0, Ordering::SeqCst);
        self.state
            .pressure_bits
            .store(0f64.to_bits(), Ordering::Relaxed);
        self.state
            .effective
            .store(self.state.max_concurrency, Ordering::SeqCst);
    }
}

impl Drop for AdaptiveConcurrencyController {
    fn drop(&mut self) {
        self.stop();
    }
}
