//! Rolling window of recent latency and error samples

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceMonitorConfig {
    /// Maximum samples retained
    pub window_size: usize,
    /// Samples older than this are discarded (milliseconds)
    pub window_ms: u64,
}

impl Default for ResourceMonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            window_ms: 60_000,
        }
    }
}

impl ResourceMonitorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::config("resource_monitor.window_size must be greater than 0"));
        }
        if self.window_ms == 0 {
            return Err(Error::config("resource_monitor.window_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// Aggregates over the current window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub sample_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    /// failures / samples, 0 when empty
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub p95_latency_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    latency_ms: u64,
    success: bool,
}

#[derive(Debug)]
pub struct ResourceMonitor {
    config: ResourceMonitorConfig,
    samples: Mutex<VecDeque<Sample>>,
}

impl ResourceMonitor {
    pub fn new(config: ResourceMonitorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            samples: Mutex::new(VecDeque::with_capacity(config.window_size)),
            config,
        })
    }

    fn samples(&self) -> MutexGuard<'_, VecDeque<Sample>> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one finished operation
    pub fn record(&self, latency: Duration, success: bool) {
        let mut samples = self.samples();
        if samples.len() == self.config.window_size {
            samples.pop_front();
        }
        samples.push_back(Sample {
            at: Instant::now(),
            latency_ms: crate::utils::duration_ms(latency),
            success,
        });
    }

    /// Aggregate the samples still inside the time window
    pub fn snapshot(&self) -> ResourceSnapshot {
        let mut samples = self.samples();
        let horizon = Duration::from_millis(self.config.window_ms);
        while samples
            .front()
            .is_some_and(|sample| sample.at.elapsed() > horizon)
        {
            samples.pop_front();
        }

        if samples.is_empty() {
            return ResourceSnapshot::default();
        }

        let sample_count = samples.len();
        let failure_count = samples.iter().filter(|s| !s.success).count();
        let mut latencies: Vec<u64> = samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();

        let total: u64 = latencies.iter().sum();
        let p95_index = ((sample_count as f64 * 0.95).ceil() as usize).clamp(1, sample_count) - 1;

        ResourceSnapshot {
            sample_count,
            success_count: sample_count - failure_count,
            failure_count,
            error_rate: failure_count as f64 / sample_count as f64,
            avg_latency_ms: total as f64 / sample_count as f64,
            p95_latency_ms: latencies[p95_index],
        }
    }

    pub fn reset(&self) {
        self.samples().clear();
    }
}
