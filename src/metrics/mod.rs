//! Prometheus counters for executor, processor, cache and iteration activity
//!
//! Nothing is registered until [`init_metrics`] runs; before that every
//! `record_*` helper returns immediately, so library users who never expose
//! metrics pay nothing.

use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Gauge,
    HistogramVec, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

struct EngineMetrics {
    tasks: CounterVec,
    task_duration: HistogramVec,
    retries: CounterVec,
    effective_concurrency: Gauge,
    urls: CounterVec,
    cache_events: CounterVec,
    iterations: CounterVec,
}

static ENGINE_METRICS: OnceLock<EngineMetrics> = OnceLock::new();

/// Register every engine metric with the default Prometheus registry
///
/// Later calls are no-ops. A registration failure leaves metrics disabled;
/// the caller decides whether that matters.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if ENGINE_METRICS.get().is_some() {
        return Ok(());
    }

    let metrics = EngineMetrics {
        tasks: register_counter_vec!(
            "tansaek_tasks_total",
            "Executor tasks by final outcome",
            &["outcome"]
        )?,
        task_duration: register_histogram_vec!(
            "tansaek_task_duration_seconds",
            "Executor task duration including retries, in seconds",
            &["outcome"],
            vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
        )?,
        retries: register_counter_vec!(
            "tansaek_retries_total",
            "Retry attempts by component",
            &["source"]
        )?,
        effective_concurrency: register_gauge!(
            "tansaek_effective_concurrency",
            "Current effective concurrency limit"
        )?,
        urls: register_counter_vec!(
            "tansaek_urls_total",
            "Processed URLs by outcome",
            &["outcome"]
        )?,
        cache_events: register_counter_vec!(
            "tansaek_cache_events_total",
            "Content cache hits, misses and evictions",
            &["event"]
        )?,
        iterations: register_counter_vec!(
            "tansaek_iterations_total",
            "Research iterations by outcome",
            &["outcome"]
        )?,
    };

    if ENGINE_METRICS.set(metrics).is_ok() {
        tracing::debug!("Registered engine metrics");
    }
    Ok(())
}

pub fn metrics_initialized() -> bool {
    ENGINE_METRICS.get().is_some()
}

/// Snapshot of the default registry in the text exposition format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    TextEncoder::new().encode_to_string(&prometheus::gather())
}

/// Record a finished executor task (`success` or `failure`)
pub fn record_task(outcome: &str, duration: Duration) {
    let Some(m) = ENGINE_METRICS.get() else {
        return;
    };

    m.tasks.with_label_values(&[outcome]).inc();
    m.task_duration
        .with_label_values(&[outcome])
        .observe(duration.as_secs_f64());
}

/// Record one retry (`executor` or `processor`)
pub fn record_retry(source: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.retries.with_label_values(&[source]).inc();
    }
}

pub fn set_effective_concurrency(value: usize) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.effective_concurrency.set(value as f64);
    }
}

/// Record a processed URL (`fetched`, `cached`, `fallback` or `failed`)
pub fn record_url(outcome: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.urls.with_label_values(&[outcome]).inc();
    }
}

/// Record a cache event (`hit`, `miss` or `eviction`)
pub fn record_cache(event: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.cache_events.with_label_values(&[event]).inc();
    }
}

/// Record an iteration (`completed` or `failed`)
pub fn record_iteration(outcome: &str) {
    if let Some(m) = ENGINE_METRICS.get() {
        m.iterations.with_label_values(&[outcome]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_second_init_is_a_no_op() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        assert!(metrics_initialized());
    }

    #[test]
    #[serial]
    fn test_recorded_values_are_exported() {
        init_metrics().unwrap();
        record_task("success", Duration::from_millis(120));
        record_retry("executor");
        record_url("fetched");
        record_cache("hit");
        record_iteration("completed");
        set_effective_concurrency(7);

        let text = gather_metrics().unwrap();
        assert!(text.contains("tansaek_tasks_total"));
        assert!(text.contains("tansaek_cache_events_total"));
        assert!(text.contains("tansaek_effective_concurrency 7"));
    }
}
