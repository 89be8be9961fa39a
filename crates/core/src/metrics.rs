//! Observability hooks for the invocation engine.
//!
//! A `MetricsSink` is passed in explicitly at construction — there is no
//! process-wide metrics state. The default sink forwards to `tracing`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for adapter call timings, counters, and errors.
pub trait MetricsSink: Send + Sync {
    fn record_timing(&self, name: &str, millis: u64, labels: &[(&str, &str)]);
    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]);
    fn record_error(&self, name: &str, error: &str, labels: &[(&str, &str)]);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_timing(&self, _name: &str, _millis: u64, _labels: &[(&str, &str)]) {}
    fn incr_counter(&self, _name: &str, _labels: &[(&str, &str)]) {}
    fn record_error(&self, _name: &str, _error: &str, _labels: &[(&str, &str)]) {}
}

/// Emits metrics as `tracing` debug events and keeps coarse totals.
#[derive(Debug, Default)]
pub struct TracingMetrics {
    timings: AtomicU64,
    counters: AtomicU64,
    errors: AtomicU64,
}

impl TracingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_total(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

impl MetricsSink for TracingMetrics {
    fn record_timing(&self, name: &str, millis: u64, labels: &[(&str, &str)]) {
        self.timings.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(metric = %name, millis, ?labels, "timing");
    }

    fn incr_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.counters.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(metric = %name, ?labels, "counter");
    }

    fn record_error(&self, name: &str, error: &str, labels: &[(&str, &str)]) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(metric = %name, error = %error, ?labels, "error");
    }
}
