//! Request metrics collection.
//!
//! # Responsibilities
//! - Record request and error samples on the request path in O(1)
//! - Feed lifetime counters to a per-collector Prometheus recorder
//! - Compute windowed aggregates (percentiles, top endpoints, error mix)
//!
//! # Design Decisions
//! - Samples go into striped ring buffers; concurrent recorders rarely share a lock
//! - Each buffer is bounded by `max_samples` (oldest dropped) and swept by age
//! - Lifetime totals for health reporting are plain atomics
//! - Aggregation copies the window out first, so readers never stall writers

pub mod prometheus;
pub mod stats;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use metrics_exporter_prometheus::BuildError;
use serde::Serialize;

use crate::config::MetricsConfig;

pub use prometheus::{PrometheusExporter, DURATION_BUCKETS};
pub use stats::{percentile, BusinessMetrics, EndpointStats, EnhancedStats, ErrorCount};

const STRIPES: usize = 16;

/// One completed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMetric {
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration: Duration,
    pub protocol: String,
    pub cache_hit: bool,
    pub timestamp: SystemTime,
}

impl RequestMetric {
    pub fn unix_secs(&self) -> u64 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// One failed request, with the reason it failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorMetric {
    pub method: String,
    pub path: String,
    pub error: String,
    pub duration: Duration,
    pub timestamp: SystemTime,
}

impl ErrorMetric {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        error: impl Into<String>,
        duration: Duration,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            error: error.into(),
            duration,
            timestamp,
        }
    }
}

trait Timestamped {
    fn timestamp(&self) -> SystemTime;
}

impl Timestamped for RequestMetric {
    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

impl Timestamped for ErrorMetric {
    fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

/// A bounded sample buffer split into independently locked stripes.
struct StripedBuffer<T> {
    stripes: Vec<Mutex<VecDeque<T>>>,
    stripe_capacity: usize,
    cursor: AtomicUsize,
}

impl<T: Timestamped + Clone> StripedBuffer<T> {
    fn new(max_samples: usize) -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Mutex::new(VecDeque::new())).collect(),
            stripe_capacity: max_samples.div_ceil(STRIPES).max(1),
            cursor: AtomicUsize::new(0),
        }
    }

    fn lock(stripe: &Mutex<VecDeque<T>>) -> MutexGuard<'_, VecDeque<T>> {
        stripe.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, sample: T) {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % STRIPES;
        let mut stripe = Self::lock(&self.stripes[index]);
        if stripe.len() >= self.stripe_capacity {
            stripe.pop_front();
        }
        stripe.push_back(sample);
    }

    fn since(&self, cutoff: SystemTime) -> Vec<T> {
        let mut out = Vec::new();
        for stripe in &self.stripes {
            out.extend(
                Self::lock(stripe)
                    .iter()
                    .filter(|s| s.timestamp() >= cutoff)
                    .cloned(),
            );
        }
        out
    }

    fn retain_since(&self, cutoff: SystemTime) -> usize {
        let mut removed = 0;
        for stripe in &self.stripes {
            let mut stripe = Self::lock(stripe);
            let before = stripe.len();
            stripe.retain(|s| s.timestamp() >= cutoff);
            removed += before - stripe.len();
        }
        removed
    }

    fn len(&self) -> usize {
        self.stripes.iter().map(|s| Self::lock(s).len()).sum()
    }
}

/// Collector counters for health reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CollectorStats {
    pub request_samples: usize,
    pub error_samples: usize,
    pub requests_total: u64,
    pub errors_total: u64,
}

pub struct MetricsCollector {
    requests: StripedBuffer<RequestMetric>,
    errors: StripedBuffer<ErrorMetric>,
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    exporter: PrometheusExporter,
}

impl MetricsCollector {
    pub fn new(config: &MetricsConfig) -> Result<Self, BuildError> {
        Ok(Self {
            requests: StripedBuffer::new(config.max_samples),
            errors: StripedBuffer::new(config.max_samples),
            requests_total: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            exporter: PrometheusExporter::new()?,
        })
    }

    pub fn record_request(&self, metric: RequestMetric) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.exporter
            .record_request(&metric.method, metric.status, metric.duration, metric.cache_hit);
        self.requests.push(metric);
    }

    pub fn record_error(&self, metric: ErrorMetric) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        self.exporter.record_error();
        self.errors.push(metric);
    }

    fn cutoff(window: Duration) -> SystemTime {
        SystemTime::now()
            .checked_sub(window)
            .unwrap_or(UNIX_EPOCH)
    }

    /// Request samples recorded within `window`.
    pub fn requests_since(&self, window: Duration) -> Vec<RequestMetric> {
        self.requests.since(Self::cutoff(window))
    }

    /// Error samples recorded within `window`.
    pub fn errors_since(&self, window: Duration) -> Vec<ErrorMetric> {
        self.errors.since(Self::cutoff(window))
    }

    pub fn enhanced_stats(&self, window: Duration) -> EnhancedStats {
        let cutoff = Self::cutoff(window);
        stats::enhanced_stats(&self.requests.since(cutoff), &self.errors.since(cutoff), window)
    }

    pub fn business_metrics(&self, window: Duration) -> BusinessMetrics {
        let cutoff = Self::cutoff(window);
        stats::business_metrics(&self.requests.since(cutoff), &self.errors.since(cutoff), window)
    }

    pub fn export_prometheus(&self) -> String {
        self.exporter.render()
    }

    /// Drop samples older than `retention`. Lifetime counters are kept.
    pub fn cleanup(&self, retention: Duration) -> usize {
        let cutoff = Self::cutoff(retention);
        let removed = self.requests.retain_since(cutoff) + self.errors.retain_since(cutoff);
        if removed > 0 {
            tracing::debug!(removed, "Expired metric samples");
        }
        removed
    }

    pub fn stats(&self) -> CollectorStats {
        CollectorStats {
            request_samples: self.requests.len(),
            error_samples: self.errors.len(),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
        }
    }
}
