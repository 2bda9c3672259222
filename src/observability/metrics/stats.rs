//! Aggregates computed over a window of samples.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;

use super::{ErrorMetric, RequestMetric};

/// Requests slower than this count as slow in business metrics.
pub const SLOW_REQUEST_THRESHOLD: Duration = Duration::from_secs(1);

const TOP_ENDPOINTS: usize = 10;
const TOP_ERRORS: usize = 10;

/// Linear-interpolated percentile of an ascending slice.
///
/// `p` is in `[0, 100]`. An empty slice yields 0.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub count: u64,
    pub average_response_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnhancedStats {
    pub window_secs: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub error_samples: u64,
    /// Fraction of requests with status < 400, in `[0, 1]`.
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub protocol_distribution: BTreeMap<String, u64>,
    pub cache_hit_rate: f64,
    pub top_endpoints: Vec<EndpointStats>,
    pub status_codes: BTreeMap<u16, u64>,
    pub requests_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorCount {
    pub error: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusinessMetrics {
    pub window_secs: u64,
    pub total_requests: u64,
    pub unique_endpoints: usize,
    /// Fraction of requests with status >= 400, in `[0, 1]`.
    pub error_rate: f64,
    pub slow_requests: u64,
    pub peak_requests_per_minute: u64,
    pub top_errors: Vec<ErrorCount>,
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

fn endpoint_key(method: &str, path: &str) -> String {
    format!("{method} {path}")
}

pub fn enhanced_stats(
    requests: &[RequestMetric],
    errors: &[ErrorMetric],
    window: Duration,
) -> EnhancedStats {
    let total = requests.len() as u64;
    let successful = requests.iter().filter(|r| r.status < 400).count() as u64;

    let mut durations: Vec<f64> = requests.iter().map(|r| millis(r.duration)).collect();
    durations.sort_by(|a, b| a.total_cmp(b));
    let average = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };

    let mut protocol_distribution = BTreeMap::new();
    let mut status_codes = BTreeMap::new();
    let mut endpoints: HashMap<String, (u64, f64)> = HashMap::new();
    let mut cache_hits = 0u64;

    for r in requests {
        *protocol_distribution.entry(r.protocol.clone()).or_insert(0) += 1;
        *status_codes.entry(r.status).or_insert(0) += 1;
        let entry = endpoints
            .entry(endpoint_key(&r.method, &r.path))
            .or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += millis(r.duration);
        if r.cache_hit {
            cache_hits += 1;
        }
    }

    let mut top_endpoints: Vec<EndpointStats> = endpoints
        .into_iter()
        .map(|(endpoint, (count, total_ms))| EndpointStats {
            endpoint,
            count,
            average_response_time_ms: total_ms / count as f64,
        })
        .collect();
    top_endpoints.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.endpoint.cmp(&b.endpoint)));
    top_endpoints.truncate(TOP_ENDPOINTS);

    let window_secs = window.as_secs_f64();
    EnhancedStats {
        window_secs: window.as_secs(),
        total_requests: total,
        successful_requests: successful,
        failed_requests: total - successful,
        error_samples: errors.len() as u64,
        success_rate: ratio(successful, total),
        average_response_time_ms: average,
        p50_ms: percentile(&durations, 50.0),
        p90_ms: percentile(&durations, 90.0),
        p95_ms: percentile(&durations, 95.0),
        p99_ms: percentile(&durations, 99.0),
        protocol_distribution,
        cache_hit_rate: ratio(cache_hits, total),
        top_endpoints,
        status_codes,
        requests_per_second: if window_secs > 0.0 {
            total as f64 / window_secs
        } else {
            0.0
        },
    }
}

pub fn business_metrics(
    requests: &[RequestMetric],
    errors: &[ErrorMetric],
    window: Duration,
) -> BusinessMetrics {
    let total = requests.len() as u64;
    let failed = requests.iter().filter(|r| r.status >= 400).count() as u64;
    let unique_endpoints = requests
        .iter()
        .map(|r| (r.method.as_str(), r.path.as_str()))
        .collect::<HashSet<_>>()
        .len();
    let slow_requests = requests
        .iter()
        .filter(|r| r.duration > SLOW_REQUEST_THRESHOLD)
        .count() as u64;

    let mut per_minute: HashMap<u64, u64> = HashMap::new();
    for r in requests {
        *per_minute.entry(r.unix_secs() / 60).or_insert(0) += 1;
    }

    let mut error_counts: HashMap<&str, u64> = HashMap::new();
    for e in errors {
        *error_counts.entry(e.error.as_str()).or_insert(0) += 1;
    }
    let mut top_errors: Vec<ErrorCount> = error_counts
        .into_iter()
        .map(|(error, count)| ErrorCount {
            error: error.to_string(),
            count,
        })
        .collect();
    top_errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error.cmp(&b.error)));
    top_errors.truncate(TOP_ERRORS);

    BusinessMetrics {
        window_secs: window.as_secs(),
        total_requests: total,
        unique_endpoints,
        error_rate: ratio(failed, total),
        slow_requests,
        peak_requests_per_minute: per_minute.values().copied().max().unwrap_or(0),
        top_errors,
    }
}
