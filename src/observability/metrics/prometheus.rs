//! Prometheus exposition of the lifetime counters.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): completed requests by method, status
//! - `gateway_errors_total` (counter): requests that failed before or at the backend
//! - `gateway_cache_hits_total` (counter): responses served from cache
//! - `gateway_request_duration_seconds` (histogram): latency distribution
//!
//! # Design Decisions
//! - Each exporter owns a recorder instead of installing a global one, so
//!   two gateways in one process (and parallel tests) never share series
//! - Updates run inside `with_local_recorder`; rendering goes through the
//!   recorder's handle

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram, with_local_recorder, Unit};
use metrics_exporter_prometheus::{
    BuildError, Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder,
};

/// Upper bounds of `gateway_request_duration_seconds`, `+Inf` implied.
pub const DURATION_BUCKETS: [f64; 6] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

const REQUESTS: &str = "gateway_requests_total";
const ERRORS: &str = "gateway_errors_total";
const CACHE_HITS: &str = "gateway_cache_hits_total";
const DURATION: &str = "gateway_request_duration_seconds";

pub struct PrometheusExporter {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self, BuildError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Full(DURATION.to_string()), &DURATION_BUCKETS)?
            .build_recorder();
        let handle = recorder.handle();
        let exporter = Self { recorder, handle };

        exporter.scoped(|| {
            describe_counter!(REQUESTS, "Total requests handled by the gateway");
            describe_counter!(ERRORS, "Requests that failed before or at the backend");
            describe_counter!(CACHE_HITS, "Responses served from cache");
            describe_histogram!(DURATION, Unit::Seconds, "Request latency");
            // Unlabelled series are exposed from the first scrape
            counter!(ERRORS).absolute(0);
            counter!(CACHE_HITS).absolute(0);
        });
        Ok(exporter)
    }

    fn scoped<T>(&self, f: impl FnOnce() -> T) -> T {
        with_local_recorder(&self.recorder, f)
    }

    pub fn record_request(&self, method: &str, status: u16, duration: Duration, cache_hit: bool) {
        self.scoped(|| {
            counter!(REQUESTS, "method" => method.to_string(), "status" => status.to_string())
                .increment(1);
            histogram!(DURATION).record(duration.as_secs_f64());
            if cache_hit {
                counter!(CACHE_HITS).increment(1);
            }
        });
    }

    pub fn record_error(&self) {
        self.scoped(|| counter!(ERRORS).increment(1));
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl std::fmt::Debug for PrometheusExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusExporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_histogram_and_labels() {
        let exporter = PrometheusExporter::new().unwrap();
        for _ in 0..3 {
            exporter.record_request("GET", 200, Duration::from_millis(50), false);
        }
        exporter.record_request("POST", 500, Duration::from_millis(2500), true);
        exporter.record_error();

        let text = exporter.render();
        assert!(text.contains("# TYPE gateway_requests_total counter"));
        assert!(text.contains("gateway_requests_total{method=\"GET\",status=\"200\"} 3"));
        assert!(text.contains("gateway_requests_total{method=\"POST\",status=\"500\"} 1"));
        assert!(text.contains("gateway_errors_total 1"));
        assert!(text.contains("gateway_cache_hits_total 1"));
        assert!(text.contains("# TYPE gateway_request_duration_seconds histogram"));
        assert!(text.contains("gateway_request_duration_seconds_bucket{le=\"+Inf\"} 4"));
        assert!(text.contains("gateway_request_duration_seconds_count 4"));
    }

    #[test]
    fn test_fresh_exporter_reports_zeroes() {
        let text = PrometheusExporter::new().unwrap().render();
        assert!(text.contains("gateway_errors_total 0"));
        assert!(text.contains("gateway_cache_hits_total 0"));
    }

    #[test]
    fn test_exporters_do_not_share_series() {
        let a = PrometheusExporter::new().unwrap();
        let b = PrometheusExporter::new().unwrap();
        a.record_error();

        assert!(a.render().contains("gateway_errors_total 1"));
        assert!(b.render().contains("gateway_errors_total 0"));
    }
}
