//! Distributed tracer.
//!
//! # Span Lifecycle
//! ```text
//! start_trace / start_child_span
//!     → open (active map, mutable via add_tags / add_log / set_status)
//!     → end_span
//!         → non-root: parked with its trace until the root closes
//!         → local root: trace complete, every closed span → export batch
//!     → flush (timer, default 10s) → SpanExporter
//!         → on failure: re-queued, batch capped (oldest dropped)
//! ```
//!
//! # Design Decisions
//! - Unsampled traces get valid ids but no spans; callers never branch on sampling
//! - A child whose parent is gone starts a new root instead of failing
//! - Open spans and traces live in sharded maps; only the export batch has a mutex
//! - Export never runs on the request path

pub mod context;
pub mod exporter;
pub mod propagation;
pub mod span;

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use axum::http::HeaderMap;
use dashmap::DashMap;
use serde::Serialize;

use crate::config::TracingConfig;

pub use context::{SpanId, TraceContext, TraceId};
pub use exporter::{ExportError, ExportPayload, HttpSpanExporter, LogSpanExporter, SpanExporter};
pub use span::{Span, SpanLog, SpanStatus, TagValue};

/// Spans of one trace that closed before the trace completed.
struct TraceState {
    started_at: SystemTime,
    open_roots: usize,
    finished: Vec<Span>,
}

/// Tracer counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TracerStats {
    pub active_spans: usize,
    pub open_traces: usize,
    pub buffered_spans: usize,
    pub exported_spans: u64,
    pub dropped_spans: u64,
    pub export_failures: u64,
}

pub struct Tracer {
    enabled: bool,
    service_name: String,
    sample_rate: f64,
    max_buffered_spans: usize,
    active: DashMap<SpanId, Span>,
    traces: DashMap<TraceId, TraceState>,
    batch: Mutex<VecDeque<Span>>,
    exporter: Arc<dyn SpanExporter>,
    exported: AtomicU64,
    dropped: AtomicU64,
    export_failures: AtomicU64,
}

impl Tracer {
    pub fn new(config: &TracingConfig, exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            enabled: config.enabled,
            service_name: config.service_name.clone(),
            sample_rate: config.sample_rate.clamp(0.0, 1.0),
            max_buffered_spans: config.max_buffered_spans.max(1),
            active: DashMap::new(),
            traces: DashMap::new(),
            batch: Mutex::new(VecDeque::new()),
            exporter,
            exported: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            export_failures: AtomicU64::new(0),
        }
    }

    /// Build a tracer exporting to the configured collector, or the log.
    pub fn from_config(config: &TracingConfig) -> Result<Self, ExportError> {
        let exporter: Arc<dyn SpanExporter> = match &config.collector_url {
            Some(url) => Arc::new(HttpSpanExporter::new(
                url.clone(),
                Duration::from_secs(config.export_timeout_secs),
            )?),
            None => Arc::new(LogSpanExporter),
        };
        tracing::info!(
            exporter = exporter.name(),
            sample_rate = config.sample_rate,
            "Tracer initialized"
        );
        Ok(Self::new(config, exporter))
    }

    fn should_sample(&self) -> bool {
        if self.sample_rate <= 0.0 {
            return false;
        }
        fastrand::f64() <= self.sample_rate
    }

    /// Start a new trace, optionally continuing a propagated context.
    pub fn start_trace(&self, operation_name: &str, parent: Option<&TraceContext>) -> TraceContext {
        let sampled = self.enabled
            && parent
                .and_then(|p| p.sampled)
                .unwrap_or_else(|| self.should_sample());

        let context = TraceContext {
            trace_id: parent.map(|p| p.trace_id).unwrap_or_else(TraceId::random),
            span_id: SpanId::random(),
            parent_span_id: parent.map(|p| p.span_id).filter(SpanId::is_valid),
            sampled: Some(sampled),
        };
        if !sampled {
            return context;
        }

        let span = Span::open(context, operation_name, true);
        self.traces
            .entry(context.trace_id)
            .or_insert_with(|| TraceState {
                started_at: span.start_time,
                open_roots: 0,
                finished: Vec::new(),
            })
            .open_roots += 1;
        self.active.insert(context.span_id, span);
        context
    }

    /// Start a span under a locally open parent, or a new root if the parent is gone.
    pub fn start_child_span(&self, operation_name: &str, parent_span_id: SpanId) -> TraceContext {
        let parent = self.active.get(&parent_span_id).map(|s| s.context());
        match parent {
            Some(parent) => self.open_child(operation_name, &parent),
            None => {
                tracing::debug!(
                    parent_span_id = %parent_span_id,
                    operation = operation_name,
                    "Parent span not open, starting new trace"
                );
                self.start_trace(operation_name, None)
            }
        }
    }

    /// Start a span under `parent`, honoring its sampling decision.
    pub fn start_span(&self, operation_name: &str, parent: &TraceContext) -> TraceContext {
        if !parent.is_sampled() || !self.enabled {
            return TraceContext {
                trace_id: parent.trace_id,
                span_id: SpanId::random(),
                parent_span_id: Some(parent.span_id).filter(SpanId::is_valid),
                sampled: Some(false),
            };
        }
        if self.active.contains_key(&parent.span_id) {
            self.open_child(operation_name, parent)
        } else {
            self.start_trace(operation_name, Some(parent))
        }
    }

    fn open_child(&self, operation_name: &str, parent: &TraceContext) -> TraceContext {
        let context = TraceContext {
            trace_id: parent.trace_id,
            span_id: SpanId::random(),
            parent_span_id: Some(parent.span_id),
            sampled: Some(true),
        };
        let span = Span::open(context, operation_name, false);
        self.traces
            .entry(context.trace_id)
            .or_insert_with(|| TraceState {
                started_at: span.start_time,
                open_roots: 0,
                finished: Vec::new(),
            });
        self.active.insert(context.span_id, span);
        context
    }

    /// Add tags to an open span. Returns false if the span is not open.
    pub fn add_tags<I, K, V>(&self, span_id: SpanId, tags: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<TagValue>,
    {
        match self.active.get_mut(&span_id) {
            Some(mut span) => {
                span.tags
                    .extend(tags.into_iter().map(|(k, v)| (k.into(), v.into())));
                true
            }
            None => false,
        }
    }

    /// Append a timestamped log entry to an open span.
    pub fn add_log<I, K, V>(&self, span_id: SpanId, fields: I) -> bool
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<TagValue>,
    {
        match self.active.get_mut(&span_id) {
            Some(mut span) => {
                span.logs.push(SpanLog {
                    timestamp: SystemTime::now(),
                    fields: fields.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
                });
                true
            }
            None => false,
        }
    }

    pub fn set_status(&self, span_id: SpanId, status: SpanStatus) -> bool {
        match self.active.get_mut(&span_id) {
            Some(mut span) => {
                span.status = status;
                true
            }
            None => false,
        }
    }

    /// Close a span. Closing the trace's root makes the whole trace exportable.
    pub fn end_span(&self, span_id: SpanId) -> bool {
        let Some((_, mut span)) = self.active.remove(&span_id) else {
            return false;
        };
        span.end_time = Some(SystemTime::now());
        let trace_id = span.trace_id;
        let local_root = span.local_root;

        let ready = match self.traces.get_mut(&trace_id) {
            Some(mut state) => {
                if local_root {
                    state.open_roots = state.open_roots.saturating_sub(1);
                }
                state.finished.push(span);
                if state.open_roots == 0 {
                    Some(std::mem::take(&mut state.finished))
                } else {
                    None
                }
            }
            // Trace already completed; late spans go straight to the batch
            None => Some(vec![span]),
        };

        if let Some(spans) = ready {
            self.traces
                .remove_if(&trace_id, |_, state| state.open_roots == 0 && state.finished.is_empty());
            self.enqueue(spans);
        }
        true
    }

    fn lock_batch(&self) -> MutexGuard<'_, VecDeque<Span>> {
        self.batch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, spans: Vec<Span>) {
        let mut batch = self.lock_batch();
        batch.extend(spans);
        self.trim(&mut batch);
    }

    fn trim(&self, batch: &mut VecDeque<Span>) {
        let mut dropped = 0;
        while batch.len() > self.max_buffered_spans {
            batch.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            self.dropped.fetch_add(dropped, Ordering::Relaxed);
            tracing::warn!(dropped, buffered = batch.len(), "Span buffer full, dropped oldest spans");
        }
    }

    /// Export everything in the batch. Failed spans are re-queued.
    pub async fn flush(&self) -> Result<usize, ExportError> {
        let spans: Vec<Span> = {
            let mut batch = self.lock_batch();
            batch.drain(..).collect()
        };
        if spans.is_empty() {
            return Ok(0);
        }

        let payload = ExportPayload::from_spans(&self.service_name, &spans);
        match self.exporter.export(payload).await {
            Ok(()) => {
                let count = spans.len();
                self.exported.fetch_add(count as u64, Ordering::Relaxed);
                tracing::debug!(count, exporter = self.exporter.name(), "Exported spans");
                Ok(count)
            }
            Err(e) => {
                self.export_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    error = %e,
                    count = spans.len(),
                    exporter = self.exporter.name(),
                    "Span export failed, retaining batch"
                );
                let mut batch = self.lock_batch();
                for span in spans.into_iter().rev() {
                    batch.push_front(span);
                }
                self.trim(&mut batch);
                Err(e)
            }
        }
    }

    /// Evict traces whose earliest span started before `now - max_age`.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut stale: HashSet<TraceId> = self
            .traces
            .iter()
            .filter(|t| t.started_at < cutoff)
            .map(|t| *t.key())
            .collect();
        // Open spans whose trace state is already gone
        stale.extend(
            self.active
                .iter()
                .filter(|s| s.start_time < cutoff)
                .map(|s| s.trace_id),
        );

        if stale.is_empty() {
            return 0;
        }
        for trace_id in &stale {
            self.traces.remove(trace_id);
        }
        self.active.retain(|_, span| !stale.contains(&span.trace_id));

        tracing::debug!(evicted = stale.len(), "Evicted abandoned traces");
        stale.len()
    }

    /// Headers propagating an open span, in every scheme.
    pub fn inject_context(&self, span_id: SpanId) -> HeaderMap {
        self.active
            .get(&span_id)
            .map(|span| propagation::inject(&span.context()))
            .unwrap_or_default()
    }

    pub fn extract_context(&self, headers: &HeaderMap) -> Option<TraceContext> {
        propagation::extract(headers)
    }

    /// Copy of an open span.
    pub fn active_span(&self, span_id: SpanId) -> Option<Span> {
        self.active.get(&span_id).map(|s| s.clone())
    }

    /// Copy of the spans awaiting export.
    pub fn buffered_spans(&self) -> Vec<Span> {
        self.lock_batch()
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> TracerStats {
        TracerStats {
            active_spans: self.active.len(),
            open_traces: self.traces.len(),
            buffered_spans: self.lock_batch().len(),
            exported_spans: self.exported.load(Ordering::Relaxed),
            dropped_spans: self.dropped.load(Ordering::Relaxed),
            export_failures: self.export_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::AtomicBool;

    /// Records payloads; fails while `failing` is set.
    #[derive(Default)]
    struct RecordingExporter {
        failing: AtomicBool,
        received: Mutex<Vec<usize>>,
    }

    impl SpanExporter for RecordingExporter {
        fn export(&self, payload: ExportPayload) -> BoxFuture<'_, Result<(), ExportError>> {
            Box::pin(async move {
                if self.failing.load(Ordering::SeqCst) {
                    return Err(ExportError::Unavailable("collector down".into()));
                }
                self.received.lock().unwrap().push(payload.span_count());
                Ok(())
            })
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn tracer_with(config: TracingConfig) -> (Tracer, Arc<RecordingExporter>) {
        let exporter = Arc::new(RecordingExporter::default());
        (Tracer::new(&config, exporter.clone()), exporter)
    }

    fn tracer() -> (Tracer, Arc<RecordingExporter>) {
        tracer_with(TracingConfig::default())
    }

    #[test]
    fn test_child_shares_trace_and_root_close_releases_trace() {
        let (tracer, _) = tracer();
        let root = tracer.start_trace("GET /meetings", None);
        let child = tracer.start_child_span("backend", root.span_id);
        let grandchild = tracer.start_child_span("db", child.span_id);

        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id, Some(root.span_id));
        assert_eq!(grandchild.trace_id, root.trace_id);

        assert!(tracer.end_span(grandchild.span_id));
        assert!(tracer.end_span(child.span_id));
        assert!(tracer.buffered_spans().is_empty(), "trace not complete yet");

        assert!(tracer.end_span(root.span_id));
        let buffered = tracer.buffered_spans();
        assert_eq!(buffered.len(), 3);
        assert!(buffered.iter().all(|s| s.trace_id == root.trace_id));
        assert_eq!(tracer.stats().open_traces, 0);
    }

    #[test]
    fn test_late_child_goes_straight_to_batch() {
        let (tracer, _) = tracer();
        let root = tracer.start_trace("root", None);
        let child = tracer.start_child_span("slow", root.span_id);
        tracer.end_span(root.span_id);
        assert_eq!(tracer.buffered_spans().len(), 1);

        tracer.end_span(child.span_id);
        assert_eq!(tracer.buffered_spans().len(), 2);
    }

    #[test]
    fn test_missing_parent_starts_new_root() {
        let (tracer, _) = tracer();
        let orphan = tracer.start_child_span("orphan", SpanId::from_u64(42));
        assert!(orphan.parent_span_id.is_none());
        assert!(tracer.active_span(orphan.span_id).unwrap().is_local_root());
    }

    #[test]
    fn test_closed_span_is_immutable() {
        let (tracer, _) = tracer();
        let root = tracer.start_trace("root", None);
        assert!(tracer.add_tags(root.span_id, [("http.method", "GET")]));
        assert!(tracer.add_log(root.span_id, [("event", "received")]));
        assert!(tracer.set_status(root.span_id, SpanStatus::Error));
        tracer.end_span(root.span_id);

        assert!(!tracer.add_tags(root.span_id, [("late", true)]));
        assert!(!tracer.set_status(root.span_id, SpanStatus::Ok));
        assert!(!tracer.end_span(root.span_id));

        let span = &tracer.buffered_spans()[0];
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.tags.get("http.method"), Some(&TagValue::from("GET")));
        assert_eq!(span.logs.len(), 1);
        assert!(span.duration().is_some());
    }

    #[test]
    fn test_unsampled_trace_creates_no_span() {
        let (tracer, _) = tracer_with(TracingConfig {
            sample_rate: 0.0,
            ..TracingConfig::default()
        });
        let ctx = tracer.start_trace("root", None);
        assert!(ctx.trace_id.is_valid());
        assert!(ctx.span_id.is_valid());
        assert_eq!(ctx.sampled, Some(false));
        assert_eq!(tracer.stats().active_spans, 0);

        let child = tracer.start_span("child", &ctx);
        assert_eq!(child.trace_id, ctx.trace_id);
        assert_eq!(tracer.stats().active_spans, 0);
    }

    #[test]
    fn test_remote_parent_continues_trace() {
        let (tracer, _) = tracer();
        let remote = propagation::parse_traceparent(
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )
        .unwrap();
        let ctx = tracer.start_trace("inbound", Some(&remote));
        assert_eq!(ctx.trace_id, remote.trace_id);
        assert_eq!(ctx.parent_span_id, Some(remote.span_id));

        let headers = tracer.inject_context(ctx.span_id);
        let back = tracer.extract_context(&headers).unwrap();
        assert_eq!(back.trace_id, remote.trace_id);
        assert_eq!(back.span_id, ctx.span_id);
    }

    #[tokio::test]
    async fn test_flush_exports_and_clears() {
        let (tracer, exporter) = tracer();
        for _ in 0..3 {
            let ctx = tracer.start_trace("op", None);
            tracer.end_span(ctx.span_id);
        }
        assert_eq!(tracer.flush().await.unwrap(), 3);
        assert_eq!(*exporter.received.lock().unwrap(), vec![3]);
        assert_eq!(tracer.stats().buffered_spans, 0);
        assert_eq!(tracer.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_export_is_retained_and_bounded() {
        let (tracer, exporter) = tracer_with(TracingConfig {
            max_buffered_spans: 4,
            ..TracingConfig::default()
        });
        exporter.failing.store(true, Ordering::SeqCst);

        for _ in 0..3 {
            let ctx = tracer.start_trace("op", None);
            tracer.end_span(ctx.span_id);
        }
        assert!(tracer.flush().await.is_err());
        assert_eq!(tracer.stats().buffered_spans, 3);

        for _ in 0..3 {
            let ctx = tracer.start_trace("op", None);
            tracer.end_span(ctx.span_id);
        }
        let stats = tracer.stats();
        assert_eq!(stats.buffered_spans, 4);
        assert_eq!(stats.dropped_spans, 2);
        assert_eq!(stats.export_failures, 1);

        exporter.failing.store(false, Ordering::SeqCst);
        assert_eq!(tracer.flush().await.unwrap(), 4);
        assert_eq!(tracer.stats().exported_spans, 4);
    }

    #[test]
    fn test_cleanup_evicts_abandoned_traces() {
        let (tracer, _) = tracer();
        let abandoned = tracer.start_trace("never closed", None);
        tracer.start_child_span("child", abandoned.span_id);

        assert_eq!(tracer.cleanup(Duration::from_secs(60)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracer.cleanup(Duration::from_millis(1)), 1);

        let stats = tracer.stats();
        assert_eq!(stats.active_spans, 0);
        assert_eq!(stats.open_traces, 0);
    }
}
