//! Span export.
//!
//! Finished spans are shaped as OpenTelemetry JSON:
//!
//! ```text
//! { "resourceSpans": [ { "resource": {...},
//!     "instrumentationLibrarySpans": [ { "instrumentationLibrary": {...},
//!         "spans": [ ... ] } ] } ] }
//! ```
//!
//! and handed to a [`SpanExporter`]: an HTTP collector, or the local log when
//! no collector is configured.

use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use serde::Serialize;

use super::span::{Span, SpanStatus, TagValue};

/// Error returned when a batch could not be delivered.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("collector request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("collector responded with status {0}")]
    Status(u16),
    #[error("exporter unavailable: {0}")]
    Unavailable(String),
}

/// Destination for finished spans.
pub trait SpanExporter: Send + Sync {
    fn export(&self, payload: ExportPayload) -> BoxFuture<'_, Result<(), ExportError>>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportPayload {
    pub resource_spans: Vec<ResourceSpans>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans {
    pub resource: Resource,
    pub instrumentation_library_spans: Vec<InstrumentationLibrarySpans>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentationLibrarySpans {
    pub instrumentation_library: InstrumentationLibrary,
    pub spans: Vec<OtlpSpan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstrumentationLibrary {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpSpan {
    pub trace_id: String,
    pub span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: u8,
    pub start_time_unix_nano: String,
    pub end_time_unix_nano: String,
    pub attributes: Vec<KeyValue>,
    pub events: Vec<OtlpEvent>,
    pub status: OtlpStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtlpEvent {
    pub time_unix_nano: String,
    pub name: String,
    pub attributes: Vec<KeyValue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OtlpStatus {
    pub code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AnyValue,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AnyValue {
    StringValue(String),
    // OTLP JSON encodes 64-bit integers as strings
    IntValue(String),
    DoubleValue(f64),
    BoolValue(bool),
}

impl From<&TagValue> for AnyValue {
    fn from(value: &TagValue) -> Self {
        match value {
            TagValue::String(s) => AnyValue::StringValue(s.clone()),
            TagValue::Int(i) => AnyValue::IntValue(i.to_string()),
            TagValue::Float(f) => AnyValue::DoubleValue(*f),
            TagValue::Bool(b) => AnyValue::BoolValue(*b),
        }
    }
}

const SPAN_KIND_SERVER: u8 = 2;
const STATUS_CODE_OK: u8 = 1;
const STATUS_CODE_ERROR: u8 = 2;

fn unix_nanos(time: SystemTime) -> String {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string()
}

fn attributes<'a>(tags: impl IntoIterator<Item = (&'a String, &'a TagValue)>) -> Vec<KeyValue> {
    tags.into_iter()
        .map(|(k, v)| KeyValue {
            key: k.clone(),
            value: v.into(),
        })
        .collect()
}

impl From<&Span> for OtlpSpan {
    fn from(span: &Span) -> Self {
        let status = match span.status {
            SpanStatus::Ok => OtlpStatus {
                code: STATUS_CODE_OK,
                message: None,
            },
            SpanStatus::Error => OtlpStatus {
                code: STATUS_CODE_ERROR,
                message: None,
            },
            SpanStatus::Timeout => OtlpStatus {
                code: STATUS_CODE_ERROR,
                message: Some("timeout".to_string()),
            },
        };

        OtlpSpan {
            trace_id: span.trace_id.to_hex(),
            span_id: span.span_id.to_hex(),
            parent_span_id: span.parent_span_id.map(|id| id.to_hex()),
            name: span.operation_name.clone(),
            kind: SPAN_KIND_SERVER,
            start_time_unix_nano: unix_nanos(span.start_time),
            end_time_unix_nano: unix_nanos(span.end_time.unwrap_or(span.start_time)),
            attributes: attributes(&span.tags),
            events: span
                .logs
                .iter()
                .map(|log| OtlpEvent {
                    time_unix_nano: unix_nanos(log.timestamp),
                    name: "log".to_string(),
                    attributes: attributes(&log.fields),
                })
                .collect(),
            status,
        }
    }
}

impl ExportPayload {
    pub fn from_spans(service_name: &str, spans: &[Span]) -> Self {
        Self {
            resource_spans: vec![ResourceSpans {
                resource: Resource {
                    attributes: vec![KeyValue {
                        key: "service.name".to_string(),
                        value: AnyValue::StringValue(service_name.to_string()),
                    }],
                },
                instrumentation_library_spans: vec![InstrumentationLibrarySpans {
                    instrumentation_library: InstrumentationLibrary {
                        name: env!("CARGO_PKG_NAME").to_string(),
                        version: env!("CARGO_PKG_VERSION").to_string(),
                    },
                    spans: spans.iter().map(OtlpSpan::from).collect(),
                }],
            }],
        }
    }

    pub fn span_count(&self) -> usize {
        self.resource_spans
            .iter()
            .flat_map(|r| &r.instrumentation_library_spans)
            .map(|l| l.spans.len())
            .sum()
    }

    pub fn spans(&self) -> impl Iterator<Item = &OtlpSpan> {
        self.resource_spans
            .iter()
            .flat_map(|r| &r.instrumentation_library_spans)
            .flat_map(|l| &l.spans)
    }
}

/// Posts batches to an OpenTelemetry-compatible HTTP collector.
pub struct HttpSpanExporter {
    client: reqwest::Client,
    url: String,
}

impl HttpSpanExporter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl SpanExporter for HttpSpanExporter {
    fn export(&self, payload: ExportPayload) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(async move {
            let response = self.client.post(&self.url).json(&payload).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(ExportError::Status(status.as_u16()));
            }
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Writes finished spans to the structured log.
#[derive(Debug, Default)]
pub struct LogSpanExporter;

impl SpanExporter for LogSpanExporter {
    fn export(&self, payload: ExportPayload) -> BoxFuture<'_, Result<(), ExportError>> {
        Box::pin(async move {
            for span in payload.spans() {
                tracing::info!(
                    target: "api_gateway::spans",
                    trace_id = %span.trace_id,
                    span_id = %span.span_id,
                    parent_span_id = span.parent_span_id.as_deref().unwrap_or(""),
                    name = %span.name,
                    start_ns = %span.start_time_unix_nano,
                    end_ns = %span.end_time_unix_nano,
                    status = span.status.code,
                    "span finished"
                );
            }
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::tracer::context::{SpanId, TraceContext, TraceId};

    #[test]
    fn test_payload_shape() {
        let ctx = TraceContext {
            trace_id: TraceId::from_u128(1),
            span_id: SpanId::from_u64(2),
            parent_span_id: Some(SpanId::from_u64(3)),
            sampled: Some(true),
        };
        let mut span = Span::open(ctx, "GET /api/v1/meetings", false);
        span.tags.insert("http.status_code".into(), TagValue::Int(200));
        span.status = SpanStatus::Timeout;
        span.end_time = Some(span.start_time + Duration::from_millis(5));

        let payload = ExportPayload::from_spans("gateway-test", &[span]);
        let json = serde_json::to_value(&payload).unwrap();

        let resource = &json["resourceSpans"][0];
        assert_eq!(resource["resource"]["attributes"][0]["value"]["stringValue"], "gateway-test");
        let otlp = &resource["instrumentationLibrarySpans"][0]["spans"][0];
        assert_eq!(otlp["traceId"], "00000000000000000000000000000001");
        assert_eq!(otlp["parentSpanId"], "0000000000000003");
        assert_eq!(otlp["attributes"][0]["value"]["intValue"], "200");
        assert_eq!(otlp["status"]["code"], 2);
        assert_eq!(otlp["status"]["message"], "timeout");
        assert_eq!(payload.span_count(), 1);
    }
}
