//! Trace context propagation over HTTP headers.
//!
//! Three schemes are accepted on ingest and all three are emitted:
//!
//! ```text
//! custom: x-trace-id, x-span-id, x-parent-span-id
//! W3C:    traceparent: 00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01
//! B3:     x-b3-traceid, x-b3-spanid, x-b3-parentspanid, x-b3-sampled
//! ```
//!
//! Extraction tries custom → W3C → B3; a malformed scheme falls through to the next.

use axum::http::{HeaderMap, HeaderValue};

use super::context::{SpanId, TraceContext, TraceId};

pub const TRACE_ID_HEADER: &str = "x-trace-id";
pub const SPAN_ID_HEADER: &str = "x-span-id";
pub const PARENT_SPAN_ID_HEADER: &str = "x-parent-span-id";
pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const B3_TRACE_ID_HEADER: &str = "x-b3-traceid";
pub const B3_SPAN_ID_HEADER: &str = "x-b3-spanid";
pub const B3_PARENT_SPAN_ID_HEADER: &str = "x-b3-parentspanid";
pub const B3_SAMPLED_HEADER: &str = "x-b3-sampled";

/// Extract a trace context from inbound headers.
pub fn extract(headers: &HeaderMap) -> Option<TraceContext> {
    extract_custom(headers)
        .or_else(|| extract_traceparent(headers))
        .or_else(|| extract_b3(headers))
}

fn value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn span_id(headers: &HeaderMap, name: &str) -> Option<SpanId> {
    value(headers, name).and_then(|v| SpanId::from_hex(v.trim()))
}

fn extract_custom(headers: &HeaderMap) -> Option<TraceContext> {
    let trace_id = TraceId::from_hex(value(headers, TRACE_ID_HEADER)?.trim())?;
    Some(TraceContext {
        trace_id,
        span_id: span_id(headers, SPAN_ID_HEADER).unwrap_or(SpanId::INVALID),
        parent_span_id: span_id(headers, PARENT_SPAN_ID_HEADER),
        sampled: None,
    })
}

/// Parse `{version}-{trace_id}-{span_id}-{flags}`.
pub fn parse_traceparent(value: &str) -> Option<TraceContext> {
    let mut parts = value.trim().split('-');
    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;

    if version.len() != 2 || version.eq_ignore_ascii_case("ff") || trace_id.len() != 32 {
        return None;
    }
    // Version 00 has exactly four fields
    if version == "00" && parts.next().is_some() {
        return None;
    }
    let flags = u8::from_str_radix(flags, 16).ok().filter(|_| flags.len() == 2)?;

    Some(TraceContext {
        trace_id: TraceId::from_hex(trace_id)?,
        span_id: SpanId::from_hex(span_id)?,
        parent_span_id: None,
        sampled: Some(flags & 0x01 == 0x01),
    })
}

fn extract_traceparent(headers: &HeaderMap) -> Option<TraceContext> {
    parse_traceparent(value(headers, TRACEPARENT_HEADER)?)
}

fn extract_b3(headers: &HeaderMap) -> Option<TraceContext> {
    let trace_id = TraceId::from_hex(value(headers, B3_TRACE_ID_HEADER)?.trim())?;
    let sampled = value(headers, B3_SAMPLED_HEADER).and_then(|v| match v.trim() {
        "1" | "true" | "d" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    });
    Some(TraceContext {
        trace_id,
        span_id: span_id(headers, B3_SPAN_ID_HEADER).unwrap_or(SpanId::INVALID),
        parent_span_id: span_id(headers, B3_PARENT_SPAN_ID_HEADER),
        sampled,
    })
}

/// Render the headers that propagate `context` in every scheme.
pub fn inject(context: &TraceContext) -> HeaderMap {
    let trace_id = context.trace_id.to_hex();
    let span_id = context.span_id.to_hex();
    let sampled = context.is_sampled();

    let mut fields = vec![
        (TRACE_ID_HEADER, trace_id.clone()),
        (SPAN_ID_HEADER, span_id.clone()),
        (
            TRACEPARENT_HEADER,
            format!("00-{}-{}-{}", trace_id, span_id, if sampled { "01" } else { "00" }),
        ),
        (B3_TRACE_ID_HEADER, trace_id),
        (B3_SPAN_ID_HEADER, span_id),
        (B3_SAMPLED_HEADER, if sampled { "1" } else { "0" }.to_string()),
    ];
    if let Some(parent) = context.parent_span_id {
        fields.push((PARENT_SPAN_ID_HEADER, parent.to_hex()));
        fields.push((B3_PARENT_SPAN_ID_HEADER, parent.to_hex()));
    }

    // Hex ids and fixed tokens are always valid header values
    let mut headers = HeaderMap::with_capacity(fields.len());
    for (name, value) in fields {
        if let Ok(value) = HeaderValue::try_from(value) {
            headers.insert(name, value);
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::header_map;

    const TRACE: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const SPAN: &str = "00f067aa0ba902b7";

    #[test]
    fn test_extract_traceparent() {
        let traceparent = format!("00-{}-{}-01", TRACE, SPAN);
        let headers = header_map([("traceparent", traceparent.as_str())]);
        let ctx = extract(&headers).unwrap();
        assert_eq!(ctx.trace_id.to_hex(), TRACE);
        assert_eq!(ctx.span_id.to_hex(), SPAN);
        assert_eq!(ctx.sampled, Some(true));

        let unsampled = parse_traceparent(&format!("00-{}-{}-00", TRACE, SPAN)).unwrap();
        assert_eq!(unsampled.sampled, Some(false));
    }

    #[test]
    fn test_malformed_traceparent() {
        for value in [
            format!("ff-{}-{}-01", TRACE, SPAN),
            format!("00-{}-{}-01-extra", TRACE, SPAN),
            format!("00-{}-{}-1", TRACE, SPAN),
            format!("00-00000000000000000000000000000000-{}-01", SPAN),
            format!("00-+bf92f3577b34da6a3ce929d0e0e4736-{}-01", SPAN),
            "garbage".to_string(),
        ] {
            assert!(parse_traceparent(&value).is_none(), "{} should be rejected", value);
        }
    }

    #[test]
    fn test_extract_custom_and_b3() {
        let custom = header_map([("X-Trace-Id", TRACE), ("X-Span-Id", SPAN)]);
        let ctx = extract(&custom).unwrap();
        assert_eq!(ctx.trace_id.to_hex(), TRACE);
        assert_eq!(ctx.sampled, None);

        let b3 = header_map([
            ("x-b3-traceid", "a3ce929d0e0e4736"),
            ("x-b3-spanid", SPAN),
            ("x-b3-sampled", "0"),
        ]);
        let ctx = extract(&b3).unwrap();
        assert_eq!(ctx.trace_id.to_hex(), "0000000000000000a3ce929d0e0e4736");
        assert_eq!(ctx.sampled, Some(false));
    }

    #[test]
    fn test_malformed_scheme_falls_through() {
        let traceparent = format!("00-{}-{}-01", TRACE, SPAN);
        let headers = header_map([("x-trace-id", "nope"), ("traceparent", traceparent.as_str())]);
        assert_eq!(extract(&headers).unwrap().trace_id.to_hex(), TRACE);
    }

    #[test]
    fn test_no_trace_id_anywhere() {
        let headers = header_map([("x-span-id", SPAN)]);
        assert!(extract(&headers).is_none());
    }

    #[test]
    fn test_inject_emits_all_schemes() {
        let ctx = TraceContext {
            trace_id: TraceId::from_hex(TRACE).unwrap(),
            span_id: SpanId::from_hex(SPAN).unwrap(),
            parent_span_id: Some(SpanId::from_u64(7)),
            sampled: Some(true),
        };
        let headers = inject(&ctx);

        assert_eq!(
            headers.get("traceparent").unwrap(),
            format!("00-{}-{}-01", TRACE, SPAN).as_str()
        );
        assert_eq!(headers.get("x-b3-traceid").unwrap(), TRACE);
        assert_eq!(headers.get("x-parent-span-id").unwrap(), "0000000000000007");

        // What we emit we can read back through each scheme on its own
        for scheme in [TRACE_ID_HEADER, TRACEPARENT_HEADER, B3_TRACE_ID_HEADER] {
            let only: HeaderMap = headers
                .iter()
                .filter(|(k, _)| match scheme {
                    TRACEPARENT_HEADER => k.as_str() == TRACEPARENT_HEADER,
                    TRACE_ID_HEADER => k.as_str().starts_with("x-") && !k.as_str().starts_with("x-b3"),
                    _ => k.as_str().starts_with("x-b3"),
                })
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let back = extract(&only).unwrap();
            assert_eq!(back.trace_id, ctx.trace_id);
            assert_eq!(back.span_id, ctx.span_id);
        }
    }
}
