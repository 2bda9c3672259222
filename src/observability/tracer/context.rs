//! Trace and span identifiers and the propagated trace context.

use std::fmt;

// `from_str_radix` alone would accept a leading sign
fn is_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// 128-bit trace identifier shared by every span of one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceId(u128);

impl TraceId {
    pub const INVALID: TraceId = TraceId(0);

    pub fn random() -> Self {
        loop {
            let id: u128 = rand::random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn from_u128(id: u128) -> Self {
        Self(id)
    }

    /// Parse 32 hex chars, or 16 hex chars (64-bit B3 ids, zero-extended).
    pub fn from_hex(hex: &str) -> Option<Self> {
        if !matches!(hex.len(), 16 | 32) || !is_hex(hex) {
            return None;
        }
        u128::from_str_radix(hex, 16)
            .ok()
            .filter(|id| *id != 0)
            .map(Self)
    }

    pub fn to_hex(&self) -> String {
        format!("{:032x}", self.0)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// 64-bit span identifier, unique per span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanId(u64);

impl SpanId {
    pub const INVALID: SpanId = SpanId(0);

    pub fn random() -> Self {
        loop {
            let id: u64 = rand::random();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    /// Parse exactly 16 hex chars.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 16 || !is_hex(hex) {
            return None;
        }
        u64::from_str_radix(hex, 16)
            .ok()
            .filter(|id| *id != 0)
            .map(Self)
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identity of a span as carried across process boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: TraceId,
    /// The span this context points at; [`SpanId::INVALID`] when the caller
    /// propagated a trace id without a span id.
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    /// Sampling decision, when one was made or propagated.
    pub sampled: Option<bool>,
}

impl TraceContext {
    pub fn is_sampled(&self) -> bool {
        self.sampled.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let trace = TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap();
        assert_eq!(trace.to_hex(), "4bf92f3577b34da6a3ce929d0e0e4736");

        let short = TraceId::from_hex("a3ce929d0e0e4736").unwrap();
        assert_eq!(short.to_hex(), "0000000000000000a3ce929d0e0e4736");

        let span = SpanId::from_hex("00f067aa0ba902b7").unwrap();
        assert_eq!(span.to_string(), "00f067aa0ba902b7");
    }

    #[test]
    fn test_rejects_invalid_ids() {
        assert!(TraceId::from_hex("00000000000000000000000000000000").is_none());
        assert!(TraceId::from_hex("xyz").is_none());
        assert!(SpanId::from_hex("0000000000000000").is_none());
        assert!(SpanId::from_hex("00f067aa0ba902").is_none());
        assert!(TraceId::random().is_valid());
    }

    #[test]
    fn test_rejects_signed_hex() {
        assert!(TraceId::from_hex("+bf92f3577b34da6a3ce929d0e0e4736").is_none());
        assert!(TraceId::from_hex("+3ce929d0e0e4736").is_none());
        assert!(SpanId::from_hex("+0f067aa0ba902b7").is_none());
    }
}
