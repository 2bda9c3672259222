//! Route matching logic.
//!
//! # Responsibilities
//! - Match the request method (`*` matches any)
//! - Match path patterns: literal segments, `:name` captures, trailing `*`
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Method matching is case-insensitive, path matching is case-sensitive
//! - Patterns are split into segments once at compile time
//! - No regex to guarantee O(n) matching

use std::collections::BTreeMap;

use axum::http::Method;

use crate::http::message::GatewayRequest;

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the request matches this condition.
    fn matches(&self, req: &GatewayRequest) -> bool;
}

/// Matches the request method.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    /// `None` matches any method.
    expected: Option<Method>,
}

impl MethodMatcher {
    /// `*` (or an empty string) matches any method.
    pub fn new(method: &str) -> Result<Self, axum::http::method::InvalidMethod> {
        let method = method.trim();
        if method.is_empty() || method == "*" {
            return Ok(Self { expected: None });
        }
        Ok(Self {
            expected: Some(Method::from_bytes(method.to_ascii_uppercase().as_bytes())?),
        })
    }
}

impl Matcher for MethodMatcher {
    fn matches(&self, req: &GatewayRequest) -> bool {
        self.expected.as_ref().map_or(true, |m| m == req.method())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Rest,
}

/// Matches the request path against a segment pattern.
#[derive(Debug, Clone)]
pub struct PathPatternMatcher {
    segments: Vec<Segment>,
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl PathPatternMatcher {
    pub fn new(pattern: &str) -> Self {
        let segments = split(pattern)
            .map(|s| match s {
                "*" => Segment::Rest,
                s if s.starts_with(':') && s.len() > 1 => Segment::Param(s[1..].to_string()),
                s => Segment::Literal(s.to_string()),
            })
            .collect();
        Self { segments }
    }

    /// Named captures for `path`, or `None` if it does not match.
    pub fn capture(&self, path: &str) -> Option<BTreeMap<String, String>> {
        let mut params = BTreeMap::new();
        let mut parts = split(path);
        for segment in &self.segments {
            match segment {
                Segment::Rest => return Some(params),
                Segment::Literal(expected) => {
                    if parts.next()? != expected.as_str() {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), parts.next()?.to_string());
                }
            }
        }
        parts.next().is_none().then_some(params)
    }

    /// Literal segments count most, captures next; used to break priority ties.
    pub fn specificity(&self) -> usize {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(_) => 3,
                Segment::Param(_) => 2,
                Segment::Rest => 0,
            })
            .sum()
    }
}

impl Matcher for PathPatternMatcher {
    fn matches(&self, req: &GatewayRequest) -> bool {
        self.capture(req.path()).is_some()
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, req: &GatewayRequest) -> bool {
        self.matchers.iter().all(|m| m.matches(req))
    }
}
