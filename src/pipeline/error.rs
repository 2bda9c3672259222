//! Pipeline error types.

use axum::http::StatusCode;
use thiserror::Error;

use crate::http::message::InvalidHeader;
use crate::security::rate_limit::RateLimitDecision;

/// Failure raised by a single stage.
///
/// Stages may carry their own HTTP status and code (e.g. 415 for a bad
/// content type); the pipeline falls back to the stage kind's defaults.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
    pub status: Option<StatusCode>,
    pub code: Option<&'static str>,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(message)
            .with_status(StatusCode::UNAUTHORIZED)
            .with_code("UNAUTHORIZED")
    }
}

impl From<InvalidHeader> for StageError {
    fn from(e: InvalidHeader) -> Self {
        Self::new(e.to_string())
    }
}

/// Why the request pipeline stopped.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("filtered by {stage}")]
    Filtered { stage: String },

    #[error("filter {stage} failed: {source}")]
    FilterFailed { stage: String, source: StageError },

    #[error("validation failed at {stage}: {source}")]
    Validation { stage: String, source: StageError },

    #[error("rate limit exceeded")]
    RateLimited(RateLimitDecision),

    #[error("transformation failed at {stage}: {source}")]
    Transformation { stage: String, source: StageError },

    #[error("enrichment failed at {stage}: {source}")]
    Enrichment { stage: String, source: StageError },
}

impl PipelineError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Filtered { .. } => StatusCode::FORBIDDEN,
            Self::FilterFailed { source, .. } => source.status.unwrap_or(StatusCode::FORBIDDEN),
            Self::Validation { source, .. } => source.status.unwrap_or(StatusCode::BAD_REQUEST),
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Transformation { source, .. } | Self::Enrichment { source, .. } => {
                source.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Stable machine-readable code for error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Filtered { .. } => "REQUEST_FILTERED",
            Self::FilterFailed { source, .. } => source.code.unwrap_or("FILTER_ERROR"),
            Self::Validation { source, .. } => source.code.unwrap_or("VALIDATION_FAILED"),
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::Transformation { source, .. } => source.code.unwrap_or("TRANSFORMATION_FAILED"),
            Self::Enrichment { source, .. } => source.code.unwrap_or("ENRICHMENT_FAILED"),
        }
    }

    /// Name of the stage that stopped the request, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Filtered { stage }
            | Self::FilterFailed { stage, .. }
            | Self::Validation { stage, .. }
            | Self::Transformation { stage, .. }
            | Self::Enrichment { stage, .. } => Some(stage),
            Self::RateLimited(_) => None,
        }
    }

    pub fn rate_limit(&self) -> Option<&RateLimitDecision> {
        match self {
            Self::RateLimited(decision) => Some(decision),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_and_defaults() {
        let err = PipelineError::Filtered {
            stage: "ip_deny_list".into(),
        };
        assert_eq!(err.to_string(), "filtered by ip_deny_list");
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.code(), "REQUEST_FILTERED");

        let err = PipelineError::Validation {
            stage: "required_headers".into(),
            source: StageError::new("missing headers: x-tenant-id"),
        };
        assert_eq!(
            err.to_string(),
            "validation failed at required_headers: missing headers: x-tenant-id"
        );
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "VALIDATION_FAILED");
        assert_eq!(err.stage(), Some("required_headers"));
    }

    #[test]
    fn test_stage_status_overrides_default() {
        let err = PipelineError::Validation {
            stage: "require_auth".into(),
            source: StageError::unauthorized("credentials required"),
        };
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(err.code(), "UNAUTHORIZED");

        let err = PipelineError::FilterFailed {
            stage: "geo".into(),
            source: StageError::new("lookup unavailable"),
        };
        assert_eq!(err.to_string(), "filter geo failed: lookup unavailable");
        assert_eq!(err.code(), "FILTER_ERROR");
    }
}
