//! Built-in response filters.

use std::sync::Arc;

use axum::http::StatusCode;
use futures_util::future::{ready, Ready};

use crate::http::message::GatewayResponse;
use crate::pipeline::error::StageError;
use crate::pipeline::response::ResponseContext;

/// Statuses that never carry a body. Body stages leave them alone; header stages still run.
pub fn is_bodyless(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::SWITCHING_PROTOCOLS | StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED
    )
}

/// Hand protocol upgrades back untouched; the connection stops being HTTP after them.
pub fn skip_upgrades(
) -> impl Fn(GatewayResponse, Arc<ResponseContext>) -> Ready<Result<bool, StageError>> + Send + Sync {
    |response, _ctx| ready(Ok(response.status() != StatusCode::SWITCHING_PROTOCOLS))
}
