//! Error Taxonomy - Price Pipeline Failures
//!
//! Every failure the price pipeline can observe. Only
//! `ConnectionLimitExceeded` ever reaches a client; the rest are
//! recovered locally through the validator fallback.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::domain::validator::Rejection;

/// Errors produced by the price feed components.
#[derive(Debug, Clone, Error)]
pub enum PriceFeedError {
    /// Network failure, timeout, non-2xx status, or local quota exhausted.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream answered but the body could not be turned into a quote.
    #[error("malformed upstream response: {0}")]
    MalformedUpstreamResponse(String),

    /// The derived price failed the range or spike checks.
    #[error("price rejected: {0}")]
    PriceRejected(Rejection),

    /// Stream admission refused; the client should retry later.
    #[error("connection limit exceeded ({max} active connections)")]
    ConnectionLimitExceeded {
        /// Configured ceiling.
        max: usize,
        /// Value for the `Retry-After` header.
        retry_after_secs: u64,
    },
}

impl PriceFeedError {
    /// Short label for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::MalformedUpstreamResponse(_) => "malformed_response",
            Self::PriceRejected(_) => "price_rejected",
            Self::ConnectionLimitExceeded { .. } => "connection_limit",
        }
    }
}

impl IntoResponse for PriceFeedError {
    fn into_response(self) -> Response {
        match self {
            Self::ConnectionLimitExceeded {
                max,
                retry_after_secs,
            } => {
                let body = Json(json!({
                    "success": false,
                    "error": "Connection limit exceeded",
                    "message": "Too many active connections. Please try again later.",
                    "maxConnections": max,
                }));
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after_secs.to_string())],
                    body,
                )
                    .into_response()
            }
            // The price path always yields a reading, so these never leave
            // a handler. Map them anyway so the type is a complete response.
            other => {
                let body = Json(json!({
                    "success": false,
                    "error": other.kind(),
                    "message": other.to_string(),
                }));
                (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
            }
        }
    }
}
