//! Price API handlers.

use axum::extract::State;
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::StreamExt;
use tracing::debug;

use super::AppState;
use crate::error::PriceFeedError;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Headers carried by every price response.
fn security_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
}

/// `GET /price`: always 200, even when serving a fallback.
pub async fn get_price(State(state): State<AppState>) -> Response {
    let reading = state.service.current_price().await;
    state.metrics.record_served("pull", &reading, 1);
    debug!(price = reading.price, source = %reading.source, "Price served");

    let mut response = Json(reading).into_response();
    let headers = response.headers_mut();
    let cache_control = format!(
        "public, max-age={}, must-revalidate",
        state.cache_ttl.as_secs()
    );
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        headers.insert(header::CACHE_CONTROL, value);
    }
    security_headers(headers);
    response
}

/// `GET /price/stream`: SSE stream, or 429 when the ceiling is reached.
pub async fn stream_price(State(state): State<AppState>) -> Result<Response, PriceFeedError> {
    let subscription = state.broadcaster.open().await?;

    let events = subscription.map(|reading| Event::default().json_data(reading));
    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::new().interval(state.keep_alive))
        .into_response();

    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    security_headers(headers);
    Ok(response)
}
