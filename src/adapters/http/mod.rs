//! HTTP Adapter - Public Price API
//!
//! Two routes over axum 0.7:
//! - `GET /price`: one reading from the cache → market → validator chain
//! - `GET /price/stream`: SSE stream fed by the broadcaster
//!
//! Other methods on these paths get axum's standard 405, except the CORS
//! preflight (`OPTIONS`), answered by the CORS layer.

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::adapters::metrics::MetricsRegistry;
use crate::usecases::{Broadcaster, PriceService};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PriceService>,
    pub broadcaster: Arc<Broadcaster>,
    pub metrics: Arc<MetricsRegistry>,
    /// Advertised in `Cache-Control: max-age` on `/price`.
    pub cache_ttl: Duration,
    /// SSE keep-alive comment period.
    pub keep_alive: Duration,
    /// Browser origins allowed by CORS; `*` allows any.
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(
        service: Arc<PriceService>,
        broadcaster: Arc<Broadcaster>,
        metrics: Arc<MetricsRegistry>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            service,
            broadcaster,
            metrics,
            cache_ttl,
            keep_alive: Duration::from_secs(15),
            allowed_origins: vec!["*".to_string()],
        }
    }

    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = origins;
        self
    }
}

/// Build the public API router.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.allowed_origins);

    Router::new()
        .route("/price", get(handlers::get_price))
        .route("/price/stream", get(handlers::stream_price))
        .layer(cors)
        .with_state(state)
}

/// Read-only CORS policy: GET plus preflight, cached for an hour.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    if origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let list: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    layer.allow_origin(AllowOrigin::list(list))
}
