//! Integration Tests - End-to-end Price Pipeline Testing
//!
//! Tests the interaction between usecases, ports, and mock adapters.
//! Uses mockall for trait mocking and tokio::test for async tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use chrono::Utc;
use futures_util::StreamExt;
use http_body_util::BodyExt;
use mockall::mock;
use tower::ServiceExt;

use ka_price_feed::adapters::http::{router, AppState};
use ka_price_feed::adapters::metrics::MetricsRegistry;
use ka_price_feed::domain::{LastValidPrice, PriceSource, PriceValidator, Quote, ValidationRules};
use ka_price_feed::error::PriceFeedError;
use ka_price_feed::usecases::{Broadcaster, BroadcasterSettings, PriceCache, PriceService};

// ---- Mock Definitions ----

mock! {
    pub Market {}

    #[async_trait::async_trait]
    impl ka_price_feed::ports::MarketData for Market {
        async fn fetch_quote(&self) -> Result<Quote, PriceFeedError>;
    }
}

mock! {
    pub Store {}

    #[async_trait::async_trait]
    impl ka_price_feed::ports::PriceStore for Store {
        async fn load(&self) -> anyhow::Result<Option<LastValidPrice>>;
        async fn save(&self, last: &LastValidPrice) -> anyhow::Result<()>;
    }
}

// ---- Helpers ----

fn quote(pair_rate: f64, reference_rate: f64) -> Quote {
    Quote {
        pair_rate,
        reference_rate,
        as_of: Utc::now(),
        volume_24h: Some(12_500.0),
        change_24h: Some(-1.5),
    }
}

fn market_returning(pair_rate: f64, reference_rate: f64) -> MockMarket {
    let mut market = MockMarket::new();
    market
        .expect_fetch_quote()
        .returning(move || Ok(quote(pair_rate, reference_rate)));
    market
}

fn validator_with_last(price: Option<f64>) -> Arc<PriceValidator> {
    let validator = PriceValidator::new(ValidationRules::default());
    if let Some(price) = price {
        validator.restore(LastValidPrice {
            price,
            at: Utc::now(),
        });
    }
    Arc::new(validator)
}

fn build_service(
    market: MockMarket,
    validator: Arc<PriceValidator>,
    cache_ttl: Duration,
    metrics: &Arc<MetricsRegistry>,
) -> PriceService {
    PriceService::new(
        Arc::new(market),
        validator,
        Arc::new(PriceCache::new(cache_ttl)),
        Arc::clone(metrics),
    )
}

fn stream_settings(max_connections: usize) -> BroadcasterSettings {
    BroadcasterSettings {
        tick_interval: Duration::from_secs(10),
        max_connections,
        connection_timeout: Duration::from_secs(300),
        push_timeout: Duration::from_millis(200),
        retry_after_secs: 60,
        buffer_size: 4,
    }
}

fn app_state(market: MockMarket, max_connections: usize) -> AppState {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let service = Arc::new(build_service(
        market,
        validator_with_last(Some(0.0039)),
        Duration::from_secs(20),
        &metrics,
    ));
    let broadcaster = Broadcaster::new(
        Arc::clone(&service),
        Arc::clone(&metrics),
        stream_settings(max_connections),
    );
    AppState::new(service, broadcaster, metrics, Duration::from_secs(20))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn get_from(uri: &str, origin: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::ORIGIN, origin)
        .body(Body::empty())
        .unwrap()
}

// ---- Price Service Chain ----

#[tokio::test]
async fn test_accepted_price_is_live_and_persisted() {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let mut store = MockStore::new();
    store
        .expect_save()
        .withf(|last| (last.price - 0.004).abs() < 1e-12)
        .times(1)
        .returning(|_| Ok(()));

    let service = build_service(
        market_returning(0.002, 2.0),
        validator_with_last(Some(0.0039)),
        Duration::from_secs(20),
        &metrics,
    )
    .with_store(Arc::new(store));

    let reading = service.current_price().await;
    assert!((reading.price - 0.004).abs() < 1e-12);
    assert_eq!(reading.source, PriceSource::Live);
    assert_eq!(
        service.validator().state().last_valid_price(),
        Some(reading.price)
    );
}

#[tokio::test]
async fn test_spike_serves_last_good_price_without_persisting() {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let mut store = MockStore::new();
    store.expect_save().times(0);

    let service = build_service(
        market_returning(0.01, 1.0),
        validator_with_last(Some(0.001)),
        Duration::from_secs(20),
        &metrics,
    )
    .with_store(Arc::new(store));

    let reading = service.current_price().await;
    assert_eq!(reading.price, 0.001);
    assert_eq!(reading.source, PriceSource::Fallback);
    assert_eq!(service.validator().state().last_valid_price(), Some(0.001));

    let text = metrics.encode().unwrap();
    assert!(text.contains("reason=\"excessive_change\""));
}

#[tokio::test]
async fn test_unreachable_upstream_without_history_serves_constant() {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let mut market = MockMarket::new();
    market
        .expect_fetch_quote()
        .returning(|| Err(PriceFeedError::UpstreamUnavailable("connection refused".into())));

    let service = build_service(
        market,
        validator_with_last(None),
        Duration::from_secs(20),
        &metrics,
    );

    let reading = service.current_price().await;
    assert_eq!(reading.price, 0.000_996);
    assert_eq!(reading.source, PriceSource::Fallback);
    assert!(service.cache().is_empty());
}

#[tokio::test]
async fn test_malformed_upstream_serves_last_good_price() {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let mut market = MockMarket::new();
    market.expect_fetch_quote().returning(|| {
        Err(PriceFeedError::MalformedUpstreamResponse(
            "missing lastPriceMonUSD".into(),
        ))
    });

    let service = build_service(
        market,
        validator_with_last(Some(0.0042)),
        Duration::from_secs(20),
        &metrics,
    );

    let reading = service.current_price().await;
    assert_eq!(reading.price, 0.0042);
    assert_eq!(reading.source, PriceSource::Fallback);
}

#[tokio::test]
async fn test_store_failure_does_not_affect_reading() {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let mut store = MockStore::new();
    store
        .expect_save()
        .returning(|_| Err(anyhow::anyhow!("disk full")));

    let service = build_service(
        market_returning(0.004, 1.0),
        validator_with_last(None),
        Duration::from_secs(20),
        &metrics,
    )
    .with_store(Arc::new(store));

    let reading = service.current_price().await;
    assert_eq!(reading.price, 0.004);
    assert_eq!(reading.source, PriceSource::Live);
}

#[tokio::test]
async fn test_restore_seeds_validator_from_store() {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let mut store = MockStore::new();
    store.expect_load().times(1).returning(|| {
        Ok(Some(LastValidPrice {
            price: 0.001,
            at: Utc::now(),
        }))
    });

    let service = build_service(
        market_returning(0.01, 1.0),
        validator_with_last(None),
        Duration::from_secs(20),
        &metrics,
    )
    .with_store(Arc::new(store));

    assert!(service.restore().await.unwrap());

    // The restored price drives the spike check.
    let reading = service.current_price().await;
    assert_eq!(reading.price, 0.001);
    assert_eq!(reading.source, PriceSource::Fallback);
}

#[tokio::test]
async fn test_restore_ignores_out_of_band_record() {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let mut store = MockStore::new();
    store.expect_load().times(1).returning(|| {
        Ok(Some(LastValidPrice {
            price: -5.0,
            at: Utc::now(),
        }))
    });

    let mut market = MockMarket::new();
    market
        .expect_fetch_quote()
        .returning(|| Err(PriceFeedError::UpstreamUnavailable("down".into())));

    let service = build_service(
        market,
        validator_with_last(None),
        Duration::from_secs(20),
        &metrics,
    )
    .with_store(Arc::new(store));

    assert!(!service.restore().await.unwrap());
    assert_eq!(service.validator().state().last_valid(), None);

    let reading = service.current_price().await;
    assert_eq!(reading.price, 0.000_996);
    assert_eq!(reading.source, PriceSource::Fallback);
}

#[tokio::test]
async fn test_restore_without_store_is_cold_start() {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let service = build_service(
        MockMarket::new(),
        validator_with_last(None),
        Duration::from_secs(20),
        &metrics,
    );
    assert!(!service.restore().await.unwrap());
}

// ---- Broadcaster ----

#[tokio::test]
async fn test_admission_frees_slot_after_disconnect() {
    let state = app_state(market_returning(0.004, 1.0), 3);
    let b = &state.broadcaster;

    let first = b.open().await.unwrap();
    let _second = b.open().await.unwrap();
    let _third = b.open().await.unwrap();
    assert!(b.open().await.is_err());

    drop(first);
    assert_eq!(b.stats().connections, 2);
    assert!(b.open().await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_ticker_fetches_once_per_tick_and_stops_when_idle() {
    let metrics = Arc::new(MetricsRegistry::new().unwrap());
    let fetches = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fetches);

    let mut market = MockMarket::new();
    market.expect_fetch_quote().returning(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(quote(0.004, 1.0))
    });

    // A TTL shorter than the tick forces one upstream call per tick.
    let service = Arc::new(build_service(
        market,
        validator_with_last(None),
        Duration::from_secs(1),
        &metrics,
    ));
    let broadcaster = Broadcaster::new(service, Arc::clone(&metrics), stream_settings(5));

    let mut a = broadcaster.open().await.unwrap();
    let mut b = broadcaster.open().await.unwrap();
    assert_eq!(fetches.load(Ordering::SeqCst), 1, "second connect hits cache");

    for sub in [&mut a, &mut b] {
        sub.next().await.unwrap();
    }
    for sub in [&mut a, &mut b] {
        let reading = sub.next().await.unwrap();
        assert_eq!(reading.price, 0.004);
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 2, "one fetch per tick");

    drop(a);
    drop(b);
    let stats = broadcaster.stats();
    assert!(!stats.ticker_running);
    assert_eq!(stats.ticker_starts, 1);
    assert_eq!(stats.ticker_stops, 1);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 2, "no fetches while idle");
}

// ---- HTTP Router ----

#[tokio::test]
async fn test_get_price_returns_reading_with_headers() {
    let state = app_state(market_returning(0.002, 2.0), 5);
    let response = router(state).oneshot(get("/price")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers[header::CACHE_CONTROL],
        "public, max-age=20, must-revalidate"
    );
    assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
    assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert!((json["price"].as_f64().unwrap() - 0.004).abs() < 1e-12);
    assert_eq!(json["source"], "live");
    assert!(json["timestamp"].is_i64());
}

#[tokio::test]
async fn test_get_price_is_ok_on_fallback() {
    let mut market = MockMarket::new();
    market
        .expect_fetch_quote()
        .returning(|| Err(PriceFeedError::UpstreamUnavailable("timeout".into())));
    let state = app_state(market, 5);

    let response = router(state).oneshot(get("/price")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["source"], "fallback");
    assert_eq!(json["price"], 0.0039);
}

#[tokio::test]
async fn test_wrong_method_is_405() {
    let state = app_state(MockMarket::new(), 5);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/price")
        .body(Body::empty())
        .unwrap();

    let response = router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_stream_sends_initial_event_and_releases_slot() {
    let state = app_state(market_returning(0.004, 1.0), 5);
    let broadcaster = Arc::clone(&state.broadcaster);

    let response = router(state).oneshot(get("/price/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");
    assert_eq!(broadcaster.stats().connections, 1);

    let mut body = response.into_body();
    let frame = body.frame().await.unwrap().unwrap();
    let data = frame.into_data().unwrap();
    let text = std::str::from_utf8(&data).unwrap();
    assert!(text.starts_with("data: {"), "unexpected frame: {text}");
    assert!(text.contains("\"source\":\"live\""));
    assert!(text.ends_with("\n\n"));

    drop(body);
    assert_eq!(broadcaster.stats().connections, 0);
}

#[tokio::test]
async fn test_stream_over_ceiling_is_429() {
    let state = app_state(market_returning(0.004, 1.0), 1);
    let _held = state.broadcaster.open().await.unwrap();

    let response = router(state).oneshot(get("/price/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "60");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["success"], false);
    assert_eq!(json["maxConnections"], 1);
}

#[tokio::test]
async fn test_cors_preflight_on_price() {
    let state = app_state(MockMarket::new(), 5);
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/price")
        .header(header::ORIGIN, "https://app.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
        .body(Body::empty())
        .unwrap();

    let response = router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "3600");
    let methods = headers[header::ACCESS_CONTROL_ALLOW_METHODS].to_str().unwrap();
    assert!(methods.contains("GET"));
    assert!(methods.contains("OPTIONS"));
}

#[tokio::test]
async fn test_cors_origin_on_price_and_stream() {
    let state = app_state(market_returning(0.004, 1.0), 5);
    let app = router(state);

    let response = app
        .clone()
        .oneshot(get_from("/price", "https://app.example.com"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

    let response = app
        .oneshot(get_from("/price/stream", "https://app.example.com"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

#[tokio::test]
async fn test_cors_restricted_to_configured_origins() {
    let state = app_state(market_returning(0.004, 1.0), 5)
        .with_allowed_origins(vec!["https://app.example.com".to_string()]);
    let app = router(state);

    let allowed = app
        .clone()
        .oneshot(get_from("/price", "https://app.example.com"))
        .await
        .unwrap();
    assert_eq!(
        allowed.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://app.example.com"
    );

    let foreign = app
        .oneshot(get_from("/price", "https://evil.example.net"))
        .await
        .unwrap();
    assert_eq!(foreign.status(), StatusCode::OK);
    assert!(foreign
        .headers()
        .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        .is_none());
}
