//! KA Price Feed - Entry Point
//!
//! Initializes configuration, logging, the upstream market client and
//! the price pipeline, then serves the public price API and the ops
//! server. Runs until SIGINT.
//!
//! Wiring sequence:
//! 1. Load .env, config.toml + environment overrides, validate
//! 2. Init tracing (JSON structured logging)
//! 3. Create metrics registry and health state
//! 4. Create KuruMarketClient (reqwest + timeout + local quota)
//! 5. Create validator, cache, durable store; seed validator from disk
//! 6. Create PriceService and Broadcaster
//! 7. Spawn ops server (/live + /ready + /metrics)
//! 8. Serve /price + /price/stream
//! 9. Wait for SIGINT → graceful shutdown (refuse→close streams→exit)

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use ka_price_feed::adapters::http::{self, AppState};
use ka_price_feed::adapters::market::{KuruClientConfig, KuruMarketClient};
use ka_price_feed::adapters::metrics::{HealthServer, HealthState, MetricsRegistry};
use ka_price_feed::adapters::persistence::JsonPriceStore;
use ka_price_feed::config;
use ka_price_feed::domain::PriceValidator;
use ka_price_feed::usecases::{Broadcaster, BroadcasterSettings, PriceCache, PriceService};

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Load configuration ───────────────────────────────
    let _ = dotenvy::dotenv();
    let config = config::loader::load_config("config.toml")
        .context("Failed to load configuration")?;

    // ── 2. Initialize structured JSON logging ───────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new(&config.server.log_level)
                }),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        upstream = %config.upstream.base_url,
        max_connections = config.stream.max_connections,
        "Starting KA price feed"
    );

    // ── 3. Shutdown channel, metrics, health ────────────────
    let (shutdown_tx, _shutdown_rx) = broadcast::channel::<()>(1);
    let metrics = Arc::new(MetricsRegistry::new().context("Failed to register metrics")?);
    let health = Arc::new(HealthState::new());

    // ── 4. Create upstream market client ────────────────────
    let market = Arc::new(
        KuruMarketClient::new(KuruClientConfig::from(&config.upstream))
            .context("Failed to create market client")?,
    );
    info!(url = market.market_url(), "Market client ready");

    // ── 5. Validator, cache, durable store ──────────────────
    let validator = Arc::new(PriceValidator::new(config.validation.rules()));
    let cache = Arc::new(PriceCache::new(config.cache.price_ttl()));

    let mut service = PriceService::new(
        market,
        validator,
        Arc::clone(&cache),
        Arc::clone(&metrics),
    )
    .with_health(Arc::clone(&health))
    .with_upstream_timeout(config.upstream.timeout());

    if config.persistence.enabled {
        let store = JsonPriceStore::new(&config.persistence.data_dir)
            .await
            .context("Failed to open price store")?;
        service = service.with_store(Arc::new(store));
    }

    // ── 6. Price service and broadcaster ────────────────────
    let service = Arc::new(service);
    match service.restore().await {
        Ok(true) => {}
        Ok(false) => info!("No stored price, validator starts cold"),
        Err(e) => warn!(error = %e, "Failed to restore last valid price, starting cold"),
    }

    let broadcaster = Broadcaster::new(
        Arc::clone(&service),
        Arc::clone(&metrics),
        BroadcasterSettings::from(&config.stream),
    );

    // ── 7. Spawn ops server ─────────────────────────────────
    let ops_server = HealthServer::new(
        Arc::clone(&health),
        Arc::clone(&metrics),
        config.server.ops_bind_address.clone(),
    );
    let ops_shutdown = shutdown_tx.subscribe();
    let ops_handle = tokio::spawn(async move {
        if let Err(e) = ops_server.run(ops_shutdown).await {
            error!(error = %e, "Ops server failed");
        }
    });

    // ── 8. Serve the price API ──────────────────────────────
    let app = http::router(AppState::new(
        Arc::clone(&service),
        Arc::clone(&broadcaster),
        Arc::clone(&metrics),
        config.cache.price_ttl(),
    )
    .with_allowed_origins(config.server.allowed_origins.clone()));
    let listener = tokio::net::TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind_address))?;
    info!(address = %config.server.bind_address, "Price API listening");

    let mut api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.recv().await;
            })
            .await;
        if let Err(e) = served {
            error!(error = %e, "Price API server failed");
        }
    });

    info!("All tasks spawned - price feed is running");

    // ── 9. Wait for SIGINT ──────────────────────────────────
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for SIGINT");
    }
    info!("SIGINT received, initiating graceful shutdown");

    // 1. Readiness probe → 503
    health.begin_shutdown();

    // 2. Close every stream so the API server can drain
    broadcaster.shutdown();

    // 3. Signal servers to stop
    let _ = shutdown_tx.send(());

    // 4. Wait for servers (up to 10s)
    let _ = tokio::time::timeout(Duration::from_secs(10), api_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), ops_handle).await;

    info!(cached_keys = cache.len(), "Shutdown complete");
    Ok(())
}
