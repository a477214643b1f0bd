//! Price Service - Cache → Market → Validator Chain
//!
//! The single path every consumer uses to obtain a price, whether a
//! pull request or a broadcaster tick:
//! 1. Serve from the cache when fresh
//! 2. Otherwise take the fetch lock and re-check the cache
//! 3. Fetch a quote (bounded by a timeout), derive and validate the price
//! 4. Cache the validated reading and persist accepted prices
//!
//! Any upstream failure resolves to the validator fallback, so a caller
//! always gets a usable reading.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::adapters::metrics::{HealthState, MetricsRegistry};
use crate::domain::price::{PriceReading, PriceSource};
use crate::domain::validator::{LastValidPrice, PriceValidator};
use crate::error::PriceFeedError;
use crate::ports::market_data::MarketData;
use crate::ports::price_store::PriceStore;
use crate::usecases::price_cache::PriceCache;

/// Cache key of the single tracked price.
pub const PRICE_CACHE_KEY: &str = "ka-price";

/// Orchestrates the market adapter, validator, cache and store.
pub struct PriceService {
    market: Arc<dyn MarketData>,
    validator: Arc<PriceValidator>,
    cache: Arc<PriceCache>,
    store: Option<Arc<dyn PriceStore>>,
    metrics: Arc<MetricsRegistry>,
    health: Arc<HealthState>,
    /// Backstop around the adapter's own timeout.
    upstream_timeout: Duration,
    /// Serializes upstream fetches after a cache miss.
    fetch_lock: Mutex<()>,
}

impl PriceService {
    pub fn new(
        market: Arc<dyn MarketData>,
        validator: Arc<PriceValidator>,
        cache: Arc<PriceCache>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            market,
            validator,
            cache,
            store: None,
            metrics,
            health: Arc::new(HealthState::new()),
            upstream_timeout: Duration::from_secs(10),
            fetch_lock: Mutex::new(()),
        }
    }

    /// Mirror accepted prices to `store`.
    pub fn with_store(mut self, store: Arc<dyn PriceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Report upstream health to the ops server.
    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = health;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn validator(&self) -> &PriceValidator {
        &self.validator
    }

    pub fn cache(&self) -> &PriceCache {
        &self.cache
    }

    /// Seed the validator from the durable store.
    ///
    /// Returns whether a price was restored. A store error is returned
    /// to the caller, which may choose to start cold.
    pub async fn restore(&self) -> anyhow::Result<bool> {
        let Some(store) = &self.store else {
            return Ok(false);
        };

        match store.load().await? {
            Some(last) if self.validator.restore(last) => {
                info!(price = last.price, at = %last.at, "Validator seeded from store");
                Ok(true)
            }
            Some(_) => {
                warn!("Stored price rejected, validator starts cold");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Current price. Never fails.
    #[instrument(skip(self))]
    pub async fn current_price(&self) -> PriceReading {
        if let Some(reading) = self.cached() {
            return reading;
        }

        let _guard = self.fetch_lock.lock().await;

        // Another caller may have filled the cache while we waited.
        if let Some(reading) = self.cached() {
            debug!("Cache filled while waiting for fetch lock");
            return reading;
        }

        match self.fetch_validated().await {
            Ok(reading) => {
                self.cache.insert(PRICE_CACHE_KEY, reading);
                reading
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "Price fetch failed, serving fallback");
                self.validator.fallback()
            }
        }
    }

    /// Cache hit, re-tagged `Cached` unless it already is a substitute.
    fn cached(&self) -> Option<PriceReading> {
        self.cache.get(PRICE_CACHE_KEY).map(|reading| match reading.source {
            PriceSource::Live => reading.with_source(PriceSource::Cached),
            _ => reading,
        })
    }

    /// Fetch one quote and run it through the validator.
    ///
    /// Errors are upstream failures only; a rejected price is still a
    /// reading (the validator's substitute).
    async fn fetch_validated(&self) -> Result<PriceReading, PriceFeedError> {
        let started = Instant::now();
        let fetch = tokio::time::timeout(self.upstream_timeout, self.market.fetch_quote());
        let result = match fetch.await {
            Ok(result) => result,
            Err(_) => Err(PriceFeedError::UpstreamUnavailable(format!(
                "no response within {}ms",
                self.upstream_timeout.as_millis()
            ))),
        };

        self.metrics
            .upstream_latency
            .observe(started.elapsed().as_secs_f64());
        self.health.set_upstream_healthy(result.is_ok());

        let quote = result.inspect_err(|e| self.record_fetch(e.kind()))?;
        let candidate = quote.derive_price();
        let validation = self.validator.validate(candidate);

        match validation.rejection {
            Some(rejection) => {
                let rejected = PriceFeedError::PriceRejected(rejection);
                debug!(error = %rejected, "Serving substitute for rejected price");
                self.record_fetch(rejected.kind());
                self.metrics
                    .price_rejections
                    .with_label_values(&[rejection.reason()])
                    .inc();
            }
            None => {
                self.record_fetch("ok");
                self.persist(&validation.reading).await;
            }
        }

        Ok(validation.reading)
    }

    /// Count one upstream fetch by outcome: `ok`, a rejected price, or a
    /// failure kind.
    fn record_fetch(&self, outcome: &str) {
        self.metrics
            .upstream_fetches
            .with_label_values(&[outcome])
            .inc();
    }

    async fn persist(&self, reading: &PriceReading) {
        let Some(store) = &self.store else {
            return;
        };

        let last = LastValidPrice {
            price: reading.price,
            at: reading.observed_at,
        };
        if let Err(e) = store.save(&last).await {
            warn!(error = %e, "Failed to persist last valid price");
        }
    }
}
