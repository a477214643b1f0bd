//! Prometheus Metrics Registry - Price Feed Observability
//!
//! Registers the price pipeline metrics and renders them in the text
//! exposition format for the ops server's `/metrics` route.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

use crate::domain::price::PriceReading;

/// Centralized Prometheus metrics for the price feed.
///
/// All metrics follow the naming convention `ka_price_feed_*`.
pub struct MetricsRegistry {
    /// Prometheus registry.
    registry: Registry,
    /// Upstream fetch attempts by outcome.
    pub upstream_fetches: IntCounterVec,
    /// Upstream fetch latency (seconds).
    pub upstream_latency: Histogram,
    /// Validator rejections by reason.
    pub price_rejections: IntCounterVec,
    /// Readings handed out, by delivery path and source.
    pub readings_served: IntCounterVec,
    /// Last price handed out.
    pub last_price: Gauge,
    /// Currently open SSE streams.
    pub active_connections: IntGauge,
    /// Streams refused at admission.
    pub stream_rejections: IntCounter,
    /// Broadcaster ticks executed.
    pub ticks: IntCounter,
}

impl MetricsRegistry {
    /// Create and register all Prometheus metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let upstream_fetches = IntCounterVec::new(
            Opts::new(
                "ka_price_feed_upstream_fetches_total",
                "Upstream market fetch attempts",
            ),
            &["outcome"],
        )?;

        let upstream_latency = Histogram::with_opts(
            HistogramOpts::new(
                "ka_price_feed_upstream_latency_seconds",
                "Upstream market fetch latency in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;

        let price_rejections = IntCounterVec::new(
            Opts::new(
                "ka_price_feed_price_rejections_total",
                "Candidate prices rejected by the validator",
            ),
            &["reason"],
        )?;

        let readings_served = IntCounterVec::new(
            Opts::new(
                "ka_price_feed_readings_served_total",
                "Price readings handed to consumers",
            ),
            &["path", "source"],
        )?;

        let last_price = Gauge::new(
            "ka_price_feed_last_price_usd",
            "Most recent price handed to consumers",
        )?;

        let active_connections = IntGauge::new(
            "ka_price_feed_stream_connections",
            "Open SSE price streams",
        )?;

        let stream_rejections = IntCounter::new(
            "ka_price_feed_stream_rejections_total",
            "SSE streams refused by admission control",
        )?;

        let ticks = IntCounter::new(
            "ka_price_feed_ticks_total",
            "Broadcaster ticks executed",
        )?;

        // Register all metrics
        registry.register(Box::new(upstream_fetches.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(price_rejections.clone()))?;
        registry.register(Box::new(readings_served.clone()))?;
        registry.register(Box::new(last_price.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(stream_rejections.clone()))?;
        registry.register(Box::new(ticks.clone()))?;

        Ok(Self {
            registry,
            upstream_fetches,
            upstream_latency,
            price_rejections,
            readings_served,
            last_price,
            active_connections,
            stream_rejections,
            ticks,
        })
    }

    /// Count `count` deliveries of `reading` on `path` ("pull" or "stream").
    pub fn record_served(&self, path: &str, reading: &PriceReading, count: u64) {
        self.readings_served
            .with_label_values(&[path, reading.source.as_str()])
            .inc_by(count);
        self.last_price.set(reading.price);
    }

    /// Render all metrics in the Prometheus text format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
