//! Kuru Market Client - KA/MON Quote Adapter
//!
//! Wraps reqwest with a bounded timeout and a local request quota
//! for the Kuru market REST API, and normalizes its market payload
//! into a domain `Quote`.
//!
//! One attempt per call, no retries: the price service decides what
//! happens on failure (it falls back through the validator).

use std::num::NonZeroU32;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::config::UpstreamConfig;
use crate::domain::price::Quote;
use crate::error::PriceFeedError;
use crate::ports::market_data::MarketData;

const MARKET_BY_ADDRESS_PATH: &str = "/api/v2/markets/address";

/// Configuration for the Kuru client.
#[derive(Debug, Clone)]
pub struct KuruClientConfig {
  /// Base URL for the Kuru API.
  pub base_url: String,
  /// Market contract address of the KA/MON pair.
  pub market_address: String,
  /// Request timeout.
  pub timeout: Duration,
  /// Local quota on outgoing requests.
  pub max_requests_per_minute: u32,
}

impl Default for KuruClientConfig {
  fn default() -> Self {
    Self::from(&UpstreamConfig::default())
  }
}

impl From<&UpstreamConfig> for KuruClientConfig {
  fn from(config: &UpstreamConfig) -> Self {
    Self {
      base_url: config.base_url.clone(),
      market_address: config.market_address.clone(),
      timeout: config.timeout(),
      max_requests_per_minute: config.max_requests_per_minute,
    }
  }
}

/// Kuru response envelope: `{ success, data: { data: { .. } } }`.
#[derive(Debug, Deserialize)]
struct MarketEnvelope {
  #[serde(default)]
  success: bool,
  data: Option<MarketEnvelopeData>,
}

#[derive(Debug, Deserialize)]
struct MarketEnvelopeData {
  data: Option<MarketPayload>,
}

/// Market fields used by the price pipeline.
#[derive(Debug, Deserialize)]
struct MarketPayload {
  /// KA priced in MON.
  #[serde(rename = "lastPrice")]
  last_price: Option<f64>,
  /// MON priced in USD.
  #[serde(rename = "lastPriceMonUSD")]
  last_price_mon_usd: Option<f64>,
  #[serde(rename = "lastTradeTime")]
  last_trade_time: Option<String>,
  #[serde(rename = "volume24h")]
  volume_24h: Option<f64>,
  #[serde(rename = "priceChange24h")]
  price_change_24h: Option<f64>,
}

/// HTTP adapter for the Kuru market API.
pub struct KuruMarketClient {
  /// Underlying HTTP client (timeout baked in).
  http: Client,
  /// Fully built market URL.
  market_url: String,
  /// Local request quota.
  limiter: DefaultDirectRateLimiter,
}

impl KuruMarketClient {
  /// Create a new Kuru client.
  pub fn new(config: KuruClientConfig) -> Result<Self> {
    let http = Client::builder()
      .timeout(config.timeout)
      .pool_max_idle_per_host(2)
      .build()
      .context("Failed to build HTTP client")?;

    let per_minute =
      NonZeroU32::new(config.max_requests_per_minute).unwrap_or(NonZeroU32::MIN);
    let limiter = RateLimiter::direct(Quota::per_minute(per_minute));

    let market_url = format!(
      "{}{}/{}",
      config.base_url.trim_end_matches('/'),
      MARKET_BY_ADDRESS_PATH,
      config.market_address
    );

    Ok(Self {
      http,
      market_url,
      limiter,
    })
  }

  pub fn market_url(&self) -> &str {
    &self.market_url
  }
}

#[async_trait]
impl MarketData for KuruMarketClient {
  #[instrument(skip(self), fields(url = %self.market_url))]
  async fn fetch_quote(&self) -> Result<Quote, PriceFeedError> {
    if self.limiter.check().is_err() {
      warn!("Local Kuru request quota exhausted, skipping upstream call");
      return Err(PriceFeedError::UpstreamUnavailable(
        "local request quota exhausted".to_string(),
      ));
    }

    let response = self
      .http
      .get(&self.market_url)
      .header(ACCEPT, "application/json")
      .send()
      .await
      .map_err(|e| {
        let msg = if e.is_timeout() {
          "request timed out".to_string()
        } else {
          format!("request failed: {e}")
        };
        PriceFeedError::UpstreamUnavailable(msg)
      })?;

    let status = response.status();
    if !status.is_success() {
      return Err(PriceFeedError::UpstreamUnavailable(format!(
        "Kuru API error: {status}"
      )));
    }

    let body = response.text().await.map_err(|e| {
      PriceFeedError::UpstreamUnavailable(format!("failed to read body: {e}"))
    })?;

    let quote = parse_market_response(&body, Utc::now())?;
    debug!(
      pair_rate = quote.pair_rate,
      reference_rate = quote.reference_rate,
      "Kuru quote received"
    );
    Ok(quote)
  }
}

/// Turn a raw Kuru body into a `Quote`.
///
/// Both cross-rates must be present, finite and positive. `now` stands
/// in for the as-of time when the upstream omits or garbles it.
pub fn parse_market_response(body: &str, now: DateTime<Utc>) -> Result<Quote, PriceFeedError> {
  let envelope: MarketEnvelope = serde_json::from_str(body)
    .map_err(|e| PriceFeedError::MalformedUpstreamResponse(format!("invalid JSON: {e}")))?;

  if !envelope.success {
    return Err(PriceFeedError::MalformedUpstreamResponse(
      "success flag not set".to_string(),
    ));
  }

  let market = envelope
    .data
    .and_then(|d| d.data)
    .ok_or_else(|| {
      PriceFeedError::MalformedUpstreamResponse("missing data.data object".to_string())
    })?;

  let pair_rate = required_rate(market.last_price, "lastPrice")?;
  let reference_rate = required_rate(market.last_price_mon_usd, "lastPriceMonUSD")?;

  let as_of = market
    .last_trade_time
    .as_deref()
    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
    .map_or(now, |t| t.with_timezone(&Utc));

  Ok(Quote {
    pair_rate,
    reference_rate,
    as_of,
    volume_24h: market.volume_24h,
    change_24h: market.price_change_24h,
  })
}

fn required_rate(value: Option<f64>, field: &str) -> Result<f64, PriceFeedError> {
  match value {
    Some(v) if v.is_finite() && v > 0.0 => Ok(v),
    Some(v) => Err(PriceFeedError::MalformedUpstreamResponse(format!(
      "{field} is not a positive number: {v}"
    ))),
    None => Err(PriceFeedError::MalformedUpstreamResponse(format!(
      "missing {field}"
    ))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const OK_BODY: &str = r#"{
    "success": true,
    "code": 200,
    "timestamp": 1700000000000,
    "data": { "data": {
      "baseasset": "0x84ada7631b8cc96cac78de0ea868c8c7b48b2753",
      "lastPrice": 0.002,
      "lastPriceMonUSD": 2.0,
      "lastTradeTime": "2024-05-01T12:00:00Z",
      "volume24h": 1234.5,
      "priceChange24h": -3.2
    } }
  }"#;

  #[test]
  fn test_parses_valid_market_payload() {
    let quote = parse_market_response(OK_BODY, Utc::now()).unwrap();
    assert_eq!(quote.pair_rate, 0.002);
    assert_eq!(quote.reference_rate, 2.0);
    assert_eq!(quote.volume_24h, Some(1234.5));
    assert_eq!(quote.as_of.to_rfc3339(), "2024-05-01T12:00:00+00:00");
    assert!((quote.derive_price() - 0.004).abs() < 1e-12);
  }

  #[test]
  fn test_missing_reference_rate_is_malformed() {
    let body = r#"{"success": true, "data": {"data": {"lastPrice": 0.002}}}"#;
    let err = parse_market_response(body, Utc::now()).unwrap_err();
    assert!(matches!(err, PriceFeedError::MalformedUpstreamResponse(_)));
    assert!(err.to_string().contains("lastPriceMonUSD"));
  }

  #[test]
  fn test_zero_rate_is_malformed() {
    let body = r#"{"success": true, "data": {"data": {"lastPrice": 0.0, "lastPriceMonUSD": 2.0}}}"#;
    assert!(parse_market_response(body, Utc::now()).is_err());
  }

  #[test]
  fn test_unsuccessful_envelope_is_malformed() {
    let body = r#"{"success": false, "data": null}"#;
    assert!(matches!(
      parse_market_response(body, Utc::now()),
      Err(PriceFeedError::MalformedUpstreamResponse(_))
    ));
  }

  #[test]
  fn test_garbage_is_malformed() {
    assert!(matches!(
      parse_market_response("<html>502</html>", Utc::now()),
      Err(PriceFeedError::MalformedUpstreamResponse(_))
    ));
  }

  #[test]
  fn test_market_url_is_built_from_config() {
    let client = KuruMarketClient::new(KuruClientConfig {
      base_url: "https://api.kuru.io/".to_string(),
      market_address: "0xabc".to_string(),
      ..KuruClientConfig::default()
    })
    .unwrap();
    assert_eq!(
      client.market_url(),
      "https://api.kuru.io/api/v2/markets/address/0xabc"
    );
  }

  #[tokio::test]
  async fn test_unreachable_upstream_is_unavailable() {
    let client = KuruMarketClient::new(KuruClientConfig {
      base_url: "http://127.0.0.1:9".to_string(),
      timeout: Duration::from_millis(500),
      ..KuruClientConfig::default()
    })
    .unwrap();

    let err = client.fetch_quote().await.unwrap_err();
    assert!(matches!(err, PriceFeedError::UpstreamUnavailable(_)));
  }

  #[tokio::test]
  async fn test_local_quota_short_circuits() {
    let client = KuruMarketClient::new(KuruClientConfig {
      base_url: "http://127.0.0.1:9".to_string(),
      timeout: Duration::from_millis(200),
      max_requests_per_minute: 1,
      ..KuruClientConfig::default()
    })
    .unwrap();

    let _ = client.fetch_quote().await;
    let err = client.fetch_quote().await.unwrap_err();
    assert_eq!(
      err.to_string(),
      "upstream unavailable: local request quota exhausted"
    );
  }
}
