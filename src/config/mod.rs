//! Configuration Module - Price Feed Configuration
//!
//! Every threshold, interval and endpoint lives here; nothing is
//! hardcoded in the domain layer. Values come from built-in defaults,
//! an optional `config.toml`, and environment variables (with `.env`
//! support), in that order of precedence.

pub mod loader;

use std::time::Duration;

use serde::Deserialize;

use crate::domain::validator::ValidationRules;

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
  /// Listener addresses and logging.
  pub server: ServerConfig,
  /// Upstream market API.
  pub upstream: UpstreamConfig,
  /// Price cache.
  pub cache: CacheConfig,
  /// SSE broadcaster.
  pub stream: StreamConfig,
  /// Validator thresholds.
  pub validation: ValidationConfig,
  /// Last-valid-price durability.
  pub persistence: PersistenceConfig,
}

/// Listener and logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Bind address for the price API (`/price`, `/price/stream`).
  pub bind_address: String,
  /// Bind address for `/live`, `/ready` and `/metrics`.
  pub ops_bind_address: String,
  /// Log level (trace, debug, info, warn, error).
  pub log_level: String,
  /// Origins allowed to call the price API from a browser; `*` allows any.
  pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind_address: "0.0.0.0:8080".to_string(),
      ops_bind_address: "0.0.0.0:9090".to_string(),
      log_level: "info".to_string(),
      allowed_origins: vec!["*".to_string()],
    }
  }
}

/// Kuru market API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
  /// REST API base URL.
  pub base_url: String,
  /// KA/MON market contract address.
  pub market_address: String,
  /// Per-request timeout in milliseconds.
  pub timeout_ms: u64,
  /// Local quota on upstream calls.
  pub max_requests_per_minute: u32,
}

impl Default for UpstreamConfig {
  fn default() -> Self {
    Self {
      base_url: "https://api.kuru.io".to_string(),
      market_address: "0x1e9a083b58a560d3daf13269ea53ad69c4a1bd0e".to_string(),
      timeout_ms: 10_000,
      max_requests_per_minute: 60,
    }
  }
}

impl UpstreamConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_millis(self.timeout_ms)
  }
}

/// Price cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Price entry TTL in milliseconds.
  pub price_ttl_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      price_ttl_ms: 20_000,
    }
  }
}

impl CacheConfig {
  pub fn price_ttl(&self) -> Duration {
    Duration::from_millis(self.price_ttl_ms)
  }
}

/// SSE broadcaster configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
  /// Shared ticker period in milliseconds.
  pub tick_interval_ms: u64,
  /// Admission ceiling for concurrent streams.
  pub max_connections: usize,
  /// Lifetime of a single stream in milliseconds.
  pub connection_timeout_ms: u64,
  /// Budget for pushing one reading to one connection.
  pub push_timeout_ms: u64,
  /// `Retry-After` seconds on admission refusal.
  pub retry_after_secs: u64,
  /// Per-connection buffered readings before pushes start timing out.
  pub buffer_size: usize,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      tick_interval_ms: 10_000,
      max_connections: 50,
      connection_timeout_ms: 300_000,
      push_timeout_ms: 1_000,
      retry_after_secs: 60,
      buffer_size: 8,
    }
  }
}

impl StreamConfig {
  pub fn tick_interval(&self) -> Duration {
    Duration::from_millis(self.tick_interval_ms)
  }

  pub fn connection_timeout(&self) -> Duration {
    Duration::from_millis(self.connection_timeout_ms)
  }

  pub fn push_timeout(&self) -> Duration {
    Duration::from_millis(self.push_timeout_ms)
  }
}

/// Validator thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
  /// Minimum reasonable USD price.
  pub min_price: f64,
  /// Maximum reasonable USD price.
  pub max_price: f64,
  /// Maximum change per update, in percent.
  pub max_change_percent: f64,
  /// How long the last valid price may be reused, in hours.
  pub staleness_hours: u64,
  /// Price served when nothing better is available.
  pub fallback_price: f64,
}

impl Default for ValidationConfig {
  fn default() -> Self {
    let rules = ValidationRules::default();
    Self {
      min_price: rules.min_price,
      max_price: rules.max_price,
      max_change_percent: rules.max_change_percent,
      staleness_hours: rules.staleness_window.as_secs() / 3600,
      fallback_price: rules.fallback_price,
    }
  }
}

impl ValidationConfig {
  pub fn rules(&self) -> ValidationRules {
    ValidationRules {
      min_price: self.min_price,
      max_price: self.max_price,
      max_change_percent: self.max_change_percent,
      staleness_window: Duration::from_secs(self.staleness_hours * 3600),
      fallback_price: self.fallback_price,
    }
  }
}

/// Persistence configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
  /// Mirror the last valid price to disk.
  pub enabled: bool,
  /// Directory for `last_valid_price.json`.
  pub data_dir: String,
}

impl Default for PersistenceConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      data_dir: "data".to_string(),
    }
  }
}
