//! Configuration Loader - File, Environment and Validation
//!
//! Builds the `AppConfig` from defaults, an optional TOML file and
//! environment variables, then validates every parameter with clear
//! error messages for misconfiguration.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use tracing::info;

use super::AppConfig;

/// Load and validate configuration.
///
/// # Arguments
/// * `path` - Path to an optional config.toml; defaults are used when absent
///
/// # Errors
/// Returns detailed error if:
/// - The file exists but can't be read or parsed
/// - An environment override can't be parsed
/// - Validation rules are violated
pub fn load_config(path: &str) -> Result<AppConfig> {
  let path = Path::new(path);

  let mut config = if path.exists() {
    let content = std::fs::read_to_string(path)
      .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
      .with_context(|| format!("Failed to parse {}", path.display()))?
  } else {
    info!(path = %path.display(), "No config file, using defaults and environment");
    AppConfig::default()
  };

  apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
  validate_config(&config)?;

  info!(
    upstream = %config.upstream.base_url,
    cache_ttl_ms = config.cache.price_ttl_ms,
    tick_ms = config.stream.tick_interval_ms,
    max_connections = config.stream.max_connections,
    "Configuration loaded successfully"
  );

  Ok(config)
}

/// Overlay environment variables onto `config`.
///
/// `lookup` abstracts `std::env::var` so overrides can be tested
/// without touching the process environment. Durations use
/// milliseconds, matching the variable names operators already know.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
  F: Fn(&str) -> Option<String>,
{
  // Server
  set_string(&mut config.server.bind_address, "BIND_ADDRESS", &lookup);
  set_string(&mut config.server.ops_bind_address, "OPS_BIND_ADDRESS", &lookup);
  set_string(&mut config.server.log_level, "LOG_LEVEL", &lookup);
  set_list(&mut config.server.allowed_origins, "ALLOWED_ORIGINS", &lookup);

  // Upstream
  set_string(&mut config.upstream.base_url, "KURU_API_BASE_URL", &lookup);
  set_string(&mut config.upstream.market_address, "KURU_MARKET_ADDRESS", &lookup);
  set_parsed(&mut config.upstream.timeout_ms, "KURU_API_TIMEOUT", &lookup)?;
  set_parsed(
    &mut config.upstream.max_requests_per_minute,
    "KURU_MAX_REQUESTS_PER_MINUTE",
    &lookup,
  )?;

  // Cache
  set_parsed(&mut config.cache.price_ttl_ms, "PRICE_CACHE_TTL", &lookup)?;

  // Stream
  set_parsed(&mut config.stream.tick_interval_ms, "PRICE_UPDATE_INTERVAL", &lookup)?;
  set_parsed(&mut config.stream.max_connections, "MAX_SSE_CONNECTIONS", &lookup)?;
  set_parsed(
    &mut config.stream.connection_timeout_ms,
    "SSE_CONNECTION_TIMEOUT",
    &lookup,
  )?;
  set_parsed(&mut config.stream.retry_after_secs, "SSE_RETRY_AFTER", &lookup)?;

  // Validation
  set_parsed(&mut config.validation.min_price, "PRICE_MIN", &lookup)?;
  set_parsed(&mut config.validation.max_price, "PRICE_MAX", &lookup)?;
  set_parsed(
    &mut config.validation.max_change_percent,
    "PRICE_MAX_CHANGE_PERCENT",
    &lookup,
  )?;
  set_parsed(&mut config.validation.staleness_hours, "PRICE_STALENESS_HOURS", &lookup)?;
  set_parsed(&mut config.validation.fallback_price, "PRICE_FALLBACK", &lookup)?;

  // Persistence
  set_parsed(&mut config.persistence.enabled, "PERSISTENCE_ENABLED", &lookup)?;
  set_string(&mut config.persistence.data_dir, "DATA_DIR", &lookup);

  Ok(())
}

fn set_string<F>(target: &mut String, key: &str, lookup: &F)
where
  F: Fn(&str) -> Option<String>,
{
  if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
    *target = value.trim().to_string();
  }
}

/// Comma-separated list; blank entries are dropped.
fn set_list<F>(target: &mut Vec<String>, key: &str, lookup: &F)
where
  F: Fn(&str) -> Option<String>,
{
  if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
    *target = value
      .split(',')
      .map(str::trim)
      .filter(|origin| !origin.is_empty())
      .map(str::to_string)
      .collect();
  }
}

fn set_parsed<T, F>(target: &mut T, key: &str, lookup: &F) -> Result<()>
where
  T: FromStr,
  T::Err: Display,
  F: Fn(&str) -> Option<String>,
{
  if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
    *target = value
      .trim()
      .parse()
      .map_err(|e| anyhow::anyhow!("Invalid value for {key} ({value}): {e}"))?;
  }
  Ok(())
}

/// Validate all configuration parameters.
///
/// Checks for:
/// - Non-empty endpoints
/// - Positive intervals, timeouts and limits
/// - A sane price band containing the fallback price
pub fn validate_config(config: &AppConfig) -> Result<()> {
  anyhow::ensure!(
    !config.server.allowed_origins.is_empty(),
    "allowed_origins must list at least one origin (or \"*\")"
  );

  // Upstream validation
  anyhow::ensure!(
    !config.upstream.base_url.is_empty(),
    "Upstream base URL must not be empty"
  );
  anyhow::ensure!(
    !config.upstream.market_address.is_empty(),
    "Upstream market address must not be empty"
  );
  anyhow::ensure!(
    config.upstream.timeout_ms > 0,
    "Upstream timeout must be positive"
  );
  anyhow::ensure!(
    config.upstream.max_requests_per_minute > 0,
    "max_requests_per_minute must be positive"
  );

  // Cache and stream validation
  anyhow::ensure!(config.cache.price_ttl_ms > 0, "Cache TTL must be positive");
  anyhow::ensure!(
    config.stream.tick_interval_ms > 0,
    "Tick interval must be positive"
  );
  anyhow::ensure!(
    config.stream.max_connections > 0,
    "max_connections must be positive"
  );
  anyhow::ensure!(
    config.stream.connection_timeout_ms > 0,
    "Connection timeout must be positive"
  );
  anyhow::ensure!(
    config.stream.push_timeout_ms > 0,
    "Push timeout must be positive"
  );
  anyhow::ensure!(
    config.stream.buffer_size > 0,
    "Stream buffer size must be positive"
  );

  // Validation thresholds
  let v = &config.validation;
  anyhow::ensure!(
    v.min_price > 0.0 && v.min_price < v.max_price,
    "Price band must satisfy 0 < min_price < max_price, got [{}, {}]",
    v.min_price,
    v.max_price
  );
  anyhow::ensure!(
    v.max_change_percent > 0.0,
    "max_change_percent must be positive, got {}",
    v.max_change_percent
  );
  anyhow::ensure!(
    v.fallback_price >= v.min_price && v.fallback_price <= v.max_price,
    "fallback_price {} must lie inside [{}, {}]",
    v.fallback_price,
    v.min_price,
    v.max_price
  );

  if config.persistence.enabled {
    anyhow::ensure!(
      !config.persistence.data_dir.is_empty(),
      "data_dir must not be empty when persistence is enabled"
    );
  }

  Ok(())
}
