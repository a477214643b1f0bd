//! Price domain types.
//!
//! `Quote` is the normalized upstream market snapshot; `PriceReading` is
//! what the rest of the system hands to clients. Readings always carry a
//! source tag so consumers can tell a live price from a substitute.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized market quote for the KA/MON pair.
///
/// Created per upstream call and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    /// KA priced in MON (asset vs. intermediate).
    pub pair_rate: f64,
    /// MON priced in USD (intermediate vs. reference fiat).
    pub reference_rate: f64,
    /// When the upstream says the quote was valid.
    pub as_of: DateTime<Utc>,
    /// 24h traded volume, if reported.
    pub volume_24h: Option<f64>,
    /// 24h price change, if reported.
    pub change_24h: Option<f64>,
}

impl Quote {
    /// USD price implied by the two cross-rates.
    pub fn derive_price(&self) -> f64 {
        derive_price(self.pair_rate, self.reference_rate)
    }
}

/// `pair_rate * reference_rate`.
pub fn derive_price(pair_rate: f64, reference_rate: f64) -> f64 {
    pair_rate * reference_rate
}

/// Where a reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    /// Fresh from upstream and accepted by the validator.
    Live,
    /// Served from the TTL cache.
    Cached,
    /// Substitute: last good price or the configured constant.
    Fallback,
}

impl PriceSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Cached => "cached",
            Self::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for PriceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated USD price, ready to serve.
///
/// Serializes as `{ "price": .., "source": "live", "timestamp": <unix ms> }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceReading {
    /// USD price, always inside the configured band.
    pub price: f64,
    /// Provenance tag.
    pub source: PriceSource,
    /// When the price was observed.
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub observed_at: DateTime<Utc>,
}

impl PriceReading {
    pub fn new(price: f64, source: PriceSource, observed_at: DateTime<Utc>) -> Self {
        Self {
            price,
            source,
            observed_at,
        }
    }

    /// Same reading, different provenance tag.
    pub fn with_source(self, source: PriceSource) -> Self {
        Self { source, ..self }
    }
}
