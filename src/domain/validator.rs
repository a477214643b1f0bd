//! Price validator - anti-spike and staleness rules.
//!
//! Upstream market data is third-party and unaudited. A single bad tick
//! (decimal-place error, zero, absurd spike) must never reach clients,
//! while genuine moves still have to be tracked over time. The validator
//! therefore compares each candidate against the last accepted price
//! rather than a fixed ceiling, and substitutes a known-good value for
//! anything it rejects.
//!
//! The validator never fails: every call yields a usable reading.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::price::{PriceReading, PriceSource};

/// Thresholds applied to every candidate price.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRules {
    /// Lowest acceptable USD price.
    pub min_price: f64,
    /// Highest acceptable USD price.
    pub max_price: f64,
    /// Largest accepted move relative to the last good price, in percent.
    pub max_change_percent: f64,
    /// How long the last good price may stand in for a rejected one.
    pub staleness_window: Duration,
    /// Used when there is no fresh last good price.
    pub fallback_price: f64,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_price: 0.000_001,
            max_price: 100_000.0,
            max_change_percent: 500.0,
            staleness_window: Duration::from_secs(24 * 60 * 60),
            fallback_price: 0.000_996,
        }
    }
}

/// Last accepted price and when it was accepted.
///
/// This is also the durable record: `{ "price": .., "timestamp": <unix ms> }`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LastValidPrice {
    pub price: f64,
    #[serde(rename = "timestamp", with = "chrono::serde::ts_milliseconds")]
    pub at: DateTime<Utc>,
}

/// Process-wide validator memory. Overwritten, never cleared.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ValidatorState {
    last_valid: Option<LastValidPrice>,
}

impl ValidatorState {
    pub fn new(last_valid: Option<LastValidPrice>) -> Self {
        Self { last_valid }
    }

    pub fn last_valid(&self) -> Option<LastValidPrice> {
        self.last_valid
    }

    pub fn last_valid_price(&self) -> Option<f64> {
        self.last_valid.map(|l| l.price)
    }

    pub fn last_valid_at(&self) -> Option<DateTime<Utc>> {
        self.last_valid.map(|l| l.at)
    }
}

/// Why a candidate was refused.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    /// NaN from upstream arithmetic.
    NotFinite,
    /// Below the configured floor.
    BelowMinimum { price: f64, min: f64 },
    /// Above the configured ceiling.
    AboveMaximum { price: f64, max: f64 },
    /// Moved too far from the last good price.
    ExcessiveChange {
        price: f64,
        last: f64,
        change_percent: f64,
    },
}

impl Rejection {
    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFinite => "not_finite",
            Self::BelowMinimum { .. } => "below_min",
            Self::AboveMaximum { .. } => "above_max",
            Self::ExcessiveChange { .. } => "excessive_change",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFinite => write!(f, "Price is not a finite number"),
            Self::BelowMinimum { price, min } => {
                write!(f, "Price too low: {price} < {min}")
            }
            Self::AboveMaximum { price, max } => {
                write!(f, "Price too high: {price} > {max}")
            }
            Self::ExcessiveChange {
                change_percent, ..
            } => write!(f, "Price change too dramatic: {change_percent:.2}%"),
        }
    }
}

/// Outcome of a single validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Validation {
    /// Always usable. `Live` when accepted, `Fallback` otherwise.
    pub reading: PriceReading,
    /// Whether the candidate itself was accepted.
    pub accepted: bool,
    /// Set when `accepted` is false.
    pub rejection: Option<Rejection>,
}

/// Validates candidate prices and owns the last-known-good state.
///
/// Safe to share between the pull path and the broadcaster tick: the
/// check-and-update runs under one lock so two racing validations can
/// never both compare against a stale `last_valid`.
pub struct PriceValidator {
    rules: ValidationRules,
    state: Mutex<ValidatorState>,
}

impl PriceValidator {
    /// Cold-start validator with no last good price.
    pub fn new(rules: ValidationRules) -> Self {
        Self::with_state(rules, ValidatorState::default())
    }

    pub fn with_state(rules: ValidationRules, state: ValidatorState) -> Self {
        Self {
            rules,
            state: Mutex::new(state),
        }
    }

    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> ValidatorState {
        *self.state.lock()
    }

    /// Seed the state from the durable store at startup.
    ///
    /// Returns false and leaves the state untouched when the record is not
    /// finite or falls outside the current price band.
    pub fn restore(&self, last: LastValidPrice) -> bool {
        let in_band = last.price.is_finite()
            && last.price >= self.rules.min_price
            && last.price <= self.rules.max_price;
        if !in_band {
            warn!(
                price = last.price,
                min = self.rules.min_price,
                max = self.rules.max_price,
                "Stored price outside band, ignored"
            );
            return false;
        }

        self.state.lock().last_valid = Some(last);
        true
    }

    pub fn validate(&self, candidate: f64) -> Validation {
        self.validate_at(candidate, Utc::now())
    }

    /// Validate `candidate` as if the current time were `now`.
    pub fn validate_at(&self, candidate: f64, now: DateTime<Utc>) -> Validation {
        let mut state = self.state.lock();

        match self.check(candidate, &state) {
            Ok(()) => {
                state.last_valid = Some(LastValidPrice {
                    price: candidate,
                    at: now,
                });
                debug!(price = candidate, "Price accepted");
                Validation {
                    reading: PriceReading::new(candidate, PriceSource::Live, now),
                    accepted: true,
                    rejection: None,
                }
            }
            Err(rejection) => {
                warn!(
                    candidate,
                    last_valid = ?state.last_valid_price(),
                    reason = rejection.reason(),
                    "Suspicious price rejected: {rejection}"
                );
                Validation {
                    reading: self.substitute(&state, now),
                    accepted: false,
                    rejection: Some(rejection),
                }
            }
        }
    }

    /// Substitute reading when no candidate is available at all
    /// (upstream down or malformed).
    pub fn fallback(&self) -> PriceReading {
        self.fallback_at(Utc::now())
    }

    pub fn fallback_at(&self, now: DateTime<Utc>) -> PriceReading {
        let state = self.state.lock();
        self.substitute(&state, now)
    }

    fn check(&self, candidate: f64, state: &ValidatorState) -> Result<(), Rejection> {
        if candidate.is_nan() {
            return Err(Rejection::NotFinite);
        }
        if candidate < self.rules.min_price {
            return Err(Rejection::BelowMinimum {
                price: candidate,
                min: self.rules.min_price,
            });
        }
        if candidate > self.rules.max_price {
            return Err(Rejection::AboveMaximum {
                price: candidate,
                max: self.rules.max_price,
            });
        }

        if let Some(last) = state.last_valid_price().filter(|last| *last > 0.0) {
            let change_percent = ((candidate - last) / last).abs() * 100.0;
            if change_percent > self.rules.max_change_percent {
                return Err(Rejection::ExcessiveChange {
                    price: candidate,
                    last,
                    change_percent,
                });
            }
        }

        Ok(())
    }

    /// Last good price while it is younger than the staleness window,
    /// the configured constant otherwise.
    fn substitute(&self, state: &ValidatorState, now: DateTime<Utc>) -> PriceReading {
        if let Some(last) = state.last_valid {
            // A timestamp from the future (clock skew) counts as fresh.
            let fresh = now
                .signed_duration_since(last.at)
                .to_std()
                .map_or(true, |age| age < self.rules.staleness_window);

            if fresh {
                debug!(price = last.price, since = %last.at, "Using recent valid price");
                return PriceReading::new(last.price, PriceSource::Fallback, last.at);
            }
        }

        warn!(
            price = self.rules.fallback_price,
            "Using configured fallback price"
        );
        PriceReading::new(self.rules.fallback_price, PriceSource::Fallback, now)
    }
}
