//! Market Data Port - Upstream Quote Interface
//!
//! Defines the trait the price service uses to obtain a fresh quote
//! from the external market. Implementations make exactly one attempt
//! per call; retry policy belongs to the caller.

use async_trait::async_trait;

use crate::domain::price::Quote;
use crate::error::PriceFeedError;

/// Source of upstream market quotes.
///
/// Errors must be either `UpstreamUnavailable` or
/// `MalformedUpstreamResponse`. An implementation never returns a
/// zero or placeholder quote in place of an error.
#[async_trait]
pub trait MarketData: Send + Sync + 'static {
  /// Fetch the current quote for the configured trading pair.
  async fn fetch_quote(&self) -> Result<Quote, PriceFeedError>;
}
