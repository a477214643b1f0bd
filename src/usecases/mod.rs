//! Use Cases Layer - Price Pipeline Workflows
//!
//! Orchestrates the domain validator with the port interfaces to
//! implement the service's two delivery paths.
//!
//! Use cases:
//! - `PriceCache`: Short-TTL store in front of the upstream API
//! - `PriceService`: Cache → market → validator chain behind every read
//! - `Broadcaster`: Shared ticker fanning readings out to SSE streams

pub mod broadcaster;
pub mod price_cache;
pub mod price_service;

pub use broadcaster::{Broadcaster, BroadcasterSettings, BroadcasterStats, Subscription};
pub use price_cache::PriceCache;
pub use price_service::{PRICE_CACHE_KEY, PriceService};
