//! Ports Layer - Hexagonal Architecture Boundaries
//!
//! Defines the interfaces (traits) that the domain/usecases layer
//! requires from the outside world. Adapters implement these traits.
//!
//! Port categories:
//! - `MarketData`: Upstream market quotes
//! - `PriceStore`: Durable last-valid-price slot

pub mod market_data;
pub mod price_store;

pub use market_data::MarketData;
pub use price_store::PriceStore;
