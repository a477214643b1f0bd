//! Market Data Adapters
//!
//! REST clients implementing the `MarketData` port.

pub mod kuru;

pub use kuru::{KuruClientConfig, KuruMarketClient};
