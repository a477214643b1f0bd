//! Persistence Adapters - JSON File Storage
//!
//! Implements the `PriceStore` port with a single atomic JSON file.
//! No database dependency; lightweight and crash-recoverable.

pub mod last_price;

pub use last_price::JsonPriceStore;
