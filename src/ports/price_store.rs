//! Price Store Port - Durable Last-Valid-Price Slot
//!
//! A single key-value slot holding the last accepted price so a
//! restart can resume from it instead of starting cold. Read once at
//! startup, written after every accepted validation.

use async_trait::async_trait;

use crate::domain::validator::LastValidPrice;

#[async_trait]
pub trait PriceStore: Send + Sync + 'static {
  /// Load the stored price, `None` on first startup.
  async fn load(&self) -> anyhow::Result<Option<LastValidPrice>>;

  /// Overwrite the stored price.
  async fn save(&self, last: &LastValidPrice) -> anyhow::Result<()>;
}
