//! Last Price Store - Atomic JSON Persistence of the Last Valid Price
//!
//! Saves the validator's last accepted price to `last_valid_price.json`
//! using atomic writes (write to tmp file, then rename). A crash mid-write
//! leaves either the old or the new record, never a partial one.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, instrument};

use crate::domain::validator::LastValidPrice;
use crate::ports::price_store::PriceStore;

const FILE_NAME: &str = "last_valid_price.json";

/// File-backed `PriceStore`.
pub struct JsonPriceStore {
    /// Path to last_valid_price.json.
    path: PathBuf,
    /// Temporary path for atomic writes.
    tmp_path: PathBuf,
}

impl JsonPriceStore {
    /// Create a store in the given data directory.
    ///
    /// Creates the directory if it doesn't exist.
    pub async fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;

        Ok(Self {
            path: dir.join(FILE_NAME),
            tmp_path: dir.join(format!("{FILE_NAME}.tmp")),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PriceStore for JsonPriceStore {
    #[instrument(skip(self), fields(path = %self.path.display()))]
    async fn load(&self) -> Result<Option<LastValidPrice>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            info!("No stored price found, starting cold");
            return Ok(None);
        }

        let json = fs::read_to_string(&self.path)
            .await
            .context("Failed to read stored price")?;

        let last: LastValidPrice =
            serde_json::from_str(&json).context("Failed to parse stored price JSON")?;

        info!(price = last.price, at = %last.at, "Restored last valid price");
        Ok(Some(last))
    }

    #[instrument(skip(self, last), fields(price = last.price))]
    async fn save(&self, last: &LastValidPrice) -> Result<()> {
        let json = serde_json::to_string(last).context("Failed to serialize price")?;

        fs::write(&self.tmp_path, &json)
            .await
            .context("Failed to write tmp price file")?;

        fs::rename(&self.tmp_path, &self.path)
            .await
            .context("Failed to rename price file")?;

        debug!("Last valid price persisted");
        Ok(())
    }
}
