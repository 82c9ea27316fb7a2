//! Persistence of inventory and demand cache

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::types::{Item, ParsedCache, TargetResource};

pub const INVENTORY_FILE: &str = "inventory.json";
pub const PARSED_INVENTORY_FILE: &str = "parsed_inventory.json";
pub const TARGET_FILE: &str = "boost_card.json";

/// Load/save of opaque records
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn load_inventory(&self) -> anyhow::Result<Vec<Item>>;
    async fn save_inventory(&self, items: &[Item]) -> anyhow::Result<()>;
    async fn load_parsed_cache(&self) -> anyhow::Result<ParsedCache>;
    async fn save_parsed_cache(&self, cache: &ParsedCache) -> anyhow::Result<()>;

    /// Last known target, kept for inspection only
    async fn save_target(&self, _target: &TargetResource) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Pretty-printed JSON files under one directory
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn read<T: DeserializeOwned + Default>(&self, name: &str) -> anyhow::Result<T> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path).await {
            Ok(json) => match serde_json::from_str(&json) {
                Ok(value) => Ok(value),
                Err(e) => {
                    warn!("Ignoring unreadable {}: {}", path.display(), e);
                    Ok(T::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(name);
        let json = serde_json::to_string_pretty(value)?;
        fs::write(&path, json).await?;
        debug!("Wrote {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl InventoryStore for JsonFileStore {
    async fn load_inventory(&self) -> anyhow::Result<Vec<Item>> {
        self.read(INVENTORY_FILE).await
    }

    async fn save_inventory(&self, items: &[Item]) -> anyhow::Result<()> {
        self.write(INVENTORY_FILE, items).await
    }

    async fn load_parsed_cache(&self) -> anyhow::Result<ParsedCache> {
        self.read(PARSED_INVENTORY_FILE).await
    }

    async fn save_parsed_cache(&self, cache: &ParsedCache) -> anyhow::Result<()> {
        self.write(PARSED_INVENTORY_FILE, cache).await
    }

    async fn save_target(&self, target: &TargetResource) -> anyhow::Result<()> {
        self.write(TARGET_FILE, target).await
    }
}
