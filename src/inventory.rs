//! Local inventory with its demand cache
//!
//! The single in-memory copy of what we own. Items are trimmed when spent
//! and restored when a trade is reversed; every change is written through
//! to the store.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::store::InventoryStore;
use crate::types::{DemandEntry, Item, ParsedCache};

#[derive(Debug, Default)]
struct InventoryState {
    items: Vec<Item>,
    cache: ParsedCache,
}

/// Outcome of replacing the stored inventory with a fresh listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub total: usize,
    pub classified: usize,
    /// Stored instances no longer present remotely
    pub gone: usize,
}

pub struct Inventory {
    state: Mutex<InventoryState>,
    store: Arc<dyn InventoryStore>,
    cache_ttl: Duration,
}

impl Inventory {
    pub fn new(store: Arc<dyn InventoryStore>, cache_ttl_hours: i64) -> Self {
        Self {
            state: Mutex::new(InventoryState::default()),
            store,
            cache_ttl: Duration::hours(cache_ttl_hours),
        }
    }

    /// Build from whatever the store holds
    pub async fn load(
        store: Arc<dyn InventoryStore>,
        cache_ttl_hours: i64,
    ) -> anyhow::Result<Self> {
        let items = store.load_inventory().await?;
        let cache = store.load_parsed_cache().await?;
        info!("Loaded {} items and {} cached demands", items.len(), cache.len());

        let inventory = Self::new(store, cache_ttl_hours);
        *inventory.lock() = InventoryState { items, cache };
        Ok(inventory)
    }

    fn lock(&self) -> MutexGuard<'_, InventoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Replace the stored inventory with a fresh remote listing.
    ///
    /// Demand already known for a surviving instance is carried over;
    /// cache entries stay since they are keyed by item kind.
    pub async fn sync(&self, fresh: Vec<Item>) -> anyhow::Result<SyncReport> {
        let report = {
            let mut state = self.lock();
            let known: HashMap<u64, &Item> =
                state.items.iter().map(|item| (item.instance_id, item)).collect();
            let fresh_ids: HashSet<u64> = fresh.iter().map(|item| item.instance_id).collect();
            let gone = known.keys().filter(|id| !fresh_ids.contains(id)).count();

            let merged: Vec<Item> = fresh
                .into_iter()
                .map(|mut item| {
                    if let Some(previous) = known.get(&item.instance_id) {
                        if previous.item_id == item.item_id && previous.is_classified() {
                            item.demand_count = previous.demand_count;
                            item.cached_at = previous.cached_at;
                        }
                    }
                    item
                })
                .collect();

            let classified = merged.iter().filter(|item| item.is_classified()).count();
            state.items = merged;
            SyncReport {
                total: state.items.len(),
                classified,
                gone,
            }
        };

        info!(
            "Inventory synced: {} items ({} classified), {} gone since last run",
            report.total, report.classified, report.gone
        );
        self.save().await?;
        Ok(report)
    }

    /// Write both files
    pub async fn save(&self) -> anyhow::Result<()> {
        let (items, cache) = {
            let state = self.lock();
            (state.items.clone(), state.cache.clone())
        };
        self.store.save_inventory(&items).await?;
        self.store.save_parsed_cache(&cache).await?;
        Ok(())
    }

    async fn save_logged(&self) {
        if let Err(e) = self.save().await {
            warn!("Failed to persist inventory: {}", e);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn items(&self) -> Vec<Item> {
        self.lock().items.clone()
    }

    pub fn contains_instance(&self, instance_id: u64) -> bool {
        self.lock().items.iter().any(|item| item.instance_id == instance_id)
    }

    /// Items of `rank` not in either filter set
    pub fn candidates(
        &self,
        rank: &str,
        excluded: &HashSet<u64>,
        locked: &HashSet<u64>,
    ) -> Vec<Item> {
        let rank = rank.to_uppercase();
        self.lock()
            .items
            .iter()
            .filter(|item| item.rank == rank)
            .filter(|item| {
                !excluded.contains(&item.instance_id) && !locked.contains(&item.instance_id)
            })
            .cloned()
            .collect()
    }

    /// Cached demand of `item_id` if younger than the TTL
    pub fn cached_demand(&self, item_id: u64, now: DateTime<Utc>) -> Option<u32> {
        self.lock()
            .cache
            .get(&item_id)
            .filter(|entry| now - entry.cached_at < self.cache_ttl)
            .map(|entry| entry.demand_count)
    }

    /// Record `demand` for the kind of `instance_id` (all its instances)
    /// and in the cache; returns the updated item
    pub async fn classify(
        &self,
        instance_id: u64,
        demand: u32,
        now: DateTime<Utc>,
    ) -> Option<Item> {
        let updated = {
            let mut state = self.lock();
            let item_id = state
                .items
                .iter()
                .find(|item| item.instance_id == instance_id)
                .map(|item| item.item_id)?;

            for item in state.items.iter_mut().filter(|item| item.item_id == item_id) {
                item.demand_count = Some(demand);
                item.cached_at = Some(now);
            }
            state.cache.insert(
                item_id,
                DemandEntry {
                    demand_count: demand,
                    cached_at: now,
                },
            );
            state.items.iter().find(|item| item.instance_id == instance_id).cloned()
        };

        self.save_logged().await;
        updated
    }

    /// Drop one instance of kind `item_id`, taking one listed in `prefer`
    /// when the kind has several
    pub async fn remove_kind(&self, item_id: u64, prefer: &HashSet<u64>) -> Option<Item> {
        let removed = {
            let mut state = self.lock();
            let pos = state
                .items
                .iter()
                .position(|item| item.item_id == item_id && prefer.contains(&item.instance_id))
                .or_else(|| state.items.iter().position(|item| item.item_id == item_id))?;
            state.items.remove(pos)
        };
        debug!("Removed {} from inventory", removed.label());
        self.save_logged().await;
        Some(removed)
    }

    pub async fn remove_instance(&self, instance_id: u64) -> Option<Item> {
        let removed = {
            let mut state = self.lock();
            let pos = state.items.iter().position(|item| item.instance_id == instance_id)?;
            state.items.remove(pos)
        };
        debug!("Removed {} from inventory", removed.label());
        self.save_logged().await;
        Some(removed)
    }

    /// Put an item back; no-op if its instance is already present
    pub async fn restore(&self, item: Item) -> bool {
        {
            let mut state = self.lock();
            if state.items.iter().any(|i| i.instance_id == item.instance_id) {
                return false;
            }
            debug!("Restored {} to inventory", item.label());
            state.items.push(item);
        }
        self.save_logged().await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonFileStore;

    fn store() -> (tempfile::TempDir, Arc<JsonFileStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));
        (dir, store)
    }

    #[tokio::test]
    async fn test_sync_carries_known_demand() {
        let (_dir, store) = store();
        let now = Utc::now();
        let inventory = Inventory::new(store.clone(), 72);
        inventory
            .sync(vec![Item::new(1, 10, "a").classified(4, now), Item::new(2, 20, "a")])
            .await
            .unwrap();

        let report = inventory
            .sync(vec![Item::new(1, 10, "a"), Item::new(3, 30, "a")])
            .await
            .unwrap();
        assert_eq!(report, SyncReport { total: 2, classified: 1, gone: 1 });

        let reloaded = Inventory::load(store, 72).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.items()[0].demand_count, Some(4));
    }

    #[tokio::test]
    async fn test_candidates_respect_filters() {
        let (_dir, store) = store();
        let inventory = Inventory::new(store, 72);
        inventory
            .sync(vec![
                Item::new(1, 10, "a"),
                Item::new(2, 20, "a"),
                Item::new(3, 30, "a"),
                Item::new(4, 40, "b"),
            ])
            .await
            .unwrap();

        let excluded = HashSet::from([10]);
        let locked = HashSet::from([20]);
        let ids: Vec<u64> = inventory
            .candidates("A", &excluded, &locked)
            .iter()
            .map(|item| item.instance_id)
            .collect();
        assert_eq!(ids, vec![30]);
    }

    #[tokio::test]
    async fn test_classify_updates_kind_and_cache() {
        let (_dir, store) = store();
        let inventory = Inventory::new(store, 72);
        inventory
            .sync(vec![Item::new(7, 70, "a"), Item::new(7, 71, "a")])
            .await
            .unwrap();

        let now = Utc::now();
        let item = inventory.classify(70, 12, now).await.unwrap();
        assert_eq!(item.demand_count, Some(12));
        assert!(inventory.items().iter().all(|item| item.demand_count == Some(12)));
        assert_eq!(inventory.cached_demand(7, now), Some(12));
        assert_eq!(inventory.cached_demand(7, now + Duration::hours(73)), None);
    }

    #[tokio::test]
    async fn test_remove_and_restore() {
        let (_dir, store) = store();
        let inventory = Inventory::new(store, 72);
        inventory.sync(vec![Item::new(5, 50, "a")]).await.unwrap();

        let removed = inventory.remove_kind(5, &HashSet::new()).await.unwrap();
        assert!(inventory.is_empty());
        assert!(inventory.remove_kind(5, &HashSet::new()).await.is_none());

        assert!(inventory.restore(removed.clone()).await);
        assert!(!inventory.restore(removed).await);
        assert_eq!(inventory.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_kind_prefers_listed_instance() {
        let (_dir, store) = store();
        let inventory = Inventory::new(store, 72);
        let items = vec![Item::new(5, 50, "a"), Item::new(5, 51, "a"), Item::new(5, 52, "a")];
        inventory.sync(items).await.unwrap();

        let prefer = HashSet::from([51]);
        let removed = inventory.remove_kind(5, &prefer).await.unwrap();
        assert_eq!(removed.instance_id, 51);
        assert!(inventory.contains_instance(50));
        assert!(inventory.contains_instance(52));

        // Falls back to any instance of the kind
        let removed = inventory.remove_kind(5, &prefer).await.unwrap();
        assert_eq!(removed.instance_id, 50);
    }
}
