//! Choosing which of our items to offer for a target
//!
//! Demands at or below the low-demand threshold are interchangeable, so they
//! are compared on `normalize(d) = d - L` (floored at zero). Unclassified
//! items are tried first in random order and classified lazily; only when
//! none of them reaches the target does the classified set get searched.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::SelectionConfig;
use crate::inventory::Inventory;
use crate::site::Extractor;
use crate::trade::LockedItems;
use crate::types::Item;

/// Collapse low demands into a single zero bucket
pub fn normalize(demand: u32, low_demand_threshold: u32) -> u32 {
    demand.saturating_sub(low_demand_threshold)
}

pub struct SelectionEngine {
    inventory: Arc<Inventory>,
    extractor: Arc<dyn Extractor>,
    locked: LockedItems,
    cfg: SelectionConfig,
    rng: Mutex<StdRng>,
}

impl SelectionEngine {
    pub fn new(
        inventory: Arc<Inventory>,
        extractor: Arc<dyn Extractor>,
        locked: LockedItems,
        cfg: SelectionConfig,
    ) -> Self {
        Self {
            inventory,
            extractor,
            locked,
            cfg,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic choices, for tests
    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    fn normalize(&self, demand: u32) -> u32 {
        normalize(demand, self.cfg.low_demand_threshold)
    }

    fn acceptable(&self, item: &Item) -> bool {
        item.demand_count
            .is_some_and(|demand| demand <= self.cfg.max_demand)
    }

    /// Best item of `target_rank` to offer against `target_demand`.
    ///
    /// `excluded` and the locked set hide instances from both phases. Returns
    /// `None` when nothing of the rank is offerable.
    pub async fn select_best(
        &self,
        target_rank: &str,
        target_demand: u32,
        excluded: &HashSet<u64>,
    ) -> Option<Item> {
        let target = self.normalize(target_demand);
        let candidates = self
            .inventory
            .candidates(target_rank, excluded, &self.locked.snapshot());
        if candidates.is_empty() {
            debug!("No {} items left to offer", target_rank);
            return None;
        }

        let mut unclassified: Vec<Item> = candidates
            .iter()
            .filter(|item| !item.is_classified())
            .cloned()
            .collect();
        debug!(
            "{} candidates of rank {}, {} unclassified",
            candidates.len(),
            target_rank,
            unclassified.len()
        );

        if !unclassified.is_empty() {
            unclassified.shuffle(&mut *self.rng.lock().unwrap_or_else(|p| p.into_inner()));
            if let Some(item) = self.scan_unclassified(unclassified, target).await {
                info!(
                    "Selected {} with demand {} (target {})",
                    item.label(),
                    item.demand_count.unwrap_or_default(),
                    target_demand
                );
                return Some(item);
            }
        }

        // Classification above may have touched the candidates
        let classified: Vec<Item> = self
            .inventory
            .candidates(target_rank, excluded, &self.locked.snapshot())
            .into_iter()
            .filter(|item| self.acceptable(item))
            .collect();
        let item = self.pick_classified(&classified, target)?;
        info!(
            "Selected classified {} with demand {} (target {})",
            item.label(),
            item.demand_count.unwrap_or_default(),
            target_demand
        );
        Some(item)
    }

    /// Classify in order until one reaches `target`
    async fn scan_unclassified(&self, items: Vec<Item>, target: u32) -> Option<Item> {
        let total = items.len();
        for (attempt, item) in items.into_iter().enumerate() {
            if attempt == self.cfg.attempt_budget {
                info!(
                    "No match after {} random picks, classifying the remaining {}",
                    attempt,
                    total - attempt
                );
            }

            let Some(item) = self.classify(item).await else {
                continue;
            };
            if !self.acceptable(&item) {
                continue;
            }
            if item
                .demand_count
                .is_some_and(|demand| self.normalize(demand) >= target)
            {
                return Some(item);
            }
        }
        None
    }

    /// Resolve demand from the cache or a lookup; a failed lookup leaves the
    /// item unclassified
    async fn classify(&self, item: Item) -> Option<Item> {
        let now = Utc::now();
        let demand = match self.inventory.cached_demand(item.item_id, now) {
            Some(demand) => demand,
            None => match self.extractor.item_demand(item.item_id).await {
                Ok(demand) => demand,
                Err(e) => {
                    warn!("Demand lookup for {} failed: {}", item.label(), e);
                    return None;
                }
            },
        };

        // None if the instance left the inventory meanwhile
        self.inventory.classify(item.instance_id, demand, now).await
    }

    /// At-or-above target at random, else the highest below it
    fn pick_classified(&self, items: &[Item], target: u32) -> Option<Item> {
        let (at_or_above, below): (Vec<&Item>, Vec<&Item>) = items
            .iter()
            .partition(|item| self.normalize(item.demand_count.unwrap_or_default()) >= target);

        if !at_or_above.is_empty() {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            return at_or_above.choose(&mut *rng).map(|item| (*item).clone());
        }

        below
            .into_iter()
            .max_by_key(|item| self.normalize(item.demand_count.unwrap_or_default()))
            .cloned()
    }
}
