//! In-memory site for driving the runner without HTTP

#![allow(dead_code)]

use async_trait::async_trait;
use boost_runner::error::{RemoteError, RemoteResult};
use boost_runner::site::{ClubActions, Extractor, OwnersPage, PartnerItem, TradeApi};
use boost_runner::store::InventoryStore;
use boost_runner::types::{
    Item, Owner, ParsedCache, QuotaCounts, TargetResource, TradeHistoryEntry,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// A proposal the site accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub owner_id: u64,
    pub my_instance_id: u64,
    pub their_instance_id: u64,
}

pub struct SiteState {
    pub owners: Vec<Owner>,
    pub demand: HashMap<u64, u32>,
    pub target: Option<TargetResource>,
    /// Targets the club moves to after a contribution or replacement
    pub next_targets: VecDeque<TargetResource>,
    pub acquisition_open: bool,
    pub my_items: Vec<Item>,
    pub history: Vec<TradeHistoryEntry>,
    pub quota: QuotaCounts,
    /// Every owner holds a free copy of the current target
    pub partners_have_target: bool,
    pub reject_trades: bool,
    pub proposals: Vec<Proposal>,
    pub failed_proposals: usize,
    pub contributions: Vec<u64>,
    pub replacements: u32,
    pub cancels: u32,
}

type TradeHook = Box<dyn Fn(usize) + Send + Sync>;

/// Extractor, trade endpoints and club actions over shared state
pub struct MockSite {
    state: Mutex<SiteState>,
    on_trade: Mutex<Option<TradeHook>>,
}

impl MockSite {
    pub fn new(target: TargetResource) -> Self {
        Self {
            state: Mutex::new(SiteState {
                owners: Vec::new(),
                demand: HashMap::new(),
                target: Some(target),
                next_targets: VecDeque::new(),
                acquisition_open: false,
                my_items: Vec::new(),
                history: Vec::new(),
                quota: QuotaCounts {
                    donations_used: 0,
                    donations_max: 50,
                    replacements_used: 0,
                    replacements_max: 10,
                },
                partners_have_target: true,
                reject_trades: false,
                proposals: Vec::new(),
                failed_proposals: 0,
                contributions: Vec::new(),
                replacements: 0,
                cancels: 0,
            }),
            on_trade: Mutex::new(None),
        }
    }

    /// Owners 1..=n named `owner<n>`
    pub fn with_owners(self, count: u64) -> Self {
        self.state().owners = (1..=count)
            .map(|id| Owner::new(id, &format!("owner{}", id)))
            .collect();
        self
    }

    /// Our items of `rank`, kinds 1..=n with the given demands
    pub fn with_items(self, rank: &str, demands: &[u32]) -> Self {
        {
            let mut state = self.state();
            for (i, demand) in demands.iter().enumerate() {
                let item_id = i as u64 + 1;
                state.my_items.push(Item::new(item_id, 100 + item_id, rank));
                state.demand.insert(item_id, *demand);
            }
        }
        self
    }

    pub fn with_next_target(self, target: TargetResource) -> Self {
        self.state().next_targets.push_back(target);
        self
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, SiteState> {
        self.state.lock().unwrap()
    }

    /// Called after each accepted proposal with the running total
    pub fn on_trade(&self, hook: impl Fn(usize) + Send + Sync + 'static) {
        *self.on_trade.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn proposals(&self) -> Vec<Proposal> {
        self.state().proposals.clone()
    }

    fn advance_target(state: &mut SiteState) {
        if let Some(next) = state.next_targets.pop_front() {
            state.target = Some(next);
        }
    }
}

#[async_trait]
impl Extractor for MockSite {
    async fn list_owners(&self, _resource_id: u64, page: u32) -> RemoteResult<OwnersPage> {
        let owners = if page == 1 { self.state().owners.clone() } else { Vec::new() };
        Ok(OwnersPage {
            owners,
            has_next: false,
        })
    }

    async fn item_demand(&self, item_id: u64) -> RemoteResult<u32> {
        self.state()
            .demand
            .get(&item_id)
            .copied()
            .ok_or_else(|| RemoteError::NotFound(format!("item {}", item_id)))
    }

    async fn target_resource(&self, _url: &str) -> RemoteResult<Option<TargetResource>> {
        Ok(self.state().target.clone())
    }

    async fn current_target_id(&self, _url: &str) -> RemoteResult<Option<u64>> {
        Ok(self.state().target.as_ref().map(|t| t.resource_id))
    }

    async fn acquisition_available(&self, _url: &str) -> RemoteResult<bool> {
        Ok(self.state().acquisition_open)
    }

    async fn my_inventory(&self, _user_id: u64) -> RemoteResult<Vec<Item>> {
        Ok(self.state().my_items.clone())
    }

    async fn trade_history(&self, _user_id: u64) -> RemoteResult<Vec<TradeHistoryEntry>> {
        Ok(self.state().history.clone())
    }

    async fn quota_counts(&self, _url: &str) -> RemoteResult<QuotaCounts> {
        Ok(self.state().quota)
    }
}

#[async_trait]
impl TradeApi for MockSite {
    async fn partner_items(&self, owner_id: u64, offset: u64) -> RemoteResult<Vec<PartnerItem>> {
        let state = self.state();
        match (&state.target, offset) {
            (Some(target), 0) if state.partners_have_target => Ok(vec![PartnerItem {
                item_id: target.resource_id,
                instance_id: owner_id * 1_000 + target.resource_id,
                locked: false,
                in_trade: false,
            }]),
            _ => Ok(Vec::new()),
        }
    }

    async fn create_trade(
        &self,
        owner_id: u64,
        my_instance_id: u64,
        their_instance_id: u64,
    ) -> RemoteResult<Option<u64>> {
        let total = {
            let mut state = self.state();
            if state.reject_trades {
                state.failed_proposals += 1;
                return Err(RemoteError::Malformed("no redirect to the trade".into()));
            }
            state.proposals.push(Proposal {
                owner_id,
                my_instance_id,
                their_instance_id,
            });
            state.proposals.len()
        };
        if let Some(hook) = self.on_trade.lock().unwrap().as_ref() {
            hook(total);
        }
        Ok(Some(total as u64))
    }

    async fn cancel_all(&self) -> RemoteResult<()> {
        self.state().cancels += 1;
        Ok(())
    }
}

#[async_trait]
impl ClubActions for MockSite {
    async fn contribute(&self, instance_id: u64) -> RemoteResult<()> {
        let mut state = self.state();
        state.contributions.push(instance_id);
        state.quota.donations_used += 1;
        state.acquisition_open = false;
        Self::advance_target(&mut state);
        Ok(())
    }

    async fn replace_target(&self) -> RemoteResult<()> {
        let mut state = self.state();
        if state.quota.replacements_used >= state.quota.replacements_max {
            return Err(RemoteError::QuotaExhausted("no replacements left".into()));
        }
        state.quota.replacements_used += 1;
        state.replacements += 1;
        Self::advance_target(&mut state);
        Ok(())
    }
}

/// Store that keeps everything in memory
#[derive(Default)]
pub struct MemoryStore {
    pub inventory: Mutex<Vec<Item>>,
    pub cache: Mutex<ParsedCache>,
    pub target: Mutex<Option<TargetResource>>,
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn load_inventory(&self) -> anyhow::Result<Vec<Item>> {
        Ok(self.inventory.lock().unwrap().clone())
    }

    async fn save_inventory(&self, items: &[Item]) -> anyhow::Result<()> {
        *self.inventory.lock().unwrap() = items.to_vec();
        Ok(())
    }

    async fn load_parsed_cache(&self) -> anyhow::Result<ParsedCache> {
        Ok(self.cache.lock().unwrap().clone())
    }

    async fn save_parsed_cache(&self, cache: &ParsedCache) -> anyhow::Result<()> {
        *self.cache.lock().unwrap() = cache.clone();
        Ok(())
    }

    async fn save_target(&self, target: &TargetResource) -> anyhow::Result<()> {
        *self.target.lock().unwrap() = Some(target.clone());
        Ok(())
    }
}

pub fn shared_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::default())
}
