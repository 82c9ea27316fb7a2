//! Contracts of the remote-site collaborators
//!
//! The automation core only talks to the site through these traits. The
//! HTTP implementation lives in `http_site`; tests plug in in-memory ones.

use async_trait::async_trait;

use crate::error::RemoteResult;
use crate::types::{Item, Owner, QuotaCounts, TargetResource, TradeHistoryEntry};

/// One page of a resource's owner listing, already filtered to tradeable owners
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OwnersPage {
    pub owners: Vec<Owner>,
    pub has_next: bool,
}

/// One unit in a partner's tradeable inventory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerItem {
    pub item_id: u64,
    pub instance_id: u64,
    /// Locked by its owner
    pub locked: bool,
    /// Already offered in another trade
    pub in_trade: bool,
}

impl PartnerItem {
    pub fn is_available(&self) -> bool {
        !self.locked && !self.in_trade
    }
}

/// Read side of the site: listings, lookups and page signals
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Owners of `resource_id` on listing page `page` (1-based)
    async fn list_owners(&self, resource_id: u64, page: u32) -> RemoteResult<OwnersPage>;

    /// How many users want `item_id`
    async fn item_demand(&self, item_id: u64) -> RemoteResult<u32>;

    /// Full description of the resource the club page currently asks for
    async fn target_resource(&self, url: &str) -> RemoteResult<Option<TargetResource>>;

    /// Cheap check: only the id of the current target
    async fn current_target_id(&self, url: &str) -> RemoteResult<Option<u64>>;

    /// Whether the club page currently accepts a contribution
    async fn acquisition_available(&self, url: &str) -> RemoteResult<bool>;

    /// Our whole inventory, flattened across pages
    async fn my_inventory(&self, user_id: u64) -> RemoteResult<Vec<Item>>;

    /// Most recent trades of `user_id` with their statuses
    async fn trade_history(&self, user_id: u64) -> RemoteResult<Vec<TradeHistoryEntry>>;

    /// Daily quota counters shown on the club page
    async fn quota_counts(&self, url: &str) -> RemoteResult<QuotaCounts>;
}

/// Trade endpoints
#[async_trait]
pub trait TradeApi: Send + Sync {
    /// One id range of a partner's inventory, starting at `offset`
    async fn partner_items(&self, owner_id: u64, offset: u64) -> RemoteResult<Vec<PartnerItem>>;

    /// Propose `my_instance_id` for `their_instance_id`.
    ///
    /// `Ok` only on a confirmed success, carrying the remote offer id when
    /// the response exposed one. An item already in a trade maps to
    /// `RemoteError::Conflict`.
    async fn create_trade(
        &self,
        owner_id: u64,
        my_instance_id: u64,
        their_instance_id: u64,
    ) -> RemoteResult<Option<u64>>;

    /// Withdraw every trade we sent
    async fn cancel_all(&self) -> RemoteResult<()>;
}

/// Club mutations
#[async_trait]
pub trait ClubActions: Send + Sync {
    /// Hand `instance_id` over to the club
    async fn contribute(&self, instance_id: u64) -> RemoteResult<()>;

    /// Ask the club to pick a different target
    async fn replace_target(&self) -> RemoteResult<()>;
}
