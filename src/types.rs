//! Core records shared by every component

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An owned unit of inventory.
///
/// `instance_id` names the physical unit, `item_id` the logical kind. An item
/// is classified once `demand_count` is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: u64,
    pub instance_id: u64,
    pub rank: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub demand_count: Option<u32>,
    #[serde(default)]
    pub cached_at: Option<DateTime<Utc>>,
}

impl Item {
    pub fn new(item_id: u64, instance_id: u64, rank: &str) -> Self {
        Self {
            item_id,
            instance_id,
            rank: rank.to_uppercase(),
            name: String::new(),
            demand_count: None,
            cached_at: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn classified(mut self, demand_count: u32, cached_at: DateTime<Utc>) -> Self {
        self.demand_count = Some(demand_count);
        self.cached_at = Some(cached_at);
        self
    }

    pub fn is_classified(&self) -> bool {
        self.demand_count.is_some()
    }

    /// Short label for log lines
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("item {} (#{})", self.item_id, self.instance_id)
        } else {
            format!("{} (#{})", self.name, self.instance_id)
        }
    }
}

/// Trade counterparty, discovered per page and never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub owner_id: u64,
    pub display_name: String,
}

impl Owner {
    pub fn new(owner_id: u64, display_name: &str) -> Self {
        Self {
            owner_id,
            display_name: display_name.to_string(),
        }
    }
}

/// Trade offer states; `Completed` and `Cancelled` are terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Pending,
    Completed,
    Cancelled,
}

impl TradeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeStatus::Pending)
    }
}

/// A trade offer we sent
#[derive(Debug, Clone, PartialEq)]
pub struct TradeOffer {
    /// Remote id when the create response carried one
    pub offer_id: Option<u64>,
    pub owner_id: u64,
    pub target_item_id: u64,
    pub my_instance_id: u64,
    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
}

/// One row of the remote trade history
#[derive(Debug, Clone, PartialEq)]
pub struct TradeHistoryEntry {
    pub trade_id: u64,
    pub status: TradeStatus,
    /// Item kinds that left our inventory in this trade
    pub lost_items: Vec<u64>,
    /// Item kinds we received
    pub gained_items: Vec<u64>,
}

/// Used/maximum counters as read from the remote page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCounts {
    pub donations_used: u32,
    pub donations_max: u32,
    pub replacements_used: u32,
    pub replacements_max: u32,
}

/// Daily quota state plus the locally computed countdown to the next reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub donations_used: u32,
    pub donations_max: u32,
    pub replacements_used: u32,
    pub replacements_max: u32,
    pub seconds_until_reset: i64,
}

impl QuotaSnapshot {
    pub fn from_counts(counts: QuotaCounts, seconds_until_reset: i64) -> Self {
        Self {
            donations_used: counts.donations_used,
            donations_max: counts.donations_max,
            replacements_used: counts.replacements_used,
            replacements_max: counts.replacements_max,
            seconds_until_reset,
        }
    }

    pub fn donations_left(&self) -> u32 {
        self.donations_max.saturating_sub(self.donations_used)
    }

    pub fn replacements_left(&self) -> u32 {
        self.replacements_max.saturating_sub(self.replacements_used)
    }

    /// "5h 12m" style countdown
    pub fn reset_in_display(&self) -> String {
        let secs = self.seconds_until_reset.max(0);
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Club member who already holds the target resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClubMember {
    pub user_id: u64,
    pub username: String,
}

/// The resource the club currently wants ("boost card")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetResource {
    pub resource_id: u64,
    pub instance_id: u64,
    pub rank: String,
    pub name: String,
    pub demand_count: u32,
    pub owner_count: u32,
    pub needs_replacement: bool,
    #[serde(default)]
    pub members: Vec<ClubMember>,
}

impl TargetResource {
    /// Build a target and derive `needs_replacement` from the owner count.
    ///
    /// A replacement is needed iff `0 < owner_count <= replacement_threshold`.
    pub fn new(
        resource_id: u64,
        instance_id: u64,
        rank: &str,
        demand_count: u32,
        owner_count: u32,
        replacement_threshold: u32,
    ) -> Self {
        Self {
            resource_id,
            instance_id,
            rank: rank.to_uppercase(),
            name: String::new(),
            demand_count,
            owner_count,
            needs_replacement: owner_count > 0 && owner_count <= replacement_threshold,
            members: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_members(mut self, members: Vec<ClubMember>) -> Self {
        self.members = members;
        self
    }
}

/// Demand lookup result cached per item kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandEntry {
    pub demand_count: u32,
    pub cached_at: DateTime<Utc>,
}

/// Persistent demand cache keyed by item kind
pub type ParsedCache = HashMap<u64, DemandEntry>;
