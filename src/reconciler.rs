//! Trade history reconciliation
//!
//! The remote side may complete a trade long after we sent it, or reverse a
//! completed one. We diff each history snapshot against the statuses seen
//! before and repair the local inventory accordingly:
//!
//! | previous  | current   | effect                    |
//! |-----------|-----------|---------------------------|
//! | unseen    | completed | remove the items we lost  |
//! | completed | cancelled | restore the removed items |
//! | anything else that differs | | recorded only    |
//!
//! Offers we sent are moved to the observed status as well. A cancelled
//! offer frees its instance; a completed one frees it once it is removed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::RemoteResult;
use crate::inventory::Inventory;
use crate::shutdown::{BackgroundLoop, ErrorBudget};
use crate::site::Extractor;
use crate::trade::OfferBook;
use crate::types::{Item, TradeHistoryEntry, TradeStatus};

/// Inventory changes applied by one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed: usize,
    pub restored: usize,
    pub transitions: usize,
}

impl ReconcileReport {
    pub fn changes(&self) -> usize {
        self.removed + self.restored
    }
}

#[derive(Debug, Default)]
struct ReconcileState {
    statuses: HashMap<u64, TradeStatus>,
    /// Items removed per completed trade, kept so a reversal can restore them
    traded_away: HashMap<u64, Vec<Item>>,
    primed: bool,
}

pub struct TradeReconciler {
    extractor: Arc<dyn Extractor>,
    inventory: Arc<Inventory>,
    user_id: u64,
    offers: Option<OfferBook>,
    state: Mutex<ReconcileState>,
}

impl TradeReconciler {
    pub fn new(extractor: Arc<dyn Extractor>, inventory: Arc<Inventory>, user_id: u64) -> Self {
        Self {
            extractor,
            inventory,
            user_id,
            offers: None,
            state: Mutex::new(ReconcileState::default()),
        }
    }

    /// Settle the coordinator's offers as their trades finish
    pub fn with_offer_book(mut self, offers: OfferBook) -> Self {
        self.offers = Some(offers);
        self
    }

    /// Instances to take first when a completed trade gave away `trade_id`'s kinds
    fn offered_instances(&self, trade_id: u64, status: TradeStatus) -> HashSet<u64> {
        let Some(book) = &self.offers else {
            return HashSet::new();
        };
        match book.settle(trade_id, status) {
            Some(offer) => HashSet::from([offer.my_instance_id]),
            None => book.locked().snapshot(),
        }
    }

    /// Record the current history as the baseline without touching inventory
    pub async fn prime(&self) -> RemoteResult<usize> {
        let history = self.extractor.trade_history(self.user_id).await?;
        let mut state = self.state.lock().await;
        for entry in &history {
            state.statuses.insert(entry.trade_id, entry.status);
        }
        state.primed = true;
        info!("Trade history baseline: {} trades", state.statuses.len());
        Ok(state.statuses.len())
    }

    pub async fn is_primed(&self) -> bool {
        self.state.lock().await.primed
    }

    /// Fetch history and apply it
    pub async fn check(&self) -> RemoteResult<ReconcileReport> {
        let history = self.extractor.trade_history(self.user_id).await?;
        Ok(self.apply(&history).await)
    }

    /// Out-of-schedule check, e.g. right after cancelling trades.
    ///
    /// Returns the number of inventory changes; errors are logged.
    pub async fn force_check(&self) -> usize {
        if !self.is_primed().await {
            if let Err(e) = self.prime().await {
                warn!("Could not read trade history: {}", e);
            }
            return 0;
        }

        match self.check().await {
            Ok(report) => report.changes(),
            Err(e) => {
                warn!("Could not read trade history: {}", e);
                0
            }
        }
    }

    /// Diff `history` against the statuses seen so far
    pub async fn apply(&self, history: &[TradeHistoryEntry]) -> ReconcileReport {
        let mut state = self.state.lock().await;
        let mut report = ReconcileReport::default();

        for entry in history {
            let previous = state.statuses.get(&entry.trade_id).copied();
            match (previous, entry.status) {
                (None, TradeStatus::Completed) => {
                    if !state.traded_away.contains_key(&entry.trade_id) {
                        let prefer = self.offered_instances(entry.trade_id, entry.status);
                        let mut removed = Vec::new();
                        for item_id in &entry.lost_items {
                            match self.inventory.remove_kind(*item_id, &prefer).await {
                                Some(item) => {
                                    info!(
                                        "Trade {} completed, {} left the inventory",
                                        entry.trade_id,
                                        item.label()
                                    );
                                    if let Some(book) = &self.offers {
                                        book.locked().remove(item.instance_id);
                                    }
                                    removed.push(item);
                                }
                                None => debug!(
                                    "Item {} of trade {} not in inventory",
                                    item_id, entry.trade_id
                                ),
                            }
                        }
                        report.removed += removed.len();
                        state.traded_away.insert(entry.trade_id, removed);
                    }
                }
                (Some(TradeStatus::Completed), TradeStatus::Cancelled) => {
                    warn!("Trade {} was reversed after completing", entry.trade_id);
                    self.settle_offer(entry.trade_id, entry.status);
                    if let Some(items) = state.traded_away.remove(&entry.trade_id) {
                        for item in items {
                            let label = item.label();
                            if self.inventory.restore(item).await {
                                info!("Restored {} from reversed trade {}", label, entry.trade_id);
                                report.restored += 1;
                            }
                        }
                    }
                }
                (previous, current) if previous != Some(current) => {
                    debug!("Trade {}: {:?} -> {:?}", entry.trade_id, previous, current);
                    self.settle_offer(entry.trade_id, current);
                }
                _ => continue,
            }

            report.transitions += 1;
            state.statuses.insert(entry.trade_id, entry.status);
        }

        if report.changes() > 0 {
            info!(
                "Reconciled trade history: {} removed, {} restored",
                report.removed, report.restored
            );
        }
        report
    }

    fn settle_offer(&self, trade_id: u64, status: TradeStatus) {
        if let Some(book) = &self.offers {
            book.settle(trade_id, status);
        }
    }

    /// Poll history every `interval` until stopped or the error budget runs out
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        max_consecutive_errors: u32,
    ) -> BackgroundLoop {
        BackgroundLoop::spawn("Trade history monitor", move |stop| async move {
            let mut budget = ErrorBudget::new(max_consecutive_errors);

            if !self.is_primed().await {
                if let Err(e) = self.prime().await {
                    warn!("Initial trade history read failed: {}", e);
                    budget.record_failure();
                }
            }

            let mut checks: u64 = 0;
            while stop.sleep(interval).await {
                checks += 1;
                let result = if self.is_primed().await {
                    self.check().await.map(|report| report.changes())
                } else {
                    self.prime().await.map(|_| 0)
                };

                match result {
                    Ok(changes) => {
                        budget.record_success();
                        debug!("History check #{}: {} changes", checks, changes);
                    }
                    Err(e) => {
                        warn!("History check #{} failed: {}", checks, e);
                        if budget.record_failure() {
                            error!(
                                "Trade history monitor stopping after {} consecutive errors",
                                budget.consecutive()
                            );
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonFileStore;
    use crate::types::TradeOffer;
    use chrono::Utc;

    fn completed(trade_id: u64, lost: &[u64]) -> TradeHistoryEntry {
        TradeHistoryEntry {
            trade_id,
            status: TradeStatus::Completed,
            lost_items: lost.to_vec(),
            gained_items: Vec::new(),
        }
    }

    fn cancelled(trade_id: u64, lost: &[u64]) -> TradeHistoryEntry {
        TradeHistoryEntry {
            status: TradeStatus::Cancelled,
            ..completed(trade_id, lost)
        }
    }

    async fn inventory(items: Vec<Item>) -> (tempfile::TempDir, Arc<Inventory>) {
        let dir = tempfile::tempdir().unwrap();
        let inventory = Arc::new(Inventory::new(Arc::new(JsonFileStore::new(dir.path())), 72));
        inventory.sync(items).await.unwrap();
        (dir, inventory)
    }

    fn reconciler(inventory: Arc<Inventory>) -> TradeReconciler {
        // The extractor is never reached by `apply`
        let extractor: Arc<dyn Extractor> = Arc::new(NoHistory);
        TradeReconciler::new(extractor, inventory, 1)
    }

    struct NoHistory;

    #[async_trait::async_trait]
    impl Extractor for NoHistory {
        async fn list_owners(&self, _: u64, _: u32) -> RemoteResult<crate::site::OwnersPage> {
            Ok(Default::default())
        }
        async fn item_demand(&self, _: u64) -> RemoteResult<u32> {
            Ok(0)
        }
        async fn target_resource(
            &self,
            _: &str,
        ) -> RemoteResult<Option<crate::types::TargetResource>> {
            Ok(None)
        }
        async fn current_target_id(&self, _: &str) -> RemoteResult<Option<u64>> {
            Ok(None)
        }
        async fn acquisition_available(&self, _: &str) -> RemoteResult<bool> {
            Ok(false)
        }
        async fn my_inventory(&self, _: u64) -> RemoteResult<Vec<Item>> {
            Ok(Vec::new())
        }
        async fn trade_history(&self, _: u64) -> RemoteResult<Vec<TradeHistoryEntry>> {
            Ok(Vec::new())
        }
        async fn quota_counts(&self, _: &str) -> RemoteResult<crate::types::QuotaCounts> {
            Err(crate::error::RemoteError::NotFound("quota".into()))
        }
    }

    #[tokio::test]
    async fn test_completed_twice_removes_once() {
        let (_dir, inventory) = inventory(vec![Item::new(5, 50, "a"), Item::new(5, 51, "a")]).await;
        let reconciler = reconciler(inventory.clone());

        let report = reconciler.apply(&[completed(1, &[5])]).await;
        assert_eq!(report.removed, 1);
        let report = reconciler.apply(&[completed(1, &[5])]).await;
        assert_eq!(report.removed, 0);
        assert_eq!(inventory.len(), 1);
    }

    #[tokio::test]
    async fn test_reversal_is_net_zero() {
        let (_dir, inventory) = inventory(vec![Item::new(5, 50, "a"), Item::new(6, 60, "a")]).await;
        let before = inventory.items();
        let reconciler = reconciler(inventory.clone());

        reconciler.apply(&[completed(1, &[5])]).await;
        assert!(!inventory.contains_instance(50));

        let report = reconciler.apply(&[cancelled(1, &[5])]).await;
        assert_eq!(report.restored, 1);

        let mut after = inventory.items();
        after.sort_by_key(|item| item.instance_id);
        assert_eq!(after, before);

        // A second reversal sighting restores nothing
        assert_eq!(reconciler.apply(&[cancelled(1, &[5])]).await.restored, 0);
        assert_eq!(inventory.len(), 2);
    }

    #[tokio::test]
    async fn test_other_transitions_only_recorded() {
        let (_dir, inventory) = inventory(vec![Item::new(5, 50, "a")]).await;
        let reconciler = reconciler(inventory.clone());

        let pending = TradeHistoryEntry {
            status: TradeStatus::Pending,
            ..completed(1, &[5])
        };
        let report = reconciler.apply(&[pending]).await;
        assert_eq!(report, ReconcileReport { removed: 0, restored: 0, transitions: 1 });

        // Pending -> Completed is not the unseen -> Completed edge
        let report = reconciler.apply(&[completed(1, &[5])]).await;
        assert_eq!(report.removed, 0);
        assert_eq!(report.transitions, 1);

        // Cancelled without a prior completion restores nothing
        let report = reconciler.apply(&[cancelled(2, &[5])]).await;
        assert_eq!(report.restored, 0);
        assert_eq!(inventory.len(), 1);
    }

    fn offer(trade_id: u64, my_instance_id: u64) -> TradeOffer {
        TradeOffer {
            offer_id: Some(trade_id),
            owner_id: 9,
            target_item_id: 3,
            my_instance_id,
            status: TradeStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_completion_settles_the_offer_and_removes_its_instance() {
        let items = vec![Item::new(5, 50, "a"), Item::new(5, 51, "a"), Item::new(5, 52, "a")];
        let (_dir, inventory) = inventory(items).await;
        let book = OfferBook::default();
        book.record(offer(1, 51));
        let reconciler = reconciler(inventory.clone()).with_offer_book(book.clone());

        let report = reconciler.apply(&[completed(1, &[5])]).await;
        assert_eq!(report.removed, 1);
        assert!(!inventory.contains_instance(51));
        assert!(book.locked().is_empty());
        assert_eq!(book.pending_count(), 0);
        assert_eq!(book.offers()[0].status, TradeStatus::Completed);

        // Unknown trade: a locked instance of the kind goes first
        book.locked().insert(52);
        reconciler.apply(&[completed(2, &[5])]).await;
        assert!(!inventory.contains_instance(52));
        assert!(inventory.contains_instance(50));
        assert!(book.locked().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_trade_releases_the_offer() {
        let (_dir, inventory) = inventory(vec![Item::new(5, 50, "a")]).await;
        let book = OfferBook::default();
        book.record(offer(1, 50));
        let reconciler = reconciler(inventory.clone()).with_offer_book(book.clone());

        let report = reconciler.apply(&[cancelled(1, &[5])]).await;
        assert_eq!(report.transitions, 1);
        assert!(!book.locked().contains(50));
        assert_eq!(book.offers()[0].status, TradeStatus::Cancelled);
        assert!(inventory.contains_instance(50));
    }

    #[tokio::test]
    async fn test_force_check_primes_first() {
        let (_dir, inventory) = inventory(Vec::new()).await;
        let reconciler = reconciler(inventory);
        assert!(!reconciler.is_primed().await);
        assert_eq!(reconciler.force_check().await, 0);
        assert!(reconciler.is_primed().await);
    }
}
