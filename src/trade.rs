//! Trade proposal, locking and cancellation

use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::TradeConfig;
use crate::error::{RemoteError, RemoteResult};
use crate::reconciler::TradeReconciler;
use crate::site::{PartnerItem, TradeApi};
use crate::types::{TradeOffer, TradeStatus};

/// Instances of ours that sit in an outstanding offer.
///
/// Cheap to clone; every clone sees the same set. Only the coordinator
/// mutates it, everyone else reads it for filtering.
#[derive(Debug, Clone, Default)]
pub struct LockedItems(Arc<Mutex<HashSet<u64>>>);

impl LockedItems {
    fn lock(&self) -> MutexGuard<'_, HashSet<u64>> {
        self.0.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn contains(&self, instance_id: u64) -> bool {
        self.lock().contains(&instance_id)
    }

    pub fn snapshot(&self) -> HashSet<u64> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn insert(&self, instance_id: u64) -> bool {
        self.lock().insert(instance_id)
    }

    pub(crate) fn remove(&self, instance_id: u64) -> bool {
        self.lock().remove(&instance_id)
    }

    pub(crate) fn clear(&self) -> usize {
        let mut set = self.lock();
        let count = set.len();
        set.clear();
        count
    }
}

/// Offers sent since the last cancel, together with the instances they lock.
///
/// Shared between the coordinator, which records offers, and the
/// reconciler, which moves them to their final status.
#[derive(Debug, Clone, Default)]
pub struct OfferBook {
    offers: Arc<Mutex<Vec<TradeOffer>>>,
    locked: LockedItems,
}

impl OfferBook {
    fn lock(&self) -> MutexGuard<'_, Vec<TradeOffer>> {
        self.offers.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn locked(&self) -> LockedItems {
        self.locked.clone()
    }

    pub fn offers(&self) -> Vec<TradeOffer> {
        self.lock().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .iter()
            .filter(|offer| offer.status == TradeStatus::Pending)
            .count()
    }

    pub(crate) fn record(&self, offer: TradeOffer) {
        self.locked.insert(offer.my_instance_id);
        self.lock().push(offer);
    }

    /// Move the offer created as trade `offer_id` to `status`.
    ///
    /// A cancelled trade releases the offered instance; a completed one keeps
    /// it locked until it leaves the inventory. Returns the offer as it was
    /// before the update, `None` for trades we did not send.
    pub fn settle(&self, offer_id: u64, status: TradeStatus) -> Option<TradeOffer> {
        let previous = {
            let mut offers = self.lock();
            let offer = offers.iter_mut().find(|offer| offer.offer_id == Some(offer_id))?;
            let previous = offer.clone();
            offer.status = status;
            previous
        };
        if status == TradeStatus::Cancelled && self.locked.remove(previous.my_instance_id) {
            debug!(
                "Trade {} is {:?}, #{} released",
                offer_id, status, previous.my_instance_id
            );
        }
        Some(previous)
    }

    /// Mark every pending offer cancelled and release all locks
    fn cancel_pending(&self) -> usize {
        for offer in self
            .lock()
            .iter_mut()
            .filter(|offer| offer.status == TradeStatus::Pending)
        {
            offer.status = TradeStatus::Cancelled;
        }
        self.locked.clear()
    }

    /// Forget offers that reached a final status
    fn prune(&self) -> usize {
        let mut offers = self.lock();
        let before = offers.len();
        offers.retain(|offer| !offer.status.is_terminal());
        before - offers.len()
    }
}

#[derive(Debug, Default)]
struct TradeState {
    /// (owner, their item kind) pairs proposed since the last cancel
    sent: HashSet<(u64, u64)>,
    /// Partner instances that answered "already in a trade"
    conflicted: HashSet<u64>,
}

pub struct TradeCoordinator {
    api: Arc<dyn TradeApi>,
    cfg: TradeConfig,
    dry_run: bool,
    book: OfferBook,
    state: Mutex<TradeState>,
    reconciler: Option<Arc<TradeReconciler>>,
}

impl TradeCoordinator {
    pub fn new(api: Arc<dyn TradeApi>, cfg: TradeConfig, dry_run: bool) -> Self {
        Self {
            api,
            cfg,
            dry_run,
            book: OfferBook::default(),
            state: Mutex::new(TradeState::default()),
            reconciler: None,
        }
    }

    /// Record offers in a book shared with the reconciler
    pub fn with_offer_book(mut self, book: OfferBook) -> Self {
        self.book = book;
        self
    }

    /// History check run right after a successful cancel
    pub fn with_reconciler(mut self, reconciler: Arc<TradeReconciler>) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    fn state(&self) -> MutexGuard<'_, TradeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn locked(&self) -> LockedItems {
        self.book.locked()
    }

    pub fn offer_book(&self) -> &OfferBook {
        &self.book
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn has_sent(&self, owner_id: u64, item_id: u64) -> bool {
        self.state().sent.contains(&(owner_id, item_id))
    }

    pub fn sent_count(&self) -> usize {
        self.state().sent.len()
    }

    pub fn offers(&self) -> Vec<TradeOffer> {
        self.book.offers()
    }

    pub fn pending_count(&self) -> usize {
        self.book.pending_count()
    }

    /// Offer `my_instance_id` to `owner_id` for one of their `their_item_id`.
    ///
    /// True only when the trade was confirmed created (or would have been,
    /// in dry-run). Remote failures are logged and reported as false.
    pub async fn propose_trade(
        &self,
        owner_id: u64,
        my_instance_id: u64,
        their_item_id: u64,
    ) -> bool {
        if self.book.locked.contains(my_instance_id) {
            warn!("Instance {} is already offered, not reusing it", my_instance_id);
            return false;
        }
        if self.has_sent(owner_id, their_item_id) {
            info!("Trade for item {} already sent to owner {}", their_item_id, owner_id);
            return false;
        }

        if self.dry_run {
            info!(
                "[dry-run] Would offer #{} to owner {} for item {}",
                my_instance_id, owner_id, their_item_id
            );
            return true;
        }

        let Some(their_instance_id) = self
            .find_partner_instance(owner_id, their_item_id)
            .await
        else {
            return false;
        };

        match self
            .api
            .create_trade(owner_id, my_instance_id, their_instance_id)
            .await
        {
            Ok(offer_id) => {
                self.state().sent.insert((owner_id, their_item_id));
                self.book.record(TradeOffer {
                    offer_id,
                    owner_id,
                    target_item_id: their_item_id,
                    my_instance_id,
                    status: TradeStatus::Pending,
                    created_at: Utc::now(),
                });
                info!(
                    "Trade sent to owner {}: #{} for #{} ({} locked)",
                    owner_id,
                    my_instance_id,
                    their_instance_id,
                    self.book.locked.len()
                );
                true
            }
            Err(RemoteError::Conflict(reason)) => {
                warn!("Trade with owner {} rejected: {}", owner_id, reason);
                self.state().conflicted.insert(their_instance_id);
                false
            }
            Err(RemoteError::Throttled) => {
                warn!("Throttled while creating trade with owner {}", owner_id);
                false
            }
            Err(e) => {
                warn!("Failed to create trade with owner {}: {}", owner_id, e);
                false
            }
        }
    }

    /// One batch with timeout retries
    async fn fetch_batch(&self, owner_id: u64, offset: u64) -> RemoteResult<Vec<PartnerItem>> {
        let retries = self.cfg.batch_timeout_retries.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.api.partner_items(owner_id, offset).await {
                Err(e) if e.is_transient() && attempt < retries => {
                    debug!(
                        "Batch at offset {} failed ({}), retry {}/{}",
                        offset, e, attempt, retries
                    );
                    tokio::time::sleep(Duration::from_secs(self.cfg.batch_retry_delay_secs)).await;
                }
                result => return result,
            }
        }
    }

    /// Scan the partner's inventory range by range for a free instance of
    /// `item_id`
    pub async fn find_partner_instance(&self, owner_id: u64, item_id: u64) -> Option<u64> {
        let mut offset = 0;
        let mut batch = 0;
        let mut throttled = 0;

        while batch < self.cfg.max_batches {
            match self.fetch_batch(owner_id, offset).await {
                Err(RemoteError::Throttled) => {
                    throttled += 1;
                    if throttled > self.cfg.max_throttle_retries {
                        warn!(
                            "Giving up on owner {} after {} throttled batches",
                            owner_id, throttled
                        );
                        return None;
                    }
                    debug!("Batch at offset {} throttled, retrying", offset);
                    continue;
                }
                Err(e) => {
                    debug!("Skipping batch at offset {}: {}", offset, e);
                }
                Ok(items) if items.is_empty() => {
                    if batch + 1 >= self.cfg.min_batches {
                        debug!(
                            "Empty batch at offset {}, stopping after {} batches",
                            offset,
                            batch + 1
                        );
                        break;
                    }
                }
                Ok(items) => {
                    let conflicted = self.state().conflicted.clone();
                    for item in items.iter().filter(|item| item.item_id == item_id) {
                        if !item.is_available() || conflicted.contains(&item.instance_id) {
                            debug!(
                                "Instance {} of item {} unavailable (locked={}, in_trade={})",
                                item.instance_id, item_id, item.locked, item.in_trade
                            );
                            continue;
                        }
                        debug!(
                            "Found instance {} of item {} at offset {}",
                            item.instance_id, item_id, offset
                        );
                        return Some(item.instance_id);
                    }
                }
            }

            offset += self.cfg.batch_size;
            batch += 1;
            tokio::time::sleep(Duration::from_millis(self.cfg.batch_delay_ms)).await;
        }

        info!(
            "Owner {} has no free instance of item {} ({} batches checked)",
            owner_id, item_id, batch
        );
        None
    }

    /// Withdraw every outstanding offer and release all locks
    pub async fn cancel_all(&self) -> bool {
        if !self.dry_run {
            if let Err(e) = self.api.cancel_all().await {
                warn!("Failed to cancel trades: {}", e);
                return false;
            }
        }

        let released = self.book.cancel_pending();
        let cancelled = {
            let mut state = self.state();
            let sent = state.sent.len();
            state.sent.clear();
            state.conflicted.clear();
            sent
        };
        info!("Cancelled {} trades, released {} items", cancelled, released);

        if !self.dry_run {
            tokio::time::sleep(Duration::from_secs(self.cfg.cancel_settle_secs)).await;
            if let Some(reconciler) = &self.reconciler {
                let changed = reconciler.force_check().await;
                if changed > 0 {
                    info!("History check after cancel applied {} changes", changed);
                }
            }
        }

        // Offers sent while settling are still pending and kept
        let pruned = self.book.prune();
        debug!("Dropped {} finished offers", pruned);
        true
    }
}
