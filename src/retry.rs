//! Walking the owner listing and trading with each owner
//!
//! Every owner gets up to `max_attempts_per_owner` proposals, each with a
//! different item. Items that failed stay excluded until a trade succeeds
//! or the target changes. A newer target aborts the walk at the next
//! checkpoint.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::blocklist::BlockList;
use crate::config::TradeConfig;
use crate::selection::SelectionEngine;
use crate::shutdown::SharedShutdown;
use crate::signals::TargetWatch;
use crate::site::Extractor;
use crate::trade::TradeCoordinator;
use crate::types::{Owner, TargetResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerOutcome {
    Sent,
    /// Every attempt failed
    Failed,
    /// Nothing left to offer
    NoCandidate,
    /// Target changed or shutdown requested
    Interrupted,
    Blocked,
}

/// Totals of one pass over the owner listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub processed: usize,
    pub sent: usize,
    pub interrupted: bool,
}

#[derive(Debug, Default)]
struct RetryState {
    failed: HashSet<u64>,
    last_send: Option<Instant>,
}

pub struct RetryController {
    extractor: Arc<dyn Extractor>,
    selection: Arc<SelectionEngine>,
    trades: Arc<TradeCoordinator>,
    blocklist: Option<Arc<dyn BlockList>>,
    cfg: TradeConfig,
    shutdown: SharedShutdown,
    state: Mutex<RetryState>,
    rng: Mutex<StdRng>,
}

impl RetryController {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        selection: Arc<SelectionEngine>,
        trades: Arc<TradeCoordinator>,
        cfg: TradeConfig,
        shutdown: SharedShutdown,
    ) -> Self {
        Self {
            extractor,
            selection,
            trades,
            blocklist: None,
            cfg,
            shutdown,
            state: Mutex::new(RetryState::default()),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_blocklist(mut self, blocklist: Arc<dyn BlockList>) -> Self {
        self.blocklist = Some(blocklist);
        self
    }

    fn state(&self) -> MutexGuard<'_, RetryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Forget failed items and send timing, e.g. after a target change
    pub fn reset(&self) {
        *self.state() = RetryState::default();
    }

    pub fn failed_items(&self) -> HashSet<u64> {
        self.state().failed.clone()
    }

    fn interrupted(&self, watch: &TargetWatch) -> bool {
        watch.changed() || self.shutdown.is_shutdown_requested()
    }

    /// Hold back until the minimum spacing since the last sent trade passed
    async fn wait_before_trade(&self) -> bool {
        if self.trades.is_dry_run() {
            return true;
        }
        let last_send = self.state().last_send;
        let Some(last_send) = last_send else {
            return true;
        };
        let due = last_send + self.cfg.min_trade_delay();
        let now = Instant::now();
        if due <= now {
            return true;
        }
        self.shutdown.sleep(due - now).await
    }

    fn jitter(&self) -> Duration {
        let (min, max) = (self.cfg.jitter_min_secs, self.cfg.jitter_max_secs);
        if max <= min {
            return Duration::from_secs_f64(min.max(0.0));
        }
        let secs = self
            .rng
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .gen_range(min..max);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Trade with one owner, retrying with other items on failure
    pub async fn process_owner(
        &self,
        owner: &Owner,
        target: &TargetResource,
        watch: &TargetWatch,
    ) -> OwnerOutcome {
        if self
            .blocklist
            .as_ref()
            .is_some_and(|list| list.is_blocked(owner.owner_id))
        {
            info!("{} is blocked, skipping", owner.display_name);
            return OwnerOutcome::Blocked;
        }

        let max_attempts = self.cfg.max_attempts_per_owner.max(1);
        let mut excluded = self.failed_items();

        for attempt in 1..=max_attempts {
            if self.interrupted(watch) {
                return OwnerOutcome::Interrupted;
            }

            let Some(item) = self
                .selection
                .select_best(&target.rank, target.demand_count, &excluded)
                .await
            else {
                info!(
                    "{}: no item to offer (attempt {}/{})",
                    owner.display_name, attempt, max_attempts
                );
                return OwnerOutcome::NoCandidate;
            };

            info!(
                "{}: offering {} with demand {} (attempt {}/{})",
                owner.display_name,
                item.label(),
                item.demand_count.unwrap_or_default(),
                attempt,
                max_attempts
            );

            if !self.wait_before_trade().await || self.interrupted(watch) {
                return OwnerOutcome::Interrupted;
            }

            if self
                .trades
                .propose_trade(owner.owner_id, item.instance_id, target.resource_id)
                .await
            {
                let live = !self.trades.is_dry_run();
                {
                    let mut state = self.state();
                    state.failed.clear();
                    if live {
                        state.last_send = Some(Instant::now());
                    }
                }
                if live {
                    self.shutdown.sleep(self.jitter()).await;
                }
                return OwnerOutcome::Sent;
            }

            self.state().failed.insert(item.instance_id);
            excluded.insert(item.instance_id);

            if attempt < max_attempts {
                debug!(
                    "Attempt {} with {} failed, trying another item",
                    attempt, owner.display_name
                );
                if !self
                    .shutdown
                    .sleep(Duration::from_secs(self.cfg.failed_attempt_delay_secs))
                    .await
                {
                    return OwnerOutcome::Interrupted;
                }
            }
        }

        warn!("{}: all {} attempts failed", owner.display_name, max_attempts);
        OwnerOutcome::Failed
    }

    /// Walk every listing page of the target's owners
    pub async fn process_all_owners(
        &self,
        target: &TargetResource,
        watch: &TargetWatch,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        let mut page = 1;

        info!(
            "Searching owners of {} (mode: {})",
            target.resource_id,
            if self.trades.is_dry_run() { "dry-run" } else { "live" }
        );

        loop {
            if self.interrupted(watch) {
                report.interrupted = true;
                return report;
            }

            let listing = match self.extractor.list_owners(target.resource_id, page).await {
                Ok(listing) => listing,
                Err(e) => {
                    warn!("Failed to list owners page {}: {}", page, e);
                    break;
                }
            };
            info!("Page {}: {} owners", page, listing.owners.len());

            for owner in &listing.owners {
                if self.interrupted(watch) {
                    report.interrupted = true;
                    return report;
                }
                match self.process_owner(owner, target, watch).await {
                    OwnerOutcome::Interrupted => {
                        report.interrupted = true;
                        return report;
                    }
                    OwnerOutcome::Sent => report.sent += 1,
                    _ => {}
                }
            }
            report.processed += listing.owners.len();

            if !listing.has_next {
                break;
            }
            if self.interrupted(watch)
                || !self
                    .shutdown
                    .sleep(Duration::from_millis(self.cfg.page_delay_ms))
                    .await
            {
                report.interrupted = true;
                return report;
            }
            page += 1;
        }

        info!("Owners processed: {}, trades sent: {}", report.processed, report.sent);
        report
    }
}
