//! Club page watcher
//!
//! Each tick first does the cheap target-id check, then looks for an open
//! contribution slot. A confirmed change of target is published on the
//! target channel, which is all the foreground loop ever sees of this task.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::RemoteResult;
use crate::notifier::{self, Notifier};
use crate::quota::QuotaTracker;
use crate::shutdown::{BackgroundLoop, ErrorBudget};
use crate::signals::TargetPublisher;
use crate::site::{ClubActions, Extractor};
use crate::store::InventoryStore;
use crate::trade::TradeCoordinator;
use crate::types::TargetResource;

/// Publishes a new target and fans it out to the notifier and the store
pub struct TargetAnnouncer {
    publisher: TargetPublisher,
    notifier: Option<Arc<dyn Notifier>>,
    store: Arc<dyn InventoryStore>,
    page_url: String,
}

impl TargetAnnouncer {
    pub fn new(publisher: TargetPublisher, store: Arc<dyn InventoryStore>, page_url: &str) -> Self {
        Self {
            publisher,
            notifier: None,
            store,
            page_url: page_url.to_string(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn current_id(&self) -> Option<u64> {
        self.publisher.current_id()
    }

    pub fn publisher(&self) -> &TargetPublisher {
        &self.publisher
    }

    /// Returns false if `target` is the target already published
    pub async fn announce(&self, target: TargetResource) -> bool {
        if !self.publisher.publish(target.clone()) {
            return false;
        }

        info!(
            "New target: {} (id {}, rank {}, {} owners, wanted by {})",
            if target.name.is_empty() { "?" } else { &target.name },
            target.resource_id,
            target.rank,
            target.owner_count,
            target.demand_count
        );
        if !target.members.is_empty() {
            let names: Vec<&str> = target.members.iter().map(|m| m.username.as_str()).collect();
            info!("Club members holding it: {}", names.join(", "));
        }

        if let Some(notifier) = &self.notifier {
            notifier::dispatch(notifier.clone(), target.clone(), self.page_url.clone());
        }
        if let Err(e) = self.store.save_target(&target).await {
            warn!("Failed to save target: {}", e);
        }
        true
    }
}

/// What one monitor tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    Idle,
    TargetChanged,
    /// Contribution attempted; `true` when it went through
    Contributed(bool),
    QuotaExhausted,
}

pub struct AcquisitionMonitor {
    extractor: Arc<dyn Extractor>,
    club: Arc<dyn ClubActions>,
    trades: Arc<TradeCoordinator>,
    quota: Arc<QuotaTracker>,
    announcer: Arc<TargetAnnouncer>,
    page_url: String,
    cfg: MonitorConfig,
    dry_run: bool,
}

impl AcquisitionMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        extractor: Arc<dyn Extractor>,
        club: Arc<dyn ClubActions>,
        trades: Arc<TradeCoordinator>,
        quota: Arc<QuotaTracker>,
        announcer: Arc<TargetAnnouncer>,
        page_url: &str,
        cfg: MonitorConfig,
        dry_run: bool,
    ) -> Self {
        Self {
            extractor,
            club,
            trades,
            quota,
            announcer,
            page_url: page_url.to_string(),
            cfg,
            dry_run,
        }
    }

    async fn cancel_trades(&self) {
        if self.trades.cancel_all().await {
            info!("All sent trades cancelled");
        } else {
            warn!("Could not cancel trades (maybe there were none)");
        }
    }

    /// One tick
    pub async fn check_once(&self) -> RemoteResult<MonitorEvent> {
        let current = self.extractor.current_target_id(&self.page_url).await?;
        if let (Some(new_id), Some(known_id)) = (current, self.announcer.current_id()) {
            if new_id != known_id {
                info!("Target changed on the club page: {} -> {}", known_id, new_id);
                return Ok(if self.handle_target_change().await {
                    MonitorEvent::TargetChanged
                } else {
                    MonitorEvent::Idle
                });
            }
        }

        if !self.extractor.acquisition_available(&self.page_url).await? {
            return Ok(MonitorEvent::Idle);
        }

        info!("Contribution slot is open");
        if !self.quota.can_donate(true).await {
            warn!("Contribution possible but the daily donation quota is used up");
            self.quota.log_stats(false).await;
            return Ok(MonitorEvent::QuotaExhausted);
        }
        Ok(MonitorEvent::Contributed(self.contribute().await))
    }

    /// Target moved without our contribution
    async fn handle_target_change(&self) -> bool {
        self.cancel_trades().await;
        tokio::time::sleep(Duration::from_secs(self.cfg.contribute_settle_secs)).await;

        match self.extractor.target_resource(&self.page_url).await {
            Ok(Some(target)) => self.announcer.announce(target).await,
            Ok(None) => {
                warn!("Could not read the new target");
                false
            }
            Err(e) => {
                warn!("Could not read the new target: {}", e);
                false
            }
        }
    }

    /// Free our items, contribute the target, then confirm the page moved on
    pub async fn contribute(&self) -> bool {
        info!("Cancelling trades before contributing");
        self.cancel_trades().await;
        tokio::time::sleep(Duration::from_secs(self.cfg.contribute_settle_secs)).await;

        if !self.quota.can_donate(true).await {
            warn!("Daily donation quota reached");
            self.quota.log_stats(false).await;
            return false;
        }

        let target = match self.extractor.target_resource(&self.page_url).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!("No target on the club page");
                return false;
            }
            Err(e) => {
                warn!("Failed to read target before contributing: {}", e);
                return false;
            }
        };
        if target.instance_id == 0 {
            warn!("Target {} has no instance to contribute", target.resource_id);
            return false;
        }

        if self.dry_run {
            info!(
                "[dry-run] Would contribute instance {} of {}",
                target.instance_id, target.resource_id
            );
            return false;
        }

        if let Err(e) = self.club.contribute(target.instance_id).await {
            warn!("Contribution failed: {}", e);
            return false;
        }
        info!("Contributed instance {} of {}", target.instance_id, target.resource_id);

        tokio::time::sleep(Duration::from_secs(self.cfg.confirm_wait_secs)).await;

        match self.extractor.target_resource(&self.page_url).await {
            Ok(Some(next)) if next.resource_id != target.resource_id => {
                info!("Target moved on: {} -> {}", target.resource_id, next.resource_id);
                // Offers still ask for the old target
                self.cancel_trades().await;
                self.announcer.announce(next).await;
            }
            Ok(Some(_)) => {
                warn!("Target unchanged after contributing ({})", target.resource_id);
            }
            Ok(None) => warn!("Could not read the target after contributing"),
            Err(e) => warn!("Could not read the target after contributing: {}", e),
        }

        self.quota.log_stats(true).await;
        true
    }

    /// Poll the club page until stopped or too many ticks fail in a row
    pub fn spawn(self: Arc<Self>) -> BackgroundLoop {
        let interval = Duration::from_secs(self.cfg.acquisition_interval_secs);
        BackgroundLoop::spawn("Acquisition monitor", move |stop| async move {
            info!("Watching {} every {:?}", self.page_url, interval);
            let mut budget = ErrorBudget::new(self.cfg.max_consecutive_errors);
            let mut checks: u64 = 0;

            loop {
                checks += 1;
                match self.check_once().await {
                    Ok(event) => {
                        budget.record_success();
                        if event == MonitorEvent::Idle
                            && (checks == 1 || checks % self.cfg.status_every_checks.max(1) == 0)
                        {
                            debug!("Check #{}: nothing to do", checks);
                        }
                    }
                    Err(e) => {
                        warn!("Monitor check #{} failed: {}", checks, e);
                        if budget.record_failure() {
                            error!(
                                "Acquisition monitor stopping after {} consecutive errors",
                                budget.consecutive()
                            );
                            break;
                        }
                    }
                }

                if !stop.sleep(interval).await {
                    break;
                }
            }
        })
    }
}
