//! Boost Runner - foreground orchestration loop
//!
//! Wires the site collaborators into the trading components, starts the
//! background monitors and then repeats full owner sweeps for the current
//! target until shutdown. Between sweeps it handles quota exhaustion (wait
//! mode), replacement requests and the failed-cycle counter.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::blocklist::{BlockList, FileBlockList};
use crate::config::{RunnerConfig, Settings};
use crate::http_site::HttpSite;
use crate::inventory::Inventory;
use crate::monitor::{AcquisitionMonitor, TargetAnnouncer};
use crate::notifier::{Notifier, TelegramNotifier};
use crate::quota::{PageQuotaSource, QuotaTracker};
use crate::rate_limit::RateLimiter;
use crate::reconciler::TradeReconciler;
use crate::replacement::ReplacementManager;
use crate::retry::RetryController;
use crate::selection::SelectionEngine;
use crate::shutdown::{BackgroundLoop, SharedShutdown};
use crate::signals::{self, ReplaceRequest, ReplaceRequester, TargetWatch};
use crate::site::{ClubActions, Extractor, TradeApi};
use crate::store::{InventoryStore, JsonFileStore};
use crate::trade::{OfferBook, TradeCoordinator};
use crate::transport::{LimitedTransport, ReqwestTransport};
use crate::types::TargetResource;

/// What a finished run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Full owner sweeps started
    pub cycles: u32,
    pub trades_sent: usize,
    pub replacements: u32,
}

/// Main runner that owns the collaborators until `run` wires them up
pub struct BoostRunner {
    settings: Settings,
    extractor: Arc<dyn Extractor>,
    trade_api: Arc<dyn TradeApi>,
    club: Arc<dyn ClubActions>,
    store: Arc<dyn InventoryStore>,
    notifier: Option<Arc<dyn Notifier>>,
    shutdown: SharedShutdown,
    replace_requester: ReplaceRequester,
    replace_rx: mpsc::UnboundedReceiver<ReplaceRequest>,
}

impl BoostRunner {
    /// Runner over any site implementation
    pub fn new<S>(
        settings: Settings,
        site: Arc<S>,
        store: Arc<dyn InventoryStore>,
        shutdown: SharedShutdown,
    ) -> Self
    where
        S: Extractor + TradeApi + ClubActions + 'static,
    {
        let (replace_requester, replace_rx) = signals::replace_channel();
        Self {
            settings,
            extractor: site.clone(),
            trade_api: site.clone(),
            club: site,
            store,
            notifier: None,
            shutdown,
            replace_requester,
            replace_rx,
        }
    }

    /// Runner talking to the real site over HTTP, persisting under the output dir
    pub async fn connect(settings: Settings, shutdown: SharedShutdown) -> anyhow::Result<Self> {
        let limiter = Arc::new(RateLimiter::from_config(&settings.rate_limit));
        let transport = LimitedTransport::new(
            ReqwestTransport::new(&settings.session)?,
            limiter,
            settings.session.max_retries,
            Duration::from_secs(settings.session.retry_delay_secs),
        );
        let site = Arc::new(HttpSite::new(Arc::new(transport), &settings)?);

        let store = JsonFileStore::new(&settings.runner.output_dir);
        store.init().await?;
        info!("Output directory: {}", store.dir().display());

        let notifier = TelegramNotifier::from_config(&settings.notifier)?;
        let mut runner = Self::new(settings, site, Arc::new(store), shutdown);
        if let Some(notifier) = notifier {
            info!("Telegram notifications enabled");
            runner = runner.with_notifier(Arc::new(notifier));
        }
        Ok(runner)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Handle for asking the running loop to replace the target
    pub fn replace_requester(&self) -> ReplaceRequester {
        self.replace_requester.clone()
    }

    /// Load inventory, read the target and sweep owners until shutdown.
    ///
    /// Without the acquisition monitor the run ends after the first sweep
    /// that reached any owner.
    pub async fn run(self) -> anyhow::Result<RunSummary> {
        let Self {
            settings,
            extractor,
            trade_api,
            club,
            store,
            notifier,
            shutdown,
            replace_requester: _,
            replace_rx,
        } = self;
        let runner_cfg = settings.runner.clone();
        let page_url = runner_cfg.target_url.clone();

        info!(
            "Boost runner starting (user {}, {})",
            runner_cfg.user_id,
            if runner_cfg.dry_run { "dry-run" } else { "live" }
        );

        let inventory =
            Arc::new(Inventory::load(store.clone(), settings.selection.cache_ttl_hours).await?);
        if runner_cfg.skip_inventory {
            info!("Skipping inventory download, {} items on disk", inventory.len());
        } else {
            match extractor.my_inventory(runner_cfg.user_id).await {
                Ok(fresh) => {
                    let report = inventory.sync(fresh).await?;
                    info!(
                        "Inventory synced: {} items ({} classified, {} gone)",
                        report.total, report.classified, report.gone
                    );
                }
                Err(e) => warn!("Failed to download inventory, using the stored one: {}", e),
            }
        }

        let target = match extractor.target_resource(&page_url).await {
            Ok(Some(target)) => target,
            Ok(None) => anyhow::bail!("No target resource on {}", page_url),
            Err(e) => anyhow::bail!("Failed to read the target resource from {}: {}", page_url, e),
        };

        let offers = OfferBook::default();
        let reconciler = Arc::new(
            TradeReconciler::new(extractor.clone(), inventory.clone(), runner_cfg.user_id)
                .with_offer_book(offers.clone()),
        );
        let trades = Arc::new(
            TradeCoordinator::new(trade_api, settings.trade, runner_cfg.dry_run)
                .with_offer_book(offers)
                .with_reconciler(reconciler.clone()),
        );
        let selection = Arc::new(SelectionEngine::new(
            inventory.clone(),
            extractor.clone(),
            trades.locked(),
            settings.selection,
        ));
        let quota = Arc::new(QuotaTracker::new(
            Arc::new(PageQuotaSource::new(extractor.clone(), &page_url)),
            &settings.quota,
        ));

        let (publisher, mut watch) = signals::target_channel(None);
        let mut announcer = TargetAnnouncer::new(publisher, store.clone(), &page_url);
        if let Some(notifier) = notifier {
            announcer = announcer.with_notifier(notifier);
        }
        let announcer = Arc::new(announcer);
        announcer.announce(target.clone()).await;
        watch.acknowledge();
        quota.log_stats(true).await;

        let monitor_cfg = settings.monitor;
        let mut loops = Vec::new();
        if !runner_cfg.skip_inventory {
            loops.push(reconciler.clone().spawn(
                Duration::from_secs(monitor_cfg.reconciliation_interval_secs),
                monitor_cfg.max_consecutive_errors,
            ));
        }

        let mut retry = RetryController::new(
            extractor.clone(),
            selection,
            trades.clone(),
            settings.trade,
            shutdown.clone(),
        );
        if let Some(path) = &settings.blocklist_file {
            let blocklist = Arc::new(FileBlockList::new(path)?);
            if let Err(e) = blocklist.refresh().await {
                warn!("Failed to load block list {}: {}", path.display(), e);
            }
            info!("Block list {}: {} owners", path.display(), blocklist.len());
            loops.push(
                blocklist
                    .clone()
                    .spawn_refresh(Duration::from_secs(monitor_cfg.blocklist_refresh_secs)),
            );
            retry = retry.with_blocklist(blocklist as Arc<dyn BlockList>);
        }

        let monitor = if runner_cfg.enable_monitor {
            let monitor = Arc::new(AcquisitionMonitor::new(
                extractor.clone(),
                club.clone(),
                trades.clone(),
                quota.clone(),
                announcer.clone(),
                &page_url,
                monitor_cfg,
                runner_cfg.dry_run,
            ));
            Some(monitor.spawn())
        } else {
            None
        };

        let replacement = ReplacementManager::new(
            extractor,
            club,
            trades.clone(),
            quota.clone(),
            announcer,
            &page_url,
            Duration::from_secs(monitor_cfg.contribute_settle_secs),
            Duration::from_secs(monitor_cfg.confirm_wait_secs),
            runner_cfg.dry_run,
        );

        let mut cycle = CycleLoop {
            cfg: runner_cfg,
            trades,
            quota,
            retry,
            replacement,
            watch,
            replace_rx,
            shutdown,
            monitor,
            failed_cycles: 0,
            summary: RunSummary::default(),
        };
        let summary = cycle.run(target).await;

        let stop_timeout = Duration::from_secs(monitor_cfg.stop_timeout_secs);
        if let Some(mut monitor) = cycle.monitor.take() {
            monitor.stop(stop_timeout).await;
        }
        for mut bg in loops {
            bg.stop(stop_timeout).await;
        }

        info!(
            "Boost runner finished: {} cycles, {} trades sent, {} replacements",
            summary.cycles, summary.trades_sent, summary.replacements
        );
        Ok(summary)
    }
}

enum WaitOutcome {
    Changed,
    TimedOut,
    Shutdown,
}

/// The wired components driving the foreground loop
struct CycleLoop {
    cfg: RunnerConfig,
    trades: Arc<TradeCoordinator>,
    quota: Arc<QuotaTracker>,
    retry: RetryController,
    replacement: ReplacementManager,
    watch: TargetWatch,
    replace_rx: mpsc::UnboundedReceiver<ReplaceRequest>,
    shutdown: SharedShutdown,
    monitor: Option<BackgroundLoop>,
    failed_cycles: u32,
    summary: RunSummary,
}

impl CycleLoop {
    fn monitor_running(&self) -> bool {
        self.monitor.as_ref().is_some_and(|m| m.is_running())
    }

    /// Switch to the newest published target and start over with it
    fn adopt_latest(&mut self, target: &mut TargetResource) {
        if let Some(latest) = self.watch.acknowledge() {
            if latest.resource_id != target.resource_id {
                info!("Switching to target {} ({} owners)", latest.resource_id, latest.owner_count);
            }
            *target = latest;
        }
        self.retry.reset();
        self.failed_cycles = 0;
    }

    async fn replace(&mut self, target: &mut TargetResource, reason: &str) -> bool {
        if self.replacement.force_replace(target, reason).await.is_none() {
            return false;
        }
        self.summary.replacements += 1;
        self.adopt_latest(target);
        info!("Replacement done, failed cycle counter reset");
        true
    }

    async fn cancel_trades(&self) {
        if self.trades.cancel_all().await {
            info!("Trades cancelled, history checked");
        } else {
            warn!("Could not cancel trades");
        }
    }

    async fn run(&mut self, mut target: TargetResource) -> RunSummary {
        let retry_pause = Duration::from_secs(self.cfg.wait_check_interval_secs.max(1));

        loop {
            if self.shutdown.is_shutdown_requested() {
                break;
            }

            if !self.quota.can_donate(true).await {
                if !self.wait_for_quota(&mut target).await {
                    break;
                }
                continue;
            }

            if self.watch.changed() {
                self.adopt_latest(&mut target);
            }

            if let Ok(request) = self.replace_rx.try_recv() {
                info!("Replacement requested: {}", request.reason);
                if self.replace(&mut target, &request.reason).await {
                    continue;
                }
                info!("Keeping the current target");
            }

            if self.failed_cycles >= self.cfg.max_failed_cycles.max(1) {
                warn!("{} full cycles ended without the target changing", self.failed_cycles);
                if self.replace(&mut target, "repeated failed cycles").await {
                    continue;
                }
                self.failed_cycles = 0;
                info!("Keeping the current target");
            }

            if target.needs_replacement
                && self.replacement.replace_if_needed(&target).await.is_some()
            {
                self.summary.replacements += 1;
                self.adopt_latest(&mut target);
                continue;
            }

            self.summary.cycles += 1;
            info!(
                "Cycle {} for target {} ({} owners), failed cycles {}/{}",
                self.summary.cycles,
                target.resource_id,
                target.owner_count,
                self.failed_cycles,
                self.cfg.max_failed_cycles
            );

            let report = self.retry.process_all_owners(&target, &self.watch).await;
            self.summary.trades_sent += report.sent;
            info!(
                "Owners processed: {}, trades sent: {} ({} pending offers)",
                report.processed,
                report.sent,
                self.trades.pending_count()
            );

            if self.shutdown.is_shutdown_requested() {
                break;
            }
            if report.interrupted || self.watch.changed() {
                info!("Target changed, restarting with the new one");
                self.adopt_latest(&mut target);
                continue;
            }

            if report.processed == 0 {
                self.failed_cycles += 1;
                warn!(
                    "Full cycle {}/{} ended without reachable owners",
                    self.failed_cycles, self.cfg.max_failed_cycles
                );
                if !self.shutdown.sleep(retry_pause).await {
                    break;
                }
                continue;
            }

            if !self.monitor_running() {
                info!("All owners processed");
                break;
            }

            match self.wait_for_change().await {
                WaitOutcome::Changed => {
                    self.adopt_latest(&mut target);
                    info!("Target changed, failed cycle counter reset");
                }
                WaitOutcome::Shutdown => break,
                WaitOutcome::TimedOut => {
                    self.cancel_trades().await;
                    self.failed_cycles += 1;
                    warn!(
                        "Full cycle {}/{} ended without the target changing, restarting",
                        self.failed_cycles, self.cfg.max_failed_cycles
                    );
                }
            }
        }

        self.summary
    }

    /// Give the monitor time to see the target change hands
    async fn wait_for_change(&self) -> WaitOutcome {
        let timeout = Duration::from_secs(self.cfg.wait_after_all_owners_secs);
        let step = Duration::from_secs(self.cfg.wait_check_interval_secs.max(1));
        info!("All owners processed, waiting up to {:?} for the target to change", timeout);

        let start = Instant::now();
        let mut checks: u64 = 0;
        while start.elapsed() < timeout {
            checks += 1;
            if self.watch.changed() {
                info!("Target changed after {}s", start.elapsed().as_secs());
                return WaitOutcome::Changed;
            }
            if checks % 15 == 0 {
                let elapsed = start.elapsed();
                info!(
                    "Waiting for the target to change: {}s elapsed, {}s left",
                    elapsed.as_secs(),
                    timeout.saturating_sub(elapsed).as_secs()
                );
            }
            if !self.shutdown.sleep(step).await {
                return WaitOutcome::Shutdown;
            }
        }

        if self.watch.changed() {
            WaitOutcome::Changed
        } else {
            WaitOutcome::TimedOut
        }
    }

    /// Wait mode: park until the donation quota is renewed.
    ///
    /// Target changes and replacement requests are still served. Returns
    /// `false` on shutdown.
    async fn wait_for_quota(&mut self, target: &mut TargetResource) -> bool {
        warn!("Daily donation quota reached, entering wait mode");
        self.cancel_trades().await;
        self.quota.log_stats(true).await;

        let check = Duration::from_secs(self.cfg.wait_mode_check_interval_secs.max(1));
        let stats_every = Duration::from_secs(self.cfg.wait_mode_stats_interval_secs);
        let mut last_stats = Instant::now();
        let mut checks: u64 = 0;

        loop {
            checks += 1;
            if self.quota.can_donate(true).await {
                info!("Donation quota renewed, resuming");
                self.quota.log_stats(false).await;
                return true;
            }

            if last_stats.elapsed() >= stats_every {
                info!("Wait mode: still waiting for the quota reset");
                self.quota.log_stats(false).await;
                last_stats = Instant::now();
            }

            if self.watch.changed() {
                info!("Target changed while waiting");
                self.adopt_latest(target);
            }

            while let Ok(request) = self.replace_rx.try_recv() {
                info!("Replacement requested while waiting: {}", request.reason);
                if !self.replace(target, &request.reason).await {
                    warn!("Replacement failed, still waiting");
                }
            }

            if checks % 10 == 0 {
                debug!("Wait mode check #{}", checks);
            }
            if !self.shutdown.sleep(check).await {
                return false;
            }
        }
    }
}
