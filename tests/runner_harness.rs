//! End-to-end runner harness
//!
//! Drives the trading loop against the in-memory site:
//! target → selection → proposals → cancel/reconcile → contribution/replacement

mod mock_site;

use boost_runner::blocklist::BlockList;
use boost_runner::inventory::Inventory;
use boost_runner::monitor::{AcquisitionMonitor, MonitorEvent, TargetAnnouncer};
use boost_runner::quota::{PageQuotaSource, QuotaTracker};
use boost_runner::reconciler::TradeReconciler;
use boost_runner::retry::{OwnerOutcome, RetryController};
use boost_runner::selection::SelectionEngine;
use boost_runner::signals::target_channel;
use boost_runner::trade::{OfferBook, TradeCoordinator};
use boost_runner::types::{Item, Owner, TargetResource, TradeHistoryEntry, TradeStatus};
use boost_runner::{BoostRunner, RunSummary, Settings, ShutdownCoordinator};
use mock_site::{shared_store, MockSite};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const PAGE: &str = "/clubs/7/boost";

/// Settings with every pause collapsed so runs stay short on the paused clock
fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.runner.user_id = 1;
    settings.runner.target_url = PAGE.to_string();
    settings.runner.wait_after_all_owners_secs = 10;
    settings.runner.wait_check_interval_secs = 1;
    settings.runner.wait_mode_check_interval_secs = 5;
    settings.runner.wait_mode_stats_interval_secs = 30;
    settings.trade.min_trade_delay_secs = 0.0;
    settings.trade.jitter_min_secs = 0.0;
    settings.trade.jitter_max_secs = 0.0;
    settings.trade.failed_attempt_delay_secs = 0;
    settings.trade.batch_delay_ms = 0;
    settings.trade.page_delay_ms = 0;
    settings.trade.cancel_settle_secs = 0;
    settings.monitor.contribute_settle_secs = 0;
    settings.monitor.confirm_wait_secs = 0;
    settings
}

/// Rank A target; more than 100 owners means no replacement is due
fn target(resource_id: u64, owner_count: u32) -> TargetResource {
    TargetResource::new(resource_id, 9_000 + resource_id, "a", 3, owner_count, 100)
}

struct Parts {
    inventory: Arc<Inventory>,
    reconciler: Arc<TradeReconciler>,
    trades: Arc<TradeCoordinator>,
    quota: Arc<QuotaTracker>,
    retry: RetryController,
}

async fn wire(site: &Arc<MockSite>, settings: &Settings) -> Parts {
    let inventory = Arc::new(Inventory::new(shared_store(), settings.selection.cache_ttl_hours));
    let items = site.state().my_items.clone();
    inventory.sync(items).await.unwrap();

    let offers = OfferBook::default();
    let reconciler = Arc::new(
        TradeReconciler::new(site.clone(), inventory.clone(), 1).with_offer_book(offers.clone()),
    );
    let trades = Arc::new(
        TradeCoordinator::new(site.clone(), settings.trade, settings.runner.dry_run)
            .with_offer_book(offers)
            .with_reconciler(reconciler.clone()),
    );
    let selection = Arc::new(
        SelectionEngine::new(inventory.clone(), site.clone(), trades.locked(), settings.selection)
            .with_seed(7),
    );
    let quota = Arc::new(QuotaTracker::new(
        Arc::new(PageQuotaSource::new(site.clone(), PAGE)),
        &settings.quota,
    ));
    let retry = RetryController::new(
        site.clone(),
        selection,
        trades.clone(),
        settings.trade,
        ShutdownCoordinator::shared(),
    );

    Parts {
        inventory,
        reconciler,
        trades,
        quota,
        retry,
    }
}

#[tokio::test(start_paused = true)]
async fn test_owner_gets_at_most_three_attempts_when_every_trade_fails() {
    let current = target(500, 1_000);
    let site = Arc::new(
        MockSite::new(current.clone())
            .with_owners(1)
            .with_items("A", &[10, 10, 10, 10, 10]),
    );
    site.state().reject_trades = true;
    let parts = wire(&site, &fast_settings()).await;
    let (_publisher, watch) = target_channel(Some(current.clone()));

    let outcome = parts
        .retry
        .process_owner(&Owner::new(1, "owner1"), &current, &watch)
        .await;

    assert_eq!(outcome, OwnerOutcome::Failed);
    assert_eq!(site.state().failed_proposals, 3);
    // Every failed instance stays out of the next owner's picks
    assert_eq!(parts.retry.failed_items().len(), 3);
    assert!(parts.trades.locked().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_success_clears_failed_items_and_locks_the_offer() {
    let current = target(500, 1_000);
    let site = Arc::new(
        MockSite::new(current.clone())
            .with_owners(2)
            .with_items("A", &[10, 10, 10]),
    );
    site.state().reject_trades = true;
    let parts = wire(&site, &fast_settings()).await;
    let (_publisher, watch) = target_channel(Some(current.clone()));

    let owner = Owner::new(1, "owner1");
    assert_eq!(
        parts.retry.process_owner(&owner, &current, &watch).await,
        OwnerOutcome::Failed
    );
    // All three items failed, nothing left for the next owner
    assert_eq!(
        parts
            .retry
            .process_owner(&Owner::new(2, "owner2"), &current, &watch)
            .await,
        OwnerOutcome::NoCandidate
    );

    parts.retry.reset();
    site.state().reject_trades = false;
    assert_eq!(
        parts
            .retry
            .process_owner(&Owner::new(2, "owner2"), &current, &watch)
            .await,
        OwnerOutcome::Sent
    );
    assert!(parts.retry.failed_items().is_empty());
    assert_eq!(parts.trades.locked().len(), 1);
    assert!(parts.trades.has_sent(2, 500));

    // Same owner and item again is refused before reaching the site
    assert!(!parts.trades.propose_trade(2, 102, 500).await);
    assert_eq!(site.proposals().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_blocked_owner_is_skipped() {
    let current = target(500, 1_000);
    let site = Arc::new(
        MockSite::new(current.clone())
            .with_owners(3)
            .with_items("A", &[10, 10, 10]),
    );
    let parts = wire(&site, &fast_settings()).await;
    let blocked: HashSet<u64> = [2].into_iter().collect();
    let retry = parts.retry.with_blocklist(Arc::new(blocked) as Arc<dyn BlockList>);
    let (_publisher, watch) = target_channel(Some(current.clone()));

    let report = retry.process_all_owners(&current, &watch).await;

    assert_eq!(report.processed, 3);
    assert_eq!(report.sent, 2);
    let owners: Vec<u64> = site.proposals().iter().map(|p| p.owner_id).collect();
    assert_eq!(owners, vec![1, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_target_change_interrupts_the_sweep() {
    let current = target(500, 1_000);
    let site = Arc::new(
        MockSite::new(current.clone())
            .with_owners(4)
            .with_items("A", &[10, 10, 10, 10]),
    );
    let parts = wire(&site, &fast_settings()).await;

    let (publisher, mut watch) = target_channel(Some(current.clone()));
    let publisher = Arc::new(publisher);
    let trigger = publisher.clone();
    let next = target(600, 1_000);
    site.on_trade(move |total| {
        if total == 1 {
            trigger.publish(next.clone());
        }
    });

    let report = parts.retry.process_all_owners(&current, &watch).await;

    assert!(report.interrupted);
    assert_eq!(report.sent, 1);
    assert_eq!(site.proposals().len(), 1);
    assert_eq!(watch.acknowledge().unwrap().resource_id, 600);
    assert!(!watch.changed());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_reconciles_completed_and_reversed_trades() {
    let current = target(500, 1_000);
    let site = Arc::new(MockSite::new(current).with_items("A", &[10, 20, 30]));
    let parts = wire(&site, &fast_settings()).await;
    parts.reconciler.prime().await.unwrap();

    site.state().history = vec![TradeHistoryEntry {
        trade_id: 77,
        status: TradeStatus::Completed,
        lost_items: vec![2],
        gained_items: vec![500],
    }];
    assert!(parts.trades.cancel_all().await);
    assert!(!parts.inventory.contains_instance(102));
    assert_eq!(parts.inventory.len(), 2);

    // Seeing the same completion again changes nothing
    assert_eq!(parts.reconciler.force_check().await, 0);
    assert_eq!(parts.inventory.len(), 2);

    site.state().history[0].status = TradeStatus::Cancelled;
    assert!(parts.trades.cancel_all().await);
    assert!(parts.inventory.contains_instance(102));
    assert_eq!(parts.inventory.len(), 3);
    assert_eq!(site.state().cancels, 2);
}

#[tokio::test(start_paused = true)]
async fn test_completed_offer_removes_the_instance_it_locked() {
    let current = target(500, 1_000);
    let site = Arc::new(MockSite::new(current.clone()).with_owners(1));
    {
        let mut state = site.state();
        state.my_items = vec![Item::new(1, 101, "A"), Item::new(1, 102, "A")];
        state.demand.insert(1, 10);
    }
    let parts = wire(&site, &fast_settings()).await;
    parts.reconciler.prime().await.unwrap();
    let (_publisher, watch) = target_channel(Some(current.clone()));

    let outcome = parts
        .retry
        .process_owner(&Owner::new(1, "owner1"), &current, &watch)
        .await;
    assert_eq!(outcome, OwnerOutcome::Sent);
    let offered = site.proposals()[0].my_instance_id;
    let kept = if offered == 101 { 102 } else { 101 };
    assert!(parts.trades.locked().contains(offered));
    assert_eq!(parts.trades.pending_count(), 1);

    site.state().history = vec![TradeHistoryEntry {
        trade_id: 1,
        status: TradeStatus::Completed,
        lost_items: vec![1],
        gained_items: vec![500],
    }];
    assert_eq!(parts.reconciler.force_check().await, 1);

    assert!(!parts.inventory.contains_instance(offered));
    assert!(parts.inventory.contains_instance(kept));
    assert!(parts.trades.locked().is_empty());
    assert_eq!(parts.trades.pending_count(), 0);
    assert_eq!(parts.trades.offers()[0].status, TradeStatus::Completed);

    assert!(parts.trades.cancel_all().await);
    assert!(parts.trades.offers().is_empty());
}

#[tokio::test]
async fn test_work_stops_once_both_quotas_are_used() {
    let site = Arc::new(MockSite::new(target(500, 1_000)));
    site.state().quota.donations_used = 50;
    let parts = wire(&site, &fast_settings()).await;

    let snap = parts.quota.snapshot(true).await;
    assert_eq!(snap.donations_left(), 0);
    assert!(!parts.quota.can_donate(false).await);
    assert!(parts.quota.can_replace(false).await);
    assert!(parts.quota.can_work(false).await);

    site.state().quota.replacements_used = 10;
    assert!(!parts.quota.can_replace(true).await);
    assert!(!parts.quota.can_work(false).await);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_contributes_and_publishes_the_next_target() {
    let current = target(500, 1_000);
    let site = Arc::new(
        MockSite::new(current.clone())
            .with_next_target(target(600, 1_000))
            .with_items("A", &[10]),
    );
    site.state().acquisition_open = true;
    let settings = fast_settings();
    let parts = wire(&site, &settings).await;
    let store = shared_store();

    let (publisher, mut watch) = target_channel(None);
    let announcer = Arc::new(TargetAnnouncer::new(publisher, store.clone(), PAGE));
    assert!(announcer.announce(current.clone()).await);
    watch.acknowledge();

    let monitor = AcquisitionMonitor::new(
        site.clone(),
        site.clone(),
        parts.trades.clone(),
        parts.quota.clone(),
        announcer,
        PAGE,
        settings.monitor,
        false,
    );

    assert_eq!(monitor.check_once().await.unwrap(), MonitorEvent::Contributed(true));
    assert_eq!(site.state().contributions, vec![current.instance_id]);
    assert_eq!(site.state().quota.donations_used, 1);
    // Before contributing and again once the target moved on
    assert_eq!(site.state().cancels, 2);

    assert!(watch.changed());
    assert_eq!(watch.acknowledge().unwrap().resource_id, 600);
    assert_eq!(store.target.lock().unwrap().as_ref().unwrap().resource_id, 600);

    assert_eq!(monitor.check_once().await.unwrap(), MonitorEvent::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_monitor_waits_when_donations_are_used_up() {
    let current = target(500, 1_000);
    let site = Arc::new(MockSite::new(current.clone()));
    {
        let mut state = site.state();
        state.acquisition_open = true;
        state.quota.donations_used = 50;
    }
    let settings = fast_settings();
    let parts = wire(&site, &settings).await;
    let (publisher, _watch) = target_channel(None);
    let announcer = Arc::new(TargetAnnouncer::new(publisher, shared_store(), PAGE));
    announcer.announce(current).await;

    let monitor = AcquisitionMonitor::new(
        site.clone(),
        site.clone(),
        parts.trades.clone(),
        parts.quota.clone(),
        announcer,
        PAGE,
        settings.monitor,
        false,
    );

    assert_eq!(monitor.check_once().await.unwrap(), MonitorEvent::QuotaExhausted);
    assert!(site.state().contributions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_runner_replaces_a_thin_target_before_trading() {
    let site = Arc::new(
        MockSite::new(target(500, 40))
            .with_next_target(target(600, 1_000))
            .with_owners(2)
            .with_items("A", &[10, 20, 30]),
    );
    let store = shared_store();
    let runner = BoostRunner::new(
        fast_settings(),
        site.clone(),
        store.clone(),
        ShutdownCoordinator::shared(),
    );

    let summary = runner.run().await.unwrap();

    assert_eq!(
        summary,
        RunSummary {
            cycles: 1,
            trades_sent: 2,
            replacements: 1,
        }
    );
    assert_eq!(site.state().replacements, 1);
    assert!(site
        .proposals()
        .iter()
        .all(|p| p.their_instance_id % 1_000 == 600));
    assert_eq!(store.target.lock().unwrap().as_ref().unwrap().resource_id, 600);
}

#[tokio::test(start_paused = true)]
async fn test_runner_serves_a_queued_replace_request() {
    let site = Arc::new(
        MockSite::new(target(500, 1_000))
            .with_next_target(target(800, 1_000))
            .with_owners(1)
            .with_items("A", &[10]),
    );
    let runner = BoostRunner::new(
        fast_settings(),
        site.clone(),
        shared_store(),
        ShutdownCoordinator::shared(),
    );
    assert!(runner.replace_requester().request("manual request"));

    let summary = runner.run().await.unwrap();

    assert_eq!(summary.replacements, 1);
    assert_eq!(summary.trades_sent, 1);
    assert_eq!(site.proposals()[0].their_instance_id, 1_800);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_sends_nothing() {
    let site = Arc::new(
        MockSite::new(target(500, 1_000))
            .with_owners(3)
            .with_items("A", &[10, 20]),
    );
    let mut settings = fast_settings();
    settings.runner.dry_run = true;
    let runner =
        BoostRunner::new(settings, site.clone(), shared_store(), ShutdownCoordinator::shared());

    let summary = runner.run().await.unwrap();

    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.trades_sent, 3);
    let state = site.state();
    assert!(state.proposals.is_empty());
    assert!(state.contributions.is_empty());
    assert_eq!(state.cancels, 0);
}

#[tokio::test(start_paused = true)]
async fn test_runner_waits_out_the_donation_quota() {
    let site = Arc::new(
        MockSite::new(target(500, 1_000))
            .with_owners(2)
            .with_items("A", &[10, 20]),
    );
    site.state().quota.donations_used = 50;
    let shutdown = ShutdownCoordinator::shared();
    let runner = BoostRunner::new(fast_settings(), site.clone(), shared_store(), shutdown.clone());

    let driver = async {
        tokio::time::sleep(Duration::from_secs(100)).await;
        let parked = site.proposals().is_empty() && site.state().cancels >= 1;
        site.state().quota.donations_used = 0;
        parked
    };
    let (summary, parked) = tokio::join!(runner.run(), driver);

    assert!(parked, "runner traded while the donation quota was used up");
    let summary = summary.unwrap();
    assert_eq!(summary.cycles, 1);
    assert_eq!(summary.trades_sent, 2);
    assert_eq!(site.proposals().len(), 2);
    assert!(!shutdown.is_shutdown_requested());
}

#[tokio::test(start_paused = true)]
async fn test_failed_cycles_force_a_replacement() {
    let site = Arc::new(
        MockSite::new(target(500, 1_000))
            .with_next_target(target(700, 1_000))
            .with_owners(2)
            .with_items("A", &[10, 20, 30]),
    );
    let mut settings = fast_settings();
    settings.runner.enable_monitor = true;
    settings.runner.max_failed_cycles = 3;
    let shutdown = ShutdownCoordinator::shared();
    let runner = BoostRunner::new(settings, site.clone(), shared_store(), shutdown.clone());

    let driver = async {
        tokio::time::sleep(Duration::from_secs(120)).await;
        shutdown.request_shutdown();
    };
    let (summary, _) = tokio::join!(runner.run(), driver);
    let summary = summary.unwrap();

    // Later attempts find no other target and do not count
    assert!(site.state().replacements >= 1);
    assert_eq!(summary.replacements, 1);
    assert!(summary.cycles >= 4);
    // Three timed-out waits each cancelled the outstanding offers
    assert!(site.state().cancels >= 3);
    assert!(site
        .proposals()
        .iter()
        .any(|p| p.their_instance_id % 1_000 == 700));
}
