//! Replacing the club target

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::monitor::TargetAnnouncer;
use crate::quota::QuotaTracker;
use crate::site::{ClubActions, Extractor};
use crate::trade::TradeCoordinator;
use crate::types::TargetResource;

pub struct ReplacementManager {
    extractor: Arc<dyn Extractor>,
    club: Arc<dyn ClubActions>,
    trades: Arc<TradeCoordinator>,
    quota: Arc<QuotaTracker>,
    announcer: Arc<TargetAnnouncer>,
    page_url: String,
    settle: Duration,
    confirm_wait: Duration,
    dry_run: bool,
}

impl ReplacementManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        extractor: Arc<dyn Extractor>,
        club: Arc<dyn ClubActions>,
        trades: Arc<TradeCoordinator>,
        quota: Arc<QuotaTracker>,
        announcer: Arc<TargetAnnouncer>,
        page_url: &str,
        settle: Duration,
        confirm_wait: Duration,
        dry_run: bool,
    ) -> Self {
        Self {
            extractor,
            club,
            trades,
            quota,
            announcer,
            page_url: page_url.to_string(),
            settle,
            confirm_wait,
            dry_run,
        }
    }

    /// Replacement quota left, read fresh from the page
    pub async fn can_replace(&self) -> bool {
        if self.quota.can_replace(true).await {
            return true;
        }
        warn!("Daily replacement quota reached");
        self.quota.log_stats(false).await;
        false
    }

    /// Replace only when the target has too few owners
    pub async fn replace_if_needed(&self, target: &TargetResource) -> Option<TargetResource> {
        if !target.needs_replacement {
            return None;
        }
        info!(
            "Target {} has only {} owners, replacing it",
            target.resource_id, target.owner_count
        );
        self.force_replace(target, "automatic replacement").await
    }

    /// Replace regardless of owner count.
    ///
    /// Returns the new target once the page confirms a different one.
    pub async fn force_replace(
        &self,
        target: &TargetResource,
        reason: &str,
    ) -> Option<TargetResource> {
        if !self.can_replace().await {
            return None;
        }

        let left = self.quota.snapshot(false).await.replacements_left();
        info!(
            "Replacing target {} ({} owners): {}, {} replacements left today",
            target.resource_id, target.owner_count, reason, left
        );

        self.trades.cancel_all().await;
        tokio::time::sleep(self.settle).await;

        if !self.can_replace().await {
            return None;
        }

        if self.dry_run {
            info!("[dry-run] Would request a new target");
            return None;
        }

        if let Err(e) = self.club.replace_target().await {
            warn!("Replacement request failed: {}", e);
            return None;
        }
        info!("Replacement requested");

        tokio::time::sleep(self.confirm_wait).await;
        // Refresh cached counters
        self.quota.snapshot(true).await;

        let next = match self.extractor.target_resource(&self.page_url).await {
            Ok(Some(next)) => next,
            Ok(None) => {
                warn!("Could not read the target after replacing");
                return None;
            }
            Err(e) => {
                warn!("Could not read the target after replacing: {}", e);
                return None;
            }
        };

        if next.resource_id == target.resource_id {
            warn!("Target unchanged after replacement ({})", target.resource_id);
            self.quota.log_stats(false).await;
            return None;
        }

        info!(
            "Target replaced: {} ({} owners) -> {} ({} owners)",
            target.resource_id, target.owner_count, next.resource_id, next.owner_count
        );
        self.announcer.announce(next.clone()).await;
        self.quota.log_stats(false).await;
        Some(next)
    }
}
