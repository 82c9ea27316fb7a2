//! Daily quota tracking
//!
//! Counters come from the club page; the countdown to the next reset is
//! computed locally against midnight in a fixed UTC offset, whatever the
//! host timezone is.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::QuotaConfig;
use crate::error::RemoteResult;
use crate::site::Extractor;
use crate::types::{QuotaCounts, QuotaSnapshot};

/// Where the counters are read from
#[async_trait]
pub trait QuotaSource: Send + Sync {
    async fn fetch_counts(&self) -> RemoteResult<QuotaCounts>;
}

/// Reads counters off the club page through an `Extractor`
pub struct PageQuotaSource {
    extractor: Arc<dyn Extractor>,
    url: String,
}

impl PageQuotaSource {
    pub fn new(extractor: Arc<dyn Extractor>, url: &str) -> Self {
        Self {
            extractor,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl QuotaSource for PageQuotaSource {
    async fn fetch_counts(&self) -> RemoteResult<QuotaCounts> {
        self.extractor.quota_counts(&self.url).await
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

fn zone(offset_hours: i32) -> FixedOffset {
    FixedOffset::east_opt(offset_hours * 3600).unwrap_or(Utc.fix())
}

/// Local calendar day of `at` in the reset zone
pub fn reset_day(at: DateTime<Utc>, offset_hours: i32) -> NaiveDate {
    at.with_timezone(&zone(offset_hours)).date_naive()
}

/// Seconds from `now` until the next midnight in the reset zone
pub fn seconds_until_reset_at(now: DateTime<Utc>, offset_hours: i32) -> i64 {
    let local = now.with_timezone(&zone(offset_hours)).naive_local();
    let next_midnight = local
        .date()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0));

    match next_midnight {
        Some(midnight) => (midnight - local).num_seconds(),
        None => 0,
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedCounts {
    counts: QuotaCounts,
    fetched_at: DateTime<Utc>,
}

/// Cached view of the daily donation/replacement quota
pub struct QuotaTracker {
    source: Arc<dyn QuotaSource>,
    offset_hours: i32,
    fallback: QuotaCounts,
    cache: Mutex<Option<CachedCounts>>,
    clock: Clock,
}

impl QuotaTracker {
    pub fn new(source: Arc<dyn QuotaSource>, cfg: &QuotaConfig) -> Self {
        Self {
            source,
            offset_hours: cfg.utc_offset_hours,
            fallback: QuotaCounts {
                donations_used: 0,
                donations_max: cfg.default_donations_max,
                replacements_used: 0,
                replacements_max: cfg.default_replacements_max,
            },
            cache: Mutex::new(None),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn seconds_until_reset(&self) -> i64 {
        seconds_until_reset_at((self.clock)(), self.offset_hours)
    }

    fn cached(&self) -> Option<CachedCounts> {
        *self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current snapshot.
    ///
    /// `force_refresh` always re-reads the page. Without it the cached
    /// counters are reused unless a reset boundary passed since they were
    /// fetched. A failed fetch yields full quota so callers never stall.
    pub async fn snapshot(&self, force_refresh: bool) -> QuotaSnapshot {
        let now = (self.clock)();
        let seconds_until_reset = seconds_until_reset_at(now, self.offset_hours);

        if !force_refresh {
            if let Some(cached) = self.cached() {
                let same_day = reset_day(cached.fetched_at, self.offset_hours)
                    == reset_day(now, self.offset_hours);
                if same_day {
                    return QuotaSnapshot::from_counts(cached.counts, seconds_until_reset);
                }
                info!("Quota reset passed since last check, refreshing");
            }
        }

        match self.source.fetch_counts().await {
            Ok(counts) => {
                *self.cache.lock().unwrap_or_else(|p| p.into_inner()) = Some(CachedCounts {
                    counts,
                    fetched_at: now,
                });
                QuotaSnapshot::from_counts(counts, seconds_until_reset)
            }
            Err(e) => {
                warn!("Could not read quota ({}), assuming full quota", e);
                QuotaSnapshot::from_counts(self.fallback, seconds_until_reset)
            }
        }
    }

    pub async fn can_donate(&self, force_refresh: bool) -> bool {
        self.snapshot(force_refresh).await.donations_left() > 0
    }

    pub async fn can_replace(&self, force_refresh: bool) -> bool {
        self.snapshot(force_refresh).await.replacements_left() > 0
    }

    /// Either a donation or a replacement is still possible
    pub async fn can_work(&self, force_refresh: bool) -> bool {
        let snap = self.snapshot(force_refresh).await;
        snap.donations_left() > 0 || snap.replacements_left() > 0
    }

    pub async fn log_stats(&self, force_refresh: bool) {
        let snap = self.snapshot(force_refresh).await;
        info!(
            "Daily quota: donations {}/{}, replacements {}/{}, reset in {}",
            snap.donations_used,
            snap.donations_max,
            snap.replacements_used,
            snap.replacements_max,
            snap.reset_in_display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Returns queued results in order, repeating the last one
    struct Scripted {
        results: Mutex<Vec<RemoteResult<QuotaCounts>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(results: Vec<RemoteResult<QuotaCounts>>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl QuotaSource for Scripted {
        async fn fetch_counts(&self) -> RemoteResult<QuotaCounts> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.len() > 1 {
                results.remove(0)
            } else {
                results[0].clone()
            }
        }
    }

    fn counts(donations_used: u32, replacements_used: u32) -> QuotaCounts {
        QuotaCounts {
            donations_used,
            donations_max: 50,
            replacements_used,
            replacements_max: 10,
        }
    }

    fn fixed_clock(at: DateTime<Utc>) -> Clock {
        Arc::new(move || at)
    }

    #[test]
    fn test_reset_countdown_uses_fixed_offset() {
        // 20:30 UTC is 23:30 at UTC+3
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 20, 30, 0).unwrap();
        assert_eq!(seconds_until_reset_at(now, 3), 30 * 60);
        // Same instant at UTC: 3h30m to midnight
        assert_eq!(seconds_until_reset_at(now, 0), 3 * 3600 + 30 * 60);
        // Exactly midnight local: a full day remains
        let midnight = Utc.with_ymd_and_hms(2024, 5, 1, 21, 0, 0).unwrap();
        assert_eq!(seconds_until_reset_at(midnight, 3), 86_400);
    }

    #[tokio::test]
    async fn test_exhausted_then_refreshed() {
        let source = Scripted::new(vec![Ok(counts(50, 0)), Ok(counts(0, 0))]);
        let tracker = QuotaTracker::new(source.clone(), &QuotaConfig::default());

        assert!(!tracker.can_donate(false).await);
        // Cached value still exhausted without a refresh
        assert!(!tracker.can_donate(false).await);
        assert!(tracker.can_donate(true).await);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_permissive() {
        let source = Scripted::new(vec![Err(RemoteError::Transient("down".into()))]);
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap();
        let tracker =
            QuotaTracker::new(source, &QuotaConfig::default()).with_clock(fixed_clock(now));

        let snap = tracker.snapshot(true).await;
        assert_eq!(snap.donations_left(), 50);
        assert_eq!(snap.replacements_left(), 10);
        assert_eq!(snap.seconds_until_reset, 3600);
        assert!(tracker.can_work(true).await);
    }

    #[tokio::test]
    async fn test_cache_not_trusted_across_reset() {
        let source = Scripted::new(vec![Ok(counts(50, 10)), Ok(counts(0, 0))]);
        let before = Utc.with_ymd_and_hms(2024, 5, 1, 20, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 21, 1, 0).unwrap();
        let now = Arc::new(Mutex::new(before));
        let clock_now = now.clone();
        let tracker = QuotaTracker::new(source.clone(), &QuotaConfig::default())
            .with_clock(Arc::new(move || *clock_now.lock().unwrap()));

        assert!(!tracker.can_work(false).await);
        *now.lock().unwrap() = after;
        assert!(tracker.can_work(false).await);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_can_work_with_only_replacements_left() {
        let source = Scripted::new(vec![Ok(counts(50, 3))]);
        let tracker = QuotaTracker::new(source, &QuotaConfig::default());
        assert!(!tracker.can_donate(true).await);
        assert!(tracker.can_replace(false).await);
        assert!(tracker.can_work(false).await);
    }
}
