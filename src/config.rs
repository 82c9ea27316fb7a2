//! Runner configuration
//!
//! Built-in defaults, overlaid by an optional TOML file and `BOOST_*`
//! environment variables. The binary applies CLI flags on top.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub session: SessionConfig,
    pub rate_limit: RateLimitConfig,
    pub trade: TradeConfig,
    pub selection: SelectionConfig,
    pub quota: QuotaConfig,
    pub monitor: MonitorConfig,
    pub runner: RunnerConfig,
    pub notifier: NotifierConfig,
    /// JSON block list file; block list disabled when unset
    pub blocklist_file: Option<PathBuf>,
}

impl Settings {
    /// Load defaults <- file (optional) <- environment
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("BOOST")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize::<Settings>()?;

        Ok(settings)
    }
}

/// Remote session parameters. Credentials are acquired elsewhere and handed in.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Raw `Cookie` header of an authenticated session
    pub cookie: Option<String>,
    pub csrf_token: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Attempts for transient failures, first attempt included
    pub max_retries: u32,
    /// Base of the exponential backoff between transient retries
    pub retry_delay_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://mangabuff.ru".to_string(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:136.0) Gecko/20100101 Firefox/136.0"
                .to_string(),
            cookie: None,
            csrf_token: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 20,
            max_retries: 3,
            retry_delay_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// N requests ...
    pub max_requests: usize,
    /// ... per rolling W seconds
    pub window_secs: u64,
    /// Cool-down after the remote signals throttling
    pub throttle_pause_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 66,
            window_secs: 60,
            throttle_pause_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TradeConfig {
    /// Minimum spacing between two trade sends
    pub min_trade_delay_secs: f64,
    pub jitter_min_secs: f64,
    pub jitter_max_secs: f64,
    pub max_attempts_per_owner: u32,
    /// Pause before retrying an owner with a different item
    pub failed_attempt_delay_secs: u64,
    /// Width of one partner-inventory id range
    pub batch_size: u64,
    pub max_batches: u32,
    /// Ranges always checked even when early ones come back empty
    pub min_batches: u32,
    pub batch_timeout_retries: u32,
    pub batch_retry_delay_secs: u64,
    pub batch_delay_ms: u64,
    /// Throttle responses tolerated per partner search
    pub max_throttle_retries: u32,
    /// Pause after cancel-all before reconciling
    pub cancel_settle_secs: u64,
    pub page_delay_ms: u64,
    /// Owners skipped at the top of the first listing page
    pub first_page_skip: usize,
}

impl Default for TradeConfig {
    fn default() -> Self {
        Self {
            min_trade_delay_secs: 11.0,
            jitter_min_secs: 0.5,
            jitter_max_secs: 2.0,
            max_attempts_per_owner: 3,
            failed_attempt_delay_secs: 1,
            batch_size: 10_000,
            max_batches: 10,
            min_batches: 3,
            batch_timeout_retries: 3,
            batch_retry_delay_secs: 2,
            batch_delay_ms: 200,
            max_throttle_retries: 5,
            cancel_settle_secs: 2,
            page_delay_ms: 600,
            first_page_skip: 6,
        }
    }
}

impl TradeConfig {
    pub fn min_trade_delay(&self) -> Duration {
        Duration::from_secs_f64(self.min_trade_delay_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SelectionConfig {
    /// Demands at or below this collapse to the same bucket
    pub low_demand_threshold: u32,
    /// Items above this demand are never offered
    pub max_demand: u32,
    /// Random unclassified picks before classifying the remainder
    pub attempt_budget: usize,
    pub cache_ttl_hours: i64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            low_demand_threshold: 5,
            max_demand: 70,
            attempt_budget: 50,
            cache_ttl_hours: 72,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    /// Fixed offset of the zone whose midnight resets the quota
    pub utc_offset_hours: i32,
    pub default_donations_max: u32,
    pub default_replacements_max: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: 3,
            default_donations_max: 50,
            default_replacements_max: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub acquisition_interval_secs: u64,
    pub reconciliation_interval_secs: u64,
    /// A loop stops itself after this many failed iterations in a row
    pub max_consecutive_errors: u32,
    /// Bounded join when stopping a loop
    pub stop_timeout_secs: u64,
    /// Pause after cancelling trades and before contributing
    pub contribute_settle_secs: u64,
    /// Pause after contributing/replacing before re-reading the target
    pub confirm_wait_secs: u64,
    /// Log a heartbeat every N quiet acquisition checks
    pub status_every_checks: u64,
    pub blocklist_refresh_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            acquisition_interval_secs: 2,
            reconciliation_interval_secs: 60,
            max_consecutive_errors: 20,
            stop_timeout_secs: 5,
            contribute_settle_secs: 2,
            confirm_wait_secs: 3,
            status_every_checks: 30,
            blocklist_refresh_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Our own account id
    pub user_id: u64,
    /// Club boost page (relative path or absolute URL)
    pub target_url: String,
    pub output_dir: PathBuf,
    pub dry_run: bool,
    pub enable_monitor: bool,
    pub skip_inventory: bool,
    pub replacement_threshold: u32,
    pub max_failed_cycles: u32,
    pub wait_after_all_owners_secs: u64,
    pub wait_check_interval_secs: u64,
    pub wait_mode_check_interval_secs: u64,
    pub wait_mode_stats_interval_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            user_id: 0,
            target_url: String::new(),
            output_dir: default_output_dir(),
            dry_run: false,
            enable_monitor: false,
            skip_inventory: false,
            replacement_threshold: 100,
            max_failed_cycles: 3,
            wait_after_all_owners_secs: 300,
            wait_check_interval_secs: 2,
            wait_mode_check_interval_secs: 30,
            wait_mode_stats_interval_secs: 300,
        }
    }
}

fn default_output_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("boost-runner"))
        .unwrap_or_else(|| PathBuf::from("created_files"))
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub telegram_token: Option<String>,
    pub chat_id: Option<String>,
    pub thread_id: Option<i64>,
}

impl NotifierConfig {
    pub fn is_configured(&self) -> bool {
        self.telegram_token.as_deref().is_some_and(|t| !t.is_empty())
            && self.chat_id.as_deref().is_some_and(|c| !c.is_empty())
    }
}
