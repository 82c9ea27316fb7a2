//! Boost Runner - trades surplus items for the resource a club asks for
//!
//! 1. Loads settings (file, environment, flags)
//! 2. Syncs our inventory and reads the club target
//! 3. Sweeps the target's owners with trade offers
//! 4. Optionally watches the club page and contributes when possible

use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};

use boost_runner::{BoostRunner, ReplaceRequester, Settings, ShutdownCoordinator};

#[derive(Parser, Debug)]
#[command(name = "boost-runner")]
#[command(about = "Automated trading for club boosts")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(long, short, default_value = "boost-runner.toml")]
    config: String,

    /// Raw Cookie header of a logged-in session
    #[arg(long, env = "BOOST_COOKIE", hide_env_values = true)]
    cookie: Option<String>,

    #[arg(long, env = "BOOST_CSRF_TOKEN", hide_env_values = true)]
    csrf_token: Option<String>,

    /// Our own account id
    #[arg(long, env = "BOOST_USER_ID")]
    user_id: Option<u64>,

    /// Club boost page
    #[arg(long, env = "BOOST_TARGET_URL")]
    target_url: Option<String>,

    /// Directory for inventory and cache files
    #[arg(long, env = "BOOST_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Select items but send nothing
    #[arg(long)]
    dry_run: bool,

    /// Watch the club page and contribute when a slot opens
    #[arg(long)]
    monitor: bool,

    /// Use the inventory on disk instead of downloading it
    #[arg(long)]
    skip_inventory: bool,

    /// Block list JSON file
    #[arg(long, env = "BOOST_BLOCKLIST")]
    blocklist: Option<PathBuf>,

    #[arg(long, env = "BOOST_TELEGRAM_TOKEN", hide_env_values = true)]
    telegram_token: Option<String>,

    #[arg(long, env = "BOOST_TELEGRAM_CHAT")]
    telegram_chat: Option<String>,

    #[arg(long, env = "BOOST_TELEGRAM_THREAD")]
    telegram_thread: Option<i64>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

impl Args {
    /// Flags win over file and environment settings
    fn apply(self, mut settings: Settings) -> Settings {
        if self.cookie.is_some() {
            settings.session.cookie = self.cookie;
        }
        if self.csrf_token.is_some() {
            settings.session.csrf_token = self.csrf_token;
        }
        if let Some(user_id) = self.user_id {
            settings.runner.user_id = user_id;
        }
        if let Some(url) = self.target_url {
            settings.runner.target_url = url;
        }
        if let Some(dir) = self.output_dir {
            settings.runner.output_dir = dir;
        }
        settings.runner.dry_run |= self.dry_run;
        settings.runner.enable_monitor |= self.monitor;
        settings.runner.skip_inventory |= self.skip_inventory;
        if self.blocklist.is_some() {
            settings.blocklist_file = self.blocklist;
        }
        if self.telegram_token.is_some() {
            settings.notifier.telegram_token = self.telegram_token;
        }
        if self.telegram_chat.is_some() {
            settings.notifier.chat_id = self.telegram_chat;
        }
        if self.telegram_thread.is_some() {
            settings.notifier.thread_id = self.telegram_thread;
        }
        settings
    }
}

/// Boost runner entry point
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(if args.debug {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    info!("Starting Boost Runner...");

    let settings = Settings::load(Some(args.config.as_str()))?;
    let settings = args.apply(settings);

    if settings.runner.user_id == 0 {
        anyhow::bail!("User id required (--user-id or BOOST_USER_ID)");
    }
    if settings.runner.target_url.is_empty() {
        anyhow::bail!("Target page required (--target-url or BOOST_TARGET_URL)");
    }
    if settings.session.cookie.is_none() {
        warn!("No session cookie configured, requests will be anonymous");
    }

    let shutdown = ShutdownCoordinator::shared();
    let runner = BoostRunner::connect(settings, shutdown.clone()).await?;

    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down...");
            on_interrupt.request_shutdown();
        }
    });
    listen_for_replace(runner.replace_requester());

    let summary = runner.run().await?;
    info!(
        "Done: {} cycles, {} trades sent, {} replacements",
        summary.cycles, summary.trades_sent, summary.replacements
    );
    Ok(())
}

/// SIGUSR1 asks for a target replacement
#[cfg(unix)]
fn listen_for_replace(requester: ReplaceRequester) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Replacement signal unavailable: {}", e);
            return;
        }
    };
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!("Replacement requested by signal");
            if !requester.request("manual request") {
                break;
            }
        }
    });
}

#[cfg(not(unix))]
fn listen_for_replace(_requester: ReplaceRequester) {}
