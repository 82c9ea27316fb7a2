//! Boost Runner Library
//!
//! Trading automation for club boosts: keeps trading surplus items for the
//! resource a club currently asks for, within the site's rate limit and
//! daily quotas.

pub mod blocklist;
pub mod config;
pub mod error;
pub mod html;
pub mod http_site;
pub mod inventory;
pub mod monitor;
pub mod notifier;
pub mod quota;
pub mod rate_limit;
pub mod reconciler;
pub mod replacement;
pub mod retry;
pub mod runner;
pub mod selection;
pub mod shutdown;
pub mod signals;
pub mod site;
pub mod store;
pub mod trade;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use config::Settings;
pub use error::{RemoteError, RemoteResult};
pub use runner::{BoostRunner, RunSummary};
pub use shutdown::{ShutdownCoordinator, SharedShutdown};
pub use signals::ReplaceRequester;
pub use site::{ClubActions, Extractor, TradeApi};
pub use types::{Item, Owner, TargetResource};
