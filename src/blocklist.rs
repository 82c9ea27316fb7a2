//! Owners we never trade with

use regex::Regex;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::shutdown::BackgroundLoop;

pub trait BlockList: Send + Sync {
    fn is_blocked(&self, owner_id: u64) -> bool;
}

/// Fixed in-memory list
impl BlockList for HashSet<u64> {
    fn is_blocked(&self, owner_id: u64) -> bool {
        self.contains(&owner_id)
    }
}

#[derive(Debug, Default)]
struct Loaded {
    ids: HashSet<u64>,
    modified: Option<SystemTime>,
}

/// JSON file `{"blacklist": [...]}`, reloaded when its mtime changes.
///
/// Entries may be bare ids, profile links containing `/users/<id>`, or
/// objects with a `url` or `user_id` field.
pub struct FileBlockList {
    path: PathBuf,
    user_link: Regex,
    loaded: Mutex<Loaded>,
}

impl FileBlockList {
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Ok(Self {
            path: path.into(),
            user_link: Regex::new(r"/users/(\d+)")?,
            loaded: Mutex::new(Loaded::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.loaded.lock().unwrap_or_else(|p| p.into_inner()).ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_id(&self, entry: &Value) -> Option<u64> {
        match entry {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => {
                let s = s.trim();
                s.parse().ok().or_else(|| {
                    self.user_link
                        .captures(s)
                        .and_then(|c| c[1].parse().ok())
                })
            }
            Value::Object(map) => map
                .get("url")
                .or_else(|| map.get("user_id"))
                .and_then(|v| self.entry_id(v)),
            _ => None,
        }
    }

    /// Parse the file body; unreadable entries are skipped
    pub fn parse(&self, json: &str) -> anyhow::Result<HashSet<u64>> {
        let data: Value = serde_json::from_str(json)?;
        let mut ids = HashSet::new();
        for entry in data["blacklist"].as_array().into_iter().flatten() {
            match self.entry_id(entry) {
                Some(id) => {
                    ids.insert(id);
                }
                None => warn!("Unrecognised block list entry: {}", entry),
            }
        }
        Ok(ids)
    }

    /// Reload if the file changed since the last load.
    ///
    /// Returns whether the set was replaced. A missing file means an empty
    /// list; a corrupt one keeps the previous set.
    pub async fn refresh(&self) -> anyhow::Result<bool> {
        let modified = match fs::metadata(&self.path).await {
            Ok(meta) => meta.modified().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut loaded = self.loaded.lock().unwrap_or_else(|p| p.into_inner());
                let had = !loaded.ids.is_empty();
                *loaded = Loaded::default();
                return Ok(had);
            }
            Err(e) => return Err(e.into()),
        };

        {
            let loaded = self.loaded.lock().unwrap_or_else(|p| p.into_inner());
            if loaded.modified.is_some() && loaded.modified == modified {
                return Ok(false);
            }
        }

        let json = fs::read_to_string(&self.path).await?;
        let ids = self.parse(&json)?;

        let mut loaded = self.loaded.lock().unwrap_or_else(|p| p.into_inner());
        if loaded.ids.len() != ids.len() {
            info!("Block list updated: {} -> {} owners", loaded.ids.len(), ids.len());
        } else {
            debug!("Block list reloaded: {} owners", ids.len());
        }
        *loaded = Loaded { ids, modified };
        Ok(true)
    }

    /// Re-check the file every `interval`
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> BackgroundLoop {
        BackgroundLoop::spawn("Block list watcher", move |stop| async move {
            while stop.sleep(interval).await {
                if let Err(e) = self.refresh().await {
                    warn!("Failed to reload {}: {}", self.path.display(), e);
                }
            }
        })
    }
}

impl BlockList for FileBlockList {
    fn is_blocked(&self, owner_id: u64) -> bool {
        self.loaded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .ids
            .contains(&owner_id)
    }
}
