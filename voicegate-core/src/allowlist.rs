//! Caller/destination allowlist.
//!
//! A pure predicate over number strings, loaded from a JSON file and
//! hot-reloaded when the file changes on disk. An empty list allows
//! everything; a missing file allows everything.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AllowlistRules {
    pub inbound: Vec<String>,
    pub outbound: Vec<String>,
}

pub struct Allowlist {
    rules: RwLock<AllowlistRules>,
    path: Option<PathBuf>,
    mtime: RwLock<Option<SystemTime>>,
}

impl Allowlist {
    /// Allow everything; used when no allowlist file is configured.
    pub fn allow_all() -> Arc<Self> {
        Arc::new(Self {
            rules: RwLock::new(AllowlistRules::default()),
            path: None,
            mtime: RwLock::new(None),
        })
    }

    pub fn from_file(path: PathBuf) -> Arc<Self> {
        let list = Arc::new(Self {
            rules: RwLock::new(AllowlistRules::default()),
            path: Some(path),
            mtime: RwLock::new(None),
        });
        list.reload();
        list
    }

    /// Current rules, for administrative inspection.
    pub fn rules(&self) -> AllowlistRules {
        self.rules.read().clone()
    }

    pub fn allows_inbound(&self, caller_number: &str) -> bool {
        let rules = self.rules.read();
        rules.inbound.is_empty() || rules.inbound.iter().any(|n| n == caller_number)
    }

    pub fn allows_outbound(&self, destination: &str) -> bool {
        let rules = self.rules.read();
        rules.outbound.is_empty() || rules.outbound.iter().any(|n| n == destination)
    }

    /// Re-read the file. Parse failures keep the previous rules.
    pub fn reload(&self) {
        let Some(path) = &self.path else { return };
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<AllowlistRules>(&raw) {
                Ok(rules) => {
                    info!(
                        inbound = rules.inbound.len(),
                        outbound = rules.outbound.len(),
                        "allowlist loaded from {}",
                        path.display()
                    );
                    *self.rules.write() = rules;
                }
                Err(e) => warn!("allowlist {} unparsable, keeping previous: {e}", path.display()),
            },
            Err(e) => warn!("allowlist {} unreadable, allowing all: {e}", path.display()),
        }
        *self.mtime.write() = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    }

    /// Poll the file's mtime and reload on change.
    pub fn spawn_watcher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let path = self.path.clone()?;
        let list = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                let current = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
                let changed = current != *list.mtime.read();
                if changed {
                    info!("allowlist {} changed on disk, reloading", path.display());
                    list.reload();
                }
            }
        }))
    }
}
