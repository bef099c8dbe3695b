//! Administrative view of mixing bridges on the switch.
//!
//! Bridges the orchestrator creates for its own pipelines (capture,
//! playback) are plumbing, not calls; they are registered as owned here and
//! kept out of the admin listing.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::call::events::{event_types, CallEvent, EventBus};
use crate::switch::Bridge;

/// Name prefixes of bridges the pipelines create for themselves.
pub const PLUMBING_BRIDGE_PREFIXES: [&str; 2] = ["capture-", "playback-"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeRecord {
    pub id: String,
    pub name: Option<String>,
    #[serde(rename = "channelIDs")]
    pub channel_ids: HashSet<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    bridges: HashMap<String, BridgeRecord>,
    owned: HashSet<String>,
}

pub struct BridgeRegistry {
    inner: RwLock<Inner>,
    bus: EventBus,
}

impl BridgeRegistry {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            bus,
        }
    }

    /// Mark a bridge as orchestrator plumbing before the switch announces
    /// it, so the announcement is filtered.
    pub fn mark_owned(&self, id: &str) {
        self.inner.write().owned.insert(id.to_string());
    }

    pub fn release_owned(&self, id: &str) {
        self.inner.write().owned.remove(id);
    }

    pub fn on_bridge_created(&self, bridge: &Bridge) {
        // Pipeline bridges carry a plumbing name prefix, which covers the
        // window between the switch announcing the bridge and the pipeline
        // publishing its handle.
        if PLUMBING_BRIDGE_PREFIXES
            .iter()
            .any(|p| bridge.name.starts_with(p))
        {
            return;
        }
        {
            let mut inner = self.inner.write();
            if inner.owned.contains(&bridge.id) {
                return;
            }
            inner.bridges.insert(
                bridge.id.clone(),
                BridgeRecord {
                    id: bridge.id.clone(),
                    name: (!bridge.name.is_empty()).then(|| bridge.name.clone()),
                    channel_ids: bridge.channels.iter().cloned().collect(),
                    created_at: Utc::now(),
                },
            );
        }
        self.bus.emit(CallEvent::bridge(
            event_types::BRIDGE_CREATED,
            serde_json::json!({ "bridgeID": bridge.id, "name": bridge.name }),
        ));
    }

    pub fn on_bridge_destroyed(&self, bridge_id: &str) {
        let was_tracked = {
            let mut inner = self.inner.write();
            inner.owned.remove(bridge_id);
            inner.bridges.remove(bridge_id).is_some()
        };
        if was_tracked {
            self.bus.emit(CallEvent::bridge(
                event_types::BRIDGE_DESTROYED,
                serde_json::json!({ "bridgeID": bridge_id }),
            ));
        }
    }

    /// Seed from a switch listing, e.g. after a restart. Plumbing-named
    /// bridges are skipped; no events are emitted for pre-existing bridges.
    pub fn sync_from(&self, bridges: &[Bridge]) {
        let mut inner = self.inner.write();
        for bridge in bridges {
            if PLUMBING_BRIDGE_PREFIXES
                .iter()
                .any(|p| bridge.name.starts_with(p))
                || inner.bridges.contains_key(&bridge.id)
            {
                continue;
            }
            inner.bridges.insert(
                bridge.id.clone(),
                BridgeRecord {
                    id: bridge.id.clone(),
                    name: (!bridge.name.is_empty()).then(|| bridge.name.clone()),
                    channel_ids: bridge.channels.iter().cloned().collect(),
                    created_at: Utc::now(),
                },
            );
        }
    }

    pub fn get(&self, id: &str) -> Option<BridgeRecord> {
        self.inner.read().bridges.get(id).cloned()
    }

    pub fn list(&self) -> Vec<BridgeRecord> {
        self.inner.read().bridges.values().cloned().collect()
    }
}
