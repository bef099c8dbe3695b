//! In-memory call registry.
//!
//! The registry is a value store plus event emitter: it owns the
//! `CallId -> CallRecord` map, serialises state transitions through each
//! record's lock, and emits the totally-ordered per-call event stream.
//! Ended calls linger for five minutes so late lookups (webhooks, admin
//! polls) still resolve, then a tracked timer removes them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::call::events::{event_types, CallEvent, EventBus};
use crate::call::{CallId, CallRecord, CallSnapshot, CallState};
use crate::error::{Error, Result};
use crate::util::TimerSet;

/// How long an ended call stays visible before removal.
pub const REMOVAL_DELAY: Duration = Duration::from_secs(5 * 60);

pub struct CallRegistry {
    calls: RwLock<HashMap<CallId, Arc<RwLock<CallRecord>>>>,
    by_channel: RwLock<HashMap<String, CallId>>,
    bus: EventBus,
    timers: Arc<TimerSet>,
}

impl CallRegistry {
    pub fn new(bus: EventBus, timers: Arc<TimerSet>) -> Arc<Self> {
        Arc::new(Self {
            calls: RwLock::new(HashMap::new()),
            by_channel: RwLock::new(HashMap::new()),
            bus,
            timers,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn emit(&self, event: CallEvent) {
        self.bus.emit(event);
    }

    /// Register a new call and emit `call.created`.
    pub async fn insert(self: &Arc<Self>, record: CallRecord) -> Arc<RwLock<CallRecord>> {
        let id = record.id.clone();
        let channel_id = record.channel_id.clone();
        let snapshot = record.snapshot();
        let call = Arc::new(RwLock::new(record));

        {
            let mut calls = self.calls.write().await;
            calls.insert(id.clone(), Arc::clone(&call));
        }
        {
            let mut by_channel = self.by_channel.write().await;
            by_channel.insert(channel_id, id.clone());
        }

        self.bus.emit(CallEvent::call(
            event_types::CALL_CREATED,
            &id,
            serde_json::to_value(&snapshot).unwrap_or_default(),
        ));
        // Calls born terminal (e.g. allowlist-denied inbound) still get
        // garbage collected.
        if snapshot.state.is_terminal() {
            self.schedule_removal(id);
        }
        call
    }

    pub async fn get(&self, id: &CallId) -> Option<Arc<RwLock<CallRecord>>> {
        self.calls.read().await.get(id).cloned()
    }

    pub async fn by_channel(&self, channel_id: &str) -> Option<Arc<RwLock<CallRecord>>> {
        let id = self.by_channel.read().await.get(channel_id).cloned()?;
        self.get(&id).await
    }

    pub async fn snapshots(&self) -> Vec<CallSnapshot> {
        let calls: Vec<_> = self.calls.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(calls.len());
        for call in calls {
            snapshots.push(call.read().await.snapshot());
        }
        snapshots
    }

    pub async fn active_count(&self) -> usize {
        let calls: Vec<_> = self.calls.read().await.values().cloned().collect();
        let mut live = 0;
        for call in calls {
            if !call.read().await.state.is_terminal() {
                live += 1;
            }
        }
        live
    }

    /// All live records; used by shutdown to cascade cancellation.
    pub async fn live_calls(&self) -> Vec<Arc<RwLock<CallRecord>>> {
        let calls: Vec<_> = self.calls.read().await.values().cloned().collect();
        let mut live = Vec::new();
        for call in calls {
            if !call.read().await.state.is_terminal() {
                live.push(call);
            }
        }
        live
    }

    /// Apply a state transition, emitting `call.state_changed` while the
    /// record lock is held so per-call event order matches transition order.
    ///
    /// Returns the state the call held before the transition.
    pub async fn transition(
        self: &Arc<Self>,
        call: &Arc<RwLock<CallRecord>>,
        next: CallState,
    ) -> Result<CallState> {
        let (id, previous) = {
            let mut record = call.write().await;
            let previous = record.state;
            if !previous.can_transition_to(next) {
                return Err(Error::Validation(format!(
                    "call {} cannot go {} -> {}",
                    record.id,
                    previous.as_str(),
                    next.as_str()
                )));
            }
            record.state = next;
            match next {
                CallState::Answered if record.answered_at.is_none() => {
                    record.answered_at = Some(chrono::Utc::now());
                }
                CallState::Ended | CallState::Failed if record.ended_at.is_none() => {
                    record.ended_at = Some(chrono::Utc::now());
                }
                _ => {}
            }

            self.bus.emit(CallEvent::call(
                event_types::CALL_STATE_CHANGED,
                &record.id,
                serde_json::json!({
                    "state": next.as_str(),
                    "previous": previous.as_str(),
                }),
            ));
            (record.id.clone(), previous)
        };

        debug!(call = %id, from = previous.as_str(), to = next.as_str(), "state transition");
        if next.is_terminal() {
            self.schedule_removal(id);
        }
        Ok(previous)
    }

    fn schedule_removal(self: &Arc<Self>, id: CallId) {
        let registry = Arc::clone(self);
        self.timers.spawn_after(REMOVAL_DELAY, async move {
            registry.remove(&id).await;
        });
    }

    pub async fn remove(&self, id: &CallId) {
        let removed = {
            let mut calls = self.calls.write().await;
            calls.remove(id)
        };
        if let Some(call) = removed {
            let channel_id = call.read().await.channel_id.clone();
            let mut by_channel = self.by_channel.write().await;
            if by_channel.get(&channel_id).map(|c| c == id).unwrap_or(false) {
                by_channel.remove(&channel_id);
            }
            info!(call = %id, "removed from registry");
        }
    }
}
