//! Process-wide registry of deferred work.
//!
//! Ring-delay answers and delayed call removal both run on timers that must
//! not outlive shutdown; otherwise an ended call keeps the process alive for
//! five more minutes. Every deferred task registers here and shutdown drains
//! the set deterministically.

use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct TimerSet {
    next_id: AtomicU64,
    tasks: DashMap<u64, JoinHandle<()>>,
}

impl TimerSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `work` after `delay`. The timer unregisters itself once fired.
    pub fn spawn_after<F>(self: &Arc<Self>, delay: Duration, work: F) -> u64
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let set = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            work.await;
            set.tasks.remove(&id);
        });
        self.tasks.insert(id, handle);
        id
    }

    /// Abort a pending timer. No-op if it already fired.
    pub fn cancel(&self, id: u64) {
        if let Some((_, handle)) = self.tasks.remove(&id) {
            handle.abort();
        }
    }

    /// Abort everything still pending.
    pub fn shutdown(&self) {
        self.tasks.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }
}
