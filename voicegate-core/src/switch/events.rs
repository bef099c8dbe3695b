//! Event link to the switch.
//!
//! One long-lived WebSocket carries every event for our application. The
//! pump owns the connection, parses events, and forwards them over a single
//! mpsc channel; reconnect tears the old read loop down completely before a
//! new one attaches, so listeners never double up across reconnects.

use dashmap::DashMap;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::switch::types::SwitchEvent;
use crate::switch::RECONNECT_DELAY;

/// One-shot rendezvous for synthetic channels entering the application.
///
/// Server-mode external-media channels only become bridgeable once their
/// socket side is up; pipelines register the channel ID they minted here and
/// block until the switch reports the channel in our app (`true`) or gone
/// (`false`).
#[derive(Default)]
pub struct StasisWaiters {
    waiters: DashMap<String, oneshot::Sender<bool>>,
}

impl StasisWaiters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in `channel_id` before asking the switch to create
    /// it, so the event cannot race the registration.
    pub fn register(&self, channel_id: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(channel_id.to_string(), tx);
        rx
    }

    /// The channel entered the application.
    pub fn complete(&self, channel_id: &str) {
        if let Some((_, tx)) = self.waiters.remove(channel_id) {
            let _ = tx.send(true);
        }
    }

    /// The channel went away before entering the application.
    pub fn fail(&self, channel_id: &str) {
        if let Some((_, tx)) = self.waiters.remove(channel_id) {
            let _ = tx.send(false);
        }
    }

    pub fn forget(&self, channel_id: &str) {
        self.waiters.remove(channel_id);
    }
}

/// Spawn the event pump. Events arrive on `tx` in switch order; `link_up`
/// flips with connectivity. The task runs until `tx` has no receiver left.
pub fn spawn_event_pump(
    events_url: String,
    link_up: Arc<AtomicBool>,
    tx: mpsc::Sender<SwitchEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match connect_async(&events_url).await {
                Ok((mut stream, _)) => {
                    link_up.store(true, Ordering::SeqCst);
                    info!("switch event link established");

                    while let Some(message) = stream.next().await {
                        match message {
                            Ok(Message::Text(text)) => {
                                match serde_json::from_str::<SwitchEvent>(&text) {
                                    Ok(SwitchEvent::Unknown) => {
                                        debug!("ignoring unrecognized switch event");
                                    }
                                    Ok(event) => {
                                        if tx.send(event).await.is_err() {
                                            // Receiver gone: the service is
                                            // shutting down.
                                            return;
                                        }
                                    }
                                    Err(e) => {
                                        warn!("malformed switch event: {e}");
                                    }
                                }
                            }
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(e) => {
                                warn!("switch event link error: {e}");
                                break;
                            }
                        }
                    }

                    link_up.store(false, Ordering::SeqCst);
                    warn!(
                        "switch event link dropped, reconnecting in {}s",
                        RECONNECT_DELAY.as_secs()
                    );
                }
                Err(e) => {
                    link_up.store(false, Ordering::SeqCst);
                    warn!(
                        "switch event link connect failed ({e}), retrying in {}s",
                        RECONNECT_DELAY.as_secs()
                    );
                }
            }

            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    })
}
