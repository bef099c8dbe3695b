//! Streaming ASR client.
//!
//! One WebSocket per call. The client locks the language on open (the
//! server auto-detects per chunk otherwise and flips between languages on
//! silence), then streams raw slin16 PCM as binary frames. Replies are JSON:
//! informational statuses, errors, and transcriptions with partial/final
//! flags. Close must not drop the last utterance: it flushes, waits briefly
//! for a final, and only then closes the socket.

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::call::events::{event_types, CallEvent, EventBus};
use crate::call::CallId;
use crate::config::AsrConfig;
use crate::webhook::WebhookNotifier;

/// How long `close()` waits for a final transcription after `flush`.
const FLUSH_DEADLINE: Duration = Duration::from_secs(2);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Server reply. One message carries exactly one of the three shapes;
/// optional fields cover all of them.
#[derive(Debug, Deserialize)]
struct ServerMessage {
    status: Option<String>,
    error: Option<String>,
    text: Option<String>,
    #[serde(default)]
    is_partial: bool,
    #[serde(default)]
    is_final: bool,
}

enum Control {
    Flush,
    Reset,
    Close(oneshot::Sender<()>),
}

enum ConnExit {
    /// `close()` drove the flush-and-close sequence to completion.
    Closed,
    /// The socket dropped without us asking.
    Dropped,
}

/// Per-call ASR session handle. Cheap to clone via `Arc`; the driver task
/// owns the socket lifecycle including reconnects.
pub struct AsrSession {
    call_id: CallId,
    audio_tx: mpsc::Sender<Vec<u8>>,
    control_tx: mpsc::Sender<Control>,
    closed: Arc<AtomicBool>,
}

impl AsrSession {
    /// Queue one PCM frame. Frames are dropped (with a debug log) rather
    /// than blocking the capture pipeline when the socket falls behind.
    pub fn feed(&self, pcm: Vec<u8>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.audio_tx.try_send(pcm).is_err() {
            debug!(call = %self.call_id, "asr backlog full, dropping frame");
        }
    }

    /// Ask the server for a final over whatever it has buffered.
    pub async fn flush(&self) {
        let _ = self.control_tx.send(Control::Flush).await;
    }

    /// Ask the server to discard buffered state.
    pub async fn reset(&self) {
        let _ = self.control_tx.send(Control::Reset).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flush-and-close. Any final transcription the server produces between
    /// the flush and the close is emitted before this returns.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.control_tx.send(Control::Close(ack_tx)).await.is_ok() {
            // Margin over the driver's own flush deadline.
            let _ = tokio::time::timeout(FLUSH_DEADLINE + Duration::from_secs(1), ack_rx).await;
        }
    }
}

/// Owns every live [`AsrSession`]. One session per call at a time.
pub struct AsrManager {
    config: AsrConfig,
    bus: EventBus,
    webhook: Arc<WebhookNotifier>,
    sessions: Arc<DashMap<CallId, Arc<AsrSession>>>,
}

impl AsrManager {
    pub fn new(config: AsrConfig, bus: EventBus, webhook: Arc<WebhookNotifier>) -> Arc<Self> {
        Arc::new(Self {
            config,
            bus,
            webhook,
            sessions: Arc::new(DashMap::new()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.config.url.is_some()
    }

    /// Open (or return the existing) session for a call. `None` when no ASR
    /// server is configured.
    pub fn start_session(&self, call_id: &CallId) -> Option<Arc<AsrSession>> {
        let url = self.config.url.clone()?;
        if let Some(existing) = self.sessions.get(call_id) {
            return Some(Arc::clone(existing.value()));
        }

        let (audio_tx, audio_rx) = mpsc::channel(512);
        let (control_tx, control_rx) = mpsc::channel(16);
        let session = Arc::new(AsrSession {
            call_id: call_id.clone(),
            audio_tx,
            control_tx,
            closed: Arc::new(AtomicBool::new(false)),
        });
        self.sessions.insert(call_id.clone(), Arc::clone(&session));

        let driver = Driver {
            call_id: call_id.clone(),
            url,
            language: self.config.language.clone(),
            reconnect_delay: self.config.reconnect_delay(),
            max_attempts: self.config.max_reconnect_attempts,
            closed: Arc::clone(&session.closed),
            bus: self.bus.clone(),
            webhook: Arc::clone(&self.webhook),
            sessions: Arc::clone(&self.sessions),
        };
        tokio::spawn(driver.run(audio_rx, control_rx));

        info!(call = %call_id, "asr session started");
        Some(session)
    }

    pub fn session(&self, call_id: &CallId) -> Option<Arc<AsrSession>> {
        self.sessions.get(call_id).map(|s| Arc::clone(s.value()))
    }

    pub async fn close_session(&self, call_id: &CallId) {
        if let Some((_, session)) = self.sessions.remove(call_id) {
            session.close().await;
        }
    }

    pub async fn shutdown(&self) {
        let ids: Vec<CallId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close_session(&id).await;
        }
    }
}

/// Socket lifecycle: connect, stream, reconnect with bounded retries, and
/// run the flush-and-close ordering on request.
struct Driver {
    call_id: CallId,
    url: String,
    language: String,
    reconnect_delay: Duration,
    max_attempts: u32,
    closed: Arc<AtomicBool>,
    bus: EventBus,
    webhook: Arc<WebhookNotifier>,
    sessions: Arc<DashMap<CallId, Arc<AsrSession>>>,
}

impl Driver {
    async fn run(
        self,
        mut audio_rx: mpsc::Receiver<Vec<u8>>,
        mut control_rx: mpsc::Receiver<Control>,
    ) {
        let mut attempts: u32 = 0;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }
            match connect_async(&self.url).await {
                Ok((stream, _)) => {
                    attempts = 0;
                    debug!(call = %self.call_id, "asr socket open");
                    match self
                        .run_connection(stream, &mut audio_rx, &mut control_rx)
                        .await
                    {
                        ConnExit::Closed => break,
                        ConnExit::Dropped => {
                            if self.closed.load(Ordering::SeqCst) {
                                break;
                            }
                            attempts += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(call = %self.call_id, "asr connect failed: {e}");
                    attempts += 1;
                }
            }

            if self.max_attempts != 0 && attempts >= self.max_attempts {
                warn!(call = %self.call_id, attempts, "asr reconnect attempts exhausted");
                break;
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }

        // Whoever is still waiting on a close ack gets released.
        while let Ok(ctrl) = control_rx.try_recv() {
            if let Control::Close(ack) = ctrl {
                let _ = ack.send(());
            }
        }
        self.closed.store(true, Ordering::SeqCst);
        // Only drop our own registration; a replacement session for the
        // same call must survive.
        self.sessions
            .remove_if(&self.call_id, |_, s| Arc::ptr_eq(&s.closed, &self.closed));
        self.bus.emit(CallEvent::call(
            event_types::CALL_ASR_DISCONNECTED,
            &self.call_id,
            serde_json::json!({}),
        ));
        info!(call = %self.call_id, "asr session finished");
    }

    async fn run_connection(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        audio_rx: &mut mpsc::Receiver<Vec<u8>>,
        control_rx: &mut mpsc::Receiver<Control>,
    ) -> ConnExit {
        let (mut sink, mut source) = stream.split();

        // Lock the language before any audio.
        let config = serde_json::json!({ "action": "config", "language": self.language });
        if sink.send(Message::Text(config.to_string())).await.is_err() {
            return ConnExit::Dropped;
        }

        loop {
            tokio::select! {
                frame = audio_rx.recv() => {
                    match frame {
                        Some(pcm) => {
                            if sink.send(Message::Binary(pcm)).await.is_err() {
                                return ConnExit::Dropped;
                            }
                        }
                        // Session handle dropped entirely.
                        None => return ConnExit::Closed,
                    }
                }
                control = control_rx.recv() => {
                    match control {
                        Some(Control::Flush) => {
                            let action = r#"{"action":"flush"}"#;
                            if sink.send(Message::Text(action.into())).await.is_err() {
                                return ConnExit::Dropped;
                            }
                        }
                        Some(Control::Reset) => {
                            let action = r#"{"action":"reset"}"#;
                            if sink.send(Message::Text(action.into())).await.is_err() {
                                return ConnExit::Dropped;
                            }
                        }
                        Some(Control::Close(ack)) => {
                            self.close_sequence(&mut sink, &mut source).await;
                            let _ = ack.send(());
                            return ConnExit::Closed;
                        }
                        None => return ConnExit::Closed,
                    }
                }
                message = source.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_server_message(&text);
                        }
                        Some(Ok(Message::Close(_))) | None => return ConnExit::Dropped,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(call = %self.call_id, "asr socket error: {e}");
                            return ConnExit::Dropped;
                        }
                    }
                }
            }
        }
    }

    /// Flush, wait (bounded) for a final over the buffered audio, emit it,
    /// then close the socket. Deadline or server-side close resolve without
    /// error.
    async fn close_sequence(&self, sink: &mut WsSink, source: &mut WsSource) {
        let _ = sink
            .send(Message::Text(r#"{"action":"flush"}"#.into()))
            .await;

        let deadline = tokio::time::Instant::now() + FLUSH_DEADLINE;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                debug!(call = %self.call_id, "asr flush deadline elapsed");
                break;
            }
            match tokio::time::timeout(remaining, source.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    if self.handle_server_message(&text) {
                        break;
                    }
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(_))) => break,
                Err(_) => {
                    debug!(call = %self.call_id, "asr flush deadline elapsed");
                    break;
                }
            }
        }

        let _ = sink.send(Message::Close(None)).await;
    }

    /// Returns true when the message was a final transcription.
    fn handle_server_message(&self, raw: &str) -> bool {
        let message: ServerMessage = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(call = %self.call_id, "malformed asr message: {e}");
                return false;
            }
        };

        if let Some(status) = message.status {
            debug!(call = %self.call_id, %status, "asr status");
            return false;
        }
        if let Some(error) = message.error {
            warn!(call = %self.call_id, "asr server error: {error}");
            self.bus.emit(CallEvent::call(
                event_types::CALL_ASR_ERROR,
                &self.call_id,
                serde_json::json!({ "error": error }),
            ));
            return false;
        }
        if let Some(text) = message.text {
            let data = serde_json::json!({
                "text": text,
                "isPartial": message.is_partial,
                "isFinal": message.is_final,
            });
            self.bus.emit(CallEvent::call(
                event_types::CALL_TRANSCRIPTION,
                &self.call_id,
                data.clone(),
            ));
            if message.is_final {
                let mut payload = data;
                payload["callID"] = serde_json::json!(self.call_id);
                self.webhook.notify(event_types::CALL_TRANSCRIPTION, payload);
            }
            return message.is_final;
        }
        false
    }
}
