//! Integration tests for the call orchestrator against a scripted switch.
//!
//! The mock switch answers the adapter trait in-process, injects events the
//! way the real event link would, and runs a local media-socket server so
//! the capture and playback pipelines connect for real.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use voicegate_core::allowlist::Allowlist;
use voicegate_core::asr::AsrManager;
use voicegate_core::call::events::{event_types, CallEvent, EventBus};
use voicegate_core::call::{BridgeRegistry, CallId, CallRegistry, CallState};
use voicegate_core::config::Config;
use voicegate_core::error::{Error, Result};
use voicegate_core::orchestrator::{Orchestrator, OriginateRequest, TransferRequest};
use voicegate_core::switch::types::{CallerInfo, DialplanInfo};
use voicegate_core::switch::{
    Bridge, Channel, Endpoint, ExternalMediaParams, OriginateParams, Playback, SnoopParams,
    StasisWaiters, StoredRecording, SwitchApi, MEDIA_CONNECTION_VAR,
};
use voicegate_core::tts::{SpeakRequest, TtsClient};
use voicegate_core::util::TimerSet;
use voicegate_core::webhook::WebhookNotifier;

// ----------------------------------------------------------------------
// Mock switch
// ----------------------------------------------------------------------

struct MockSwitch {
    event_tx: mpsc::Sender<voicegate_core::switch::SwitchEvent>,
    media_url: String,
    endpoints: Vec<String>,
    /// Every operation in invocation order, for ordering assertions.
    log: Mutex<Vec<String>>,
    bridge_counter: AtomicUsize,
    auto_finish_playbacks: bool,
    auto_answer_originate: bool,
}

impl MockSwitch {
    fn log_op(&self, op: String) {
        self.log.lock().push(op);
    }

    fn ops(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    fn ops_with(&self, prefix: &str) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter(|op| op.starts_with(prefix))
            .collect()
    }

    fn channel(id: &str) -> Channel {
        Channel {
            id: id.to_string(),
            name: String::new(),
            state: "Up".into(),
            caller: CallerInfo::default(),
            dialplan: DialplanInfo::default(),
            channelvars: None,
        }
    }

    fn media_channel(id: &str) -> Channel {
        let mut channel = Self::channel(id);
        channel.channelvars = Some(serde_json::json!({ MEDIA_CONNECTION_VAR: id }));
        channel
    }

    fn inject_stasis_start(&self, channel_id: &str, caller: &str, exten: &str) {
        let event = serde_json::from_value(serde_json::json!({
            "type": "StasisStart",
            "args": [],
            "channel": {
                "id": channel_id,
                "state": "Ring",
                "caller": { "name": "", "number": caller },
                "dialplan": { "context": "default", "exten": exten },
            },
        }))
        .unwrap();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(event).await;
        });
    }

    fn inject_stasis_end(&self, channel_id: &str) {
        let event = serde_json::from_value(serde_json::json!({
            "type": "StasisEnd",
            "channel": { "id": channel_id },
        }))
        .unwrap();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(event).await;
        });
    }
}

#[async_trait]
impl SwitchApi for MockSwitch {
    async fn originate(&self, params: OriginateParams) -> Result<Channel> {
        self.log_op(format!("originate {}", params.endpoint));
        let id = params
            .channel_id
            .unwrap_or_else(|| "assigned-channel".into());
        if self.auto_answer_originate {
            let tx = self.event_tx.clone();
            let event = serde_json::from_value(serde_json::json!({
                "type": "StasisStart",
                "args": [],
                "channel": { "id": id, "state": "Up" },
            }))
            .unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = tx.send(event).await;
            });
        }
        Ok(Self::channel(&id))
    }

    async fn answer(&self, id: &str) -> Result<()> {
        self.log_op(format!("answer {id}"));
        Ok(())
    }

    async fn ring(&self, id: &str) -> Result<()> {
        self.log_op(format!("ring {id}"));
        Ok(())
    }

    async fn hangup(&self, id: &str, _reason: Option<&str>) -> Result<()> {
        self.log_op(format!("hangup {id}"));
        Ok(())
    }

    async fn play(&self, channel_id: &str, media_uri: &str, playback_id: &str) -> Result<Playback> {
        self.log_op(format!("play {channel_id} {media_uri}"));
        if self.auto_finish_playbacks {
            let tx = self.event_tx.clone();
            let event = serde_json::from_value(serde_json::json!({
                "type": "PlaybackFinished",
                "playback": { "id": playback_id, "media_uri": media_uri, "state": "done" },
            }))
            .unwrap();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let _ = tx.send(event).await;
            });
        }
        Ok(serde_json::from_value(serde_json::json!({
            "id": playback_id,
            "media_uri": media_uri,
            "state": "queued",
        }))
        .unwrap())
    }

    async fn record(
        &self,
        channel_id: &str,
        name: &str,
        format: &str,
        _max_seconds: u32,
    ) -> Result<()> {
        self.log_op(format!("record {channel_id} {name}"));
        // Report a short successful recording shortly after.
        let tx = self.event_tx.clone();
        let event = serde_json::from_value(serde_json::json!({
            "type": "RecordingFinished",
            "recording": { "name": name, "format": format, "state": "done" },
        }))
        .unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            let _ = tx.send(event).await;
        });
        Ok(())
    }

    async fn send_dtmf(&self, channel_id: &str, digits: &str) -> Result<()> {
        self.log_op(format!("dtmf {channel_id} {digits}"));
        Ok(())
    }

    async fn snoop(&self, params: SnoopParams) -> Result<Channel> {
        self.log_op(format!("snoop {}", params.snoop_id));
        Ok(Self::channel(&params.snoop_id))
    }

    async fn external_media(&self, params: ExternalMediaParams) -> Result<Channel> {
        self.log_op(format!("external_media {}", params.channel_id));
        // The channel "enters the app" like the real switch reports it.
        self.inject_stasis_start(&params.channel_id, "", "");
        Ok(Self::media_channel(&params.channel_id))
    }

    async fn create_bridge(&self, name: &str) -> Result<Bridge> {
        let n = self.bridge_counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("bridge-{n}");
        self.log_op(format!("create_bridge {id} {name}"));
        Ok(serde_json::from_value(serde_json::json!({
            "id": id,
            "name": name,
            "bridge_type": "mixing",
            "channels": [],
        }))
        .unwrap())
    }

    async fn get_bridge(&self, id: &str) -> Result<Bridge> {
        Err(Error::not_found("bridge", id))
    }

    async fn list_bridges(&self) -> Result<Vec<Bridge>> {
        Ok(vec![])
    }

    async fn destroy_bridge(&self, id: &str) -> Result<()> {
        self.log_op(format!("destroy_bridge {id}"));
        Ok(())
    }

    async fn add_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        self.log_op(format!("add_to_bridge {bridge_id} {channel_id}"));
        Ok(())
    }

    async fn remove_from_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        self.log_op(format!("remove_from_bridge {bridge_id} {channel_id}"));
        Ok(())
    }

    async fn list_recordings(&self) -> Result<Vec<StoredRecording>> {
        Ok(vec![])
    }

    async fn get_recording(&self, name: &str) -> Result<StoredRecording> {
        Err(Error::not_found("recording", name))
    }

    async fn get_recording_bytes(&self, name: &str) -> Result<Vec<u8>> {
        Err(Error::not_found("recording", name))
    }

    async fn delete_recording(&self, name: &str) -> Result<()> {
        Err(Error::not_found("recording", name))
    }

    async fn copy_recording(&self, name: &str, _destination: &str) -> Result<StoredRecording> {
        Err(Error::not_found("recording", name))
    }

    async fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        Ok(vec![])
    }

    async fn get_endpoint(&self, _technology: &str, resource: &str) -> Result<Endpoint> {
        if self.endpoints.iter().any(|r| r == resource) {
            Ok(serde_json::from_value(serde_json::json!({
                "technology": "PJSIP",
                "resource": resource,
                "state": "online",
            }))
            .unwrap())
        } else {
            Err(Error::not_found("endpoint", resource))
        }
    }

    fn media_socket_url(&self, _connection_id: &str) -> String {
        self.media_url.clone()
    }
}

/// Media-socket server: accepts every connection, discards inbound frames,
/// and lets tests push PCM toward the newest capture connection.
async fn spawn_media_server() -> (String, Arc<Mutex<Vec<mpsc::Sender<Vec<u8>>>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections: Arc<Mutex<Vec<mpsc::Sender<Vec<u8>>>>> = Arc::new(Mutex::new(Vec::new()));
    let registry = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let (push_tx, mut push_rx) = mpsc::channel::<Vec<u8>>(64);
            registry.lock().push(push_tx);
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                loop {
                    tokio::select! {
                        frame = push_rx.recv() => {
                            match frame {
                                Some(data) => {
                                    if ws.send(Message::Binary(data)).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                        incoming = ws.next() => {
                            match incoming {
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(_)) => break,
                            }
                        }
                    }
                }
            });
        }
    });
    (format!("ws://{addr}"), connections)
}

// ----------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------

struct Harness {
    orchestrator: Arc<Orchestrator>,
    switch: Arc<MockSwitch>,
    bus: EventBus,
    timers: Arc<TimerSet>,
    media_connections: Arc<Mutex<Vec<mpsc::Sender<Vec<u8>>>>>,
}

struct HarnessOptions {
    endpoints: Vec<String>,
    tts_url: Option<String>,
    tts_timeout_ms: u64,
    allowlist: Arc<Allowlist>,
    auto_answer_originate: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            endpoints: vec!["9901".into()],
            tts_url: None,
            tts_timeout_ms: 30_000,
            allowlist: Allowlist::allow_all(),
            auto_answer_originate: false,
        }
    }
}

impl Harness {
    async fn new(options: HarnessOptions) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (media_url, media_connections) = spawn_media_server().await;

        let switch = Arc::new(MockSwitch {
            event_tx,
            media_url,
            endpoints: options.endpoints,
            log: Mutex::new(Vec::new()),
            bridge_counter: AtomicUsize::new(0),
            auto_finish_playbacks: true,
            auto_answer_originate: options.auto_answer_originate,
        });

        let mut config = Config::default();
        config.inbound.ring_delay_ms = 50;
        config.tts.url = options.tts_url;
        config.tts.timeout_ms = options.tts_timeout_ms;

        let bus = EventBus::default();
        let timers = TimerSet::new();
        let registry = CallRegistry::new(bus.clone(), Arc::clone(&timers));
        let bridges = Arc::new(BridgeRegistry::new(bus.clone()));
        let webhook = WebhookNotifier::disabled();
        let asr = AsrManager::new(config.asr.clone(), bus.clone(), Arc::clone(&webhook));
        let tts = TtsClient::new(config.tts.clone());
        let waiters = StasisWaiters::new();

        let orchestrator = Orchestrator::new(
            config,
            Arc::clone(&switch) as Arc<dyn SwitchApi>,
            registry,
            bridges,
            options.allowlist,
            asr,
            tts,
            webhook,
            bus.clone(),
            Arc::clone(&timers),
            waiters,
        );

        tokio::spawn(Arc::clone(&orchestrator).run(event_rx));

        Self {
            orchestrator,
            switch,
            bus,
            timers,
            media_connections,
        }
    }

    /// Drive an inbound call all the way to `ready` with its capture
    /// pipeline up, and return its ID.
    async fn inbound_ready_call(
        &self,
        events: &mut tokio::sync::broadcast::Receiver<CallEvent>,
        channel_id: &str,
        caller: &str,
    ) -> CallId {
        self.switch.inject_stasis_start(channel_id, caller, "100");
        let ready = wait_for_event(events, event_types::CALL_READY).await;
        // Auto-capture runs right after ready; wait it out so tests do not
        // race the pipeline setup.
        wait_for_event(events, event_types::CALL_AUDIO_CAPTURE_STARTED).await;
        ready.call_id.expect("ready event carries the call id")
    }

    async fn call_state(&self, call_id: &CallId) -> CallState {
        self.orchestrator
            .registry()
            .get(call_id)
            .await
            .expect("call present")
            .read()
            .await
            .state
    }
}

async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<CallEvent>,
    event_type: &str,
) -> CallEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {event_type}"))
            .expect("event stream closed");
        if event.event_type == event_type {
            return event;
        }
    }
}

/// Collect events for a fixed window.
async fn collect_events(
    events: &mut tokio::sync::broadcast::Receiver<CallEvent>,
    window: Duration,
) -> Vec<CallEvent> {
    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return collected;
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Ok(event)) => collected.push(event),
            Ok(Err(_)) | Err(_) => return collected,
        }
    }
}

fn count(events: &[CallEvent], event_type: &str) -> usize {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .count()
}

// ----------------------------------------------------------------------
// Call flows
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_inbound_happy_path() {
    let harness = Harness::new(HarnessOptions::default()).await;
    let mut events = harness.bus.subscribe();

    harness.switch.inject_stasis_start("ch-abc", "5551234", "100");
    let collected = collect_events(&mut events, Duration::from_millis(900)).await;

    assert_eq!(count(&collected, event_types::CALL_INBOUND), 1);
    assert_eq!(count(&collected, event_types::CALL_ANSWERED), 1);
    assert_eq!(count(&collected, event_types::CALL_READY), 1);
    assert_eq!(count(&collected, event_types::CALL_AUDIO_CAPTURE_ERROR), 0);
    assert_eq!(count(&collected, event_types::CALL_AUDIO_CAPTURE_STARTED), 1);

    // Ring indication, answer after the ring delay, greeting then beep.
    let ops = harness.switch.ops();
    assert!(ops.contains(&"ring ch-abc".to_string()));
    assert!(ops.contains(&"answer ch-abc".to_string()));
    let plays = harness.switch.ops_with("play ch-abc");
    assert_eq!(plays.len(), 2);
    assert!(plays[0].contains("sound:hello-world"));
    assert!(plays[1].contains("sound:beep"));

    // Capture acquired snoop + external media + bridge.
    assert_eq!(harness.switch.ops_with("snoop snoop-").len(), 1);
    assert_eq!(harness.switch.ops_with("external_media audiocap-").len(), 1);
    assert_eq!(harness.switch.ops_with("add_to_bridge").len(), 2);

    let ready = collected
        .iter()
        .find(|e| e.event_type == event_types::CALL_READY)
        .unwrap();
    let call_id = ready.call_id.clone().unwrap();
    assert_eq!(harness.call_state(&call_id).await, CallState::Ready);
}

#[tokio::test]
async fn test_capture_frames_fan_out_to_event_stream() {
    let harness = Harness::new(HarnessOptions::default()).await;
    let mut events = harness.bus.subscribe();
    harness.inbound_ready_call(&mut events, "ch-frames", "5551234").await;

    // Push PCM through the capture socket like the switch would.
    let pushers = harness.media_connections.lock().clone();
    assert!(!pushers.is_empty(), "capture socket connected");
    let frame = vec![0x55u8; 640];
    pushers.last().unwrap().send(frame.clone()).await.unwrap();

    let audio = wait_for_event(&mut events, event_types::CALL_AUDIO_FRAME).await;
    assert_eq!(audio.data["sampleCount"], 320);
    assert_eq!(audio.data["format"], "slin16");
    let decoded =
        voicegate_core::audio::base64_decode_pcm(audio.data["data"].as_str().unwrap()).unwrap();
    assert_eq!(decoded, frame);
}

#[tokio::test]
async fn test_outbound_to_unknown_endpoint_is_not_found() {
    let harness = Harness::new(HarnessOptions::default()).await;

    let err = harness
        .orchestrator
        .originate(OriginateRequest {
            endpoint: "PJSIP/9999".into(),
            ..OriginateRequest::default()
        })
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    // No call record persists.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.orchestrator.registry().snapshots().await.is_empty());
}

#[tokio::test]
async fn test_outbound_happy_path_reaches_answered() {
    let harness = Harness::new(HarnessOptions {
        auto_answer_originate: true,
        ..HarnessOptions::default()
    })
    .await;
    let mut events = harness.bus.subscribe();

    let snapshot = harness
        .orchestrator
        .originate(OriginateRequest {
            endpoint: "PJSIP/9901".into(),
            caller_id: Some("voicegate".into()),
            ..OriginateRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(snapshot.state, CallState::Ringing);

    wait_for_event(&mut events, event_types::CALL_ANSWERED).await;
    assert_eq!(harness.call_state(&snapshot.id).await, CallState::Answered);
}

#[tokio::test]
async fn test_inbound_denied_by_allowlist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("allowlist.json");
    std::fs::write(&path, r#"{"inbound": ["100"], "outbound": []}"#).unwrap();

    let harness = Harness::new(HarnessOptions {
        allowlist: Allowlist::from_file(path),
        ..HarnessOptions::default()
    })
    .await;
    let mut events = harness.bus.subscribe();

    harness.switch.inject_stasis_start("ch-bad", "5551234", "100");
    let collected = collect_events(&mut events, Duration::from_millis(300)).await;

    // Released immediately, recorded as failed, no inbound notification.
    assert_eq!(count(&collected, event_types::CALL_INBOUND), 0);
    assert!(harness.switch.ops().contains(&"hangup ch-bad".to_string()));
    let snapshots = harness.orchestrator.registry().snapshots().await;
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].state, CallState::Failed);
}

#[tokio::test]
async fn test_speak_unconfigured_tts_is_not_implemented() {
    let harness = Harness::new(HarnessOptions::default()).await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-tts", "5551234").await;

    let err = harness
        .orchestrator
        .speak(
            &call_id,
            SpeakRequest {
                text: "hello".into(),
                ..SpeakRequest::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotImplemented(_)));
    assert_eq!(err.http_status(), 501);

    // No speaking transition persisted.
    assert_eq!(harness.call_state(&call_id).await, CallState::Ready);
}

/// Minimal single-shot TTS HTTP server returning a mono 16 kHz WAV.
async fn spawn_tts_server(samples: usize) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                let _ = stream.read(&mut buf).await;
                let wav = voicegate_core::audio::wrap_pcm(&vec![100i16; samples], 16_000);
                let header = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: audio/wav\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    wav.len()
                );
                let _ = stream.write_all(header.as_bytes()).await;
                let _ = stream.write_all(&wav).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://{addr}/synthesize")
}

#[tokio::test]
async fn test_speak_streams_and_finishes() {
    // 0.5 s utterance so the test stays fast.
    let tts_url = spawn_tts_server(8_000).await;
    let harness = Harness::new(HarnessOptions {
        tts_url: Some(tts_url),
        ..HarnessOptions::default()
    })
    .await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-speak", "5551234").await;

    let outcome = harness
        .orchestrator
        .speak(
            &call_id,
            SpeakRequest {
                text: "short".into(),
                ..SpeakRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.voice, "default");
    assert!((outcome.duration_seconds.unwrap() - 0.5).abs() < 0.01);

    let collected = collect_events(&mut events, Duration::from_millis(200)).await;
    assert!(count(&collected, event_types::CALL_SPEAK_FINISHED) >= 1);
    assert_eq!(count(&collected, event_types::CALL_SPEAK_ERROR), 0);

    // Playback pipeline went up against the call channel.
    assert_eq!(harness.switch.ops_with("external_media ttsplay-").len(), 1);
    // State restored after the work state.
    assert_eq!(harness.call_state(&call_id).await, CallState::Ready);
}

#[tokio::test]
async fn test_speak_against_hung_tts_server_is_gateway_timeout() {
    use tokio::io::AsyncReadExt;

    // A TTS server that accepts, reads the request, and never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 65536];
                let _ = stream.read(&mut buf).await;
                tokio::time::sleep(Duration::from_secs(60)).await;
            });
        }
    });

    let harness = Harness::new(HarnessOptions {
        tts_url: Some(format!("http://{addr}/synthesize")),
        tts_timeout_ms: 200,
        ..HarnessOptions::default()
    })
    .await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-hungtts", "5551234").await;

    let err = harness
        .orchestrator
        .speak(
            &call_id,
            SpeakRequest {
                text: "anyone there".into(),
                ..SpeakRequest::default()
            },
        )
        .await
        .unwrap_err();

    // A silent TTS gateway is 504, unlike a transfer no-answer's 408.
    assert!(matches!(
        err,
        Error::Timeout {
            kind: voicegate_core::TimeoutKind::Tts,
            ..
        }
    ));
    assert_eq!(err.http_status(), 504);

    // The failure is reported and the call returns to where it was.
    wait_for_event(&mut events, event_types::CALL_SPEAK_ERROR).await;
    assert_eq!(harness.call_state(&call_id).await, CallState::Ready);
}

#[tokio::test]
async fn test_hangup_during_speak_cancels_cleanly() {
    // 5 s utterance; we hang up 300 ms in.
    let tts_url = spawn_tts_server(80_000).await;
    let harness = Harness::new(HarnessOptions {
        tts_url: Some(tts_url),
        ..HarnessOptions::default()
    })
    .await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-hang", "5551234").await;

    let speak_task = {
        let orchestrator = Arc::clone(&harness.orchestrator);
        let call_id = call_id.clone();
        tokio::spawn(async move {
            orchestrator
                .speak(
                    &call_id,
                    SpeakRequest {
                        text: "long".into(),
                        ..SpeakRequest::default()
                    },
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    let hangup_started = std::time::Instant::now();
    harness.orchestrator.hangup(&call_id, None).await.unwrap();
    let teardown_elapsed = hangup_started.elapsed();

    // The scheduler resolves without a speak error.
    let result = tokio::time::timeout(Duration::from_secs(2), speak_task)
        .await
        .expect("speak resolved promptly after hangup")
        .unwrap();
    assert!(result.is_ok(), "cancelled speak must not error: {result:?}");

    let collected = collect_events(&mut events, Duration::from_millis(200)).await;
    assert_eq!(count(&collected, event_types::CALL_SPEAK_ERROR), 0);

    // Playback bridge and media channel released within a second.
    assert!(teardown_elapsed < Duration::from_secs(1));
    let destroys = harness.switch.ops_with("destroy_bridge");
    assert!(!destroys.is_empty());
    assert!(harness
        .switch
        .ops()
        .iter()
        .any(|op| op.starts_with("hangup ttsplay-")));
    assert_eq!(harness.call_state(&call_id).await, CallState::Ended);
}

#[tokio::test]
async fn test_capture_start_on_ended_call_is_not_found_without_leaks() {
    let harness = Harness::new(HarnessOptions::default()).await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-ended", "5551234").await;

    harness.orchestrator.stop_capture(&call_id).await.unwrap();
    harness.orchestrator.hangup(&call_id, None).await.unwrap();
    let ops_before = harness.switch.ops().len();

    let err = harness.orchestrator.start_capture(&call_id).await.unwrap_err();
    assert!(err.is_not_found());
    // No switch resources were touched.
    assert_eq!(harness.switch.ops().len(), ops_before);
}

#[tokio::test]
async fn test_stop_capture_is_idempotent() {
    let harness = Harness::new(HarnessOptions::default()).await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-idem", "5551234").await;

    harness.orchestrator.stop_capture(&call_id).await.unwrap();
    harness.orchestrator.stop_capture(&call_id).await.unwrap();
    harness
        .orchestrator
        .stop_capture(&CallId::from("no-such-call"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_remote_hangup_tears_capture_down() {
    let harness = Harness::new(HarnessOptions::default()).await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-remote", "5551234").await;

    harness.switch.inject_stasis_end("ch-remote");
    wait_for_event(&mut events, event_types::CALL_ENDED).await;

    assert_eq!(harness.call_state(&call_id).await, CallState::Ended);
    let record = harness.orchestrator.registry().get(&call_id).await.unwrap();
    let record = record.read().await;
    assert!(record.capture.is_none());
    assert!(record.playback.is_none());
    assert!(record.asr.is_none());
    drop(record);

    // Capture plumbing released: snoop + media channels hung up, bridge
    // destroyed.
    let ops = harness.switch.ops();
    assert!(ops.iter().any(|op| op.starts_with("hangup snoop-")));
    assert!(ops.iter().any(|op| op.starts_with("hangup audiocap-")));
    assert!(ops.iter().any(|op| op.starts_with("destroy_bridge")));
}

#[tokio::test]
async fn test_transfer_happy_path() {
    let harness = Harness::new(HarnessOptions {
        auto_answer_originate: true,
        ..HarnessOptions::default()
    })
    .await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-xfer", "5551234").await;

    let result = harness
        .orchestrator
        .transfer(
            &call_id,
            TransferRequest {
                endpoint: "PJSIP/9901".into(),
                caller_id: None,
                timeout_secs: Some(5),
            },
        )
        .await
        .unwrap();

    assert_eq!(harness.call_state(&call_id).await, CallState::Bridged);
    assert_eq!(harness.call_state(&result.call_id).await, CallState::Bridged);
    // Both legs joined the transfer bridge.
    let adds: Vec<_> = harness
        .switch
        .ops_with("add_to_bridge")
        .into_iter()
        .filter(|op| op.contains(&result.bridge_id))
        .collect();
    assert_eq!(adds.len(), 2);
}

#[tokio::test]
async fn test_transfer_timeout_leaves_no_orphan_bridge() {
    let harness = Harness::new(HarnessOptions::default()).await; // no auto-answer
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-xto", "5551234").await;
    let bridges_before = harness.switch.ops_with("create_bridge").len();

    let err = harness
        .orchestrator
        .transfer(
            &call_id,
            TransferRequest {
                endpoint: "PJSIP/9901".into(),
                caller_id: None,
                timeout_secs: Some(1),
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Timeout {
            kind: voicegate_core::TimeoutKind::Transfer,
            ..
        }
    ));
    assert_eq!(err.http_status(), 408);
    // The target leg was hung up and no transfer bridge survives.
    assert!(harness
        .switch
        .ops()
        .iter()
        .any(|op| op.starts_with("hangup xfer-")));
    assert_eq!(
        harness.switch.ops_with("create_bridge").len(),
        bridges_before
    );
    // The original call is untouched.
    assert_eq!(harness.call_state(&call_id).await, CallState::Ready);
}

#[tokio::test]
async fn test_dtmf_validation_and_forwarding() {
    let harness = Harness::new(HarnessOptions::default()).await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-dtmf", "5551234").await;

    harness.orchestrator.send_dtmf(&call_id, "12#*").await.unwrap();
    assert!(harness
        .switch
        .ops()
        .contains(&"dtmf ch-dtmf 12#*".to_string()));

    let err = harness
        .orchestrator
        .send_dtmf(&call_id, "hello")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_shutdown_ends_calls_and_drains_timers() {
    let harness = Harness::new(HarnessOptions::default()).await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-down", "5551234").await;

    harness.orchestrator.shutdown().await;

    assert_eq!(harness.call_state(&call_id).await, CallState::Ended);
    // Delayed-removal and ring timers no longer keep the process alive.
    assert_eq!(harness.timers.pending(), 0);
}

#[tokio::test]
async fn test_play_media_sequence_returns_to_prior_state() {
    let harness = Harness::new(HarnessOptions::default()).await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-play", "5551234").await;

    harness
        .orchestrator
        .play_media(
            &call_id,
            vec!["sound:one".into(), "sound:two".into()],
        )
        .await
        .unwrap();

    let plays = harness.switch.ops_with("play ch-play");
    // Greeting + beep from setup, then the two requested URIs in order.
    assert!(plays[plays.len() - 2].contains("sound:one"));
    assert!(plays[plays.len() - 1].contains("sound:two"));
    assert_eq!(harness.call_state(&call_id).await, CallState::Ready);
}

#[tokio::test]
async fn test_record_holds_and_restores_state() {
    let harness = Harness::new(HarnessOptions::default()).await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-rec", "5551234").await;

    let outcome = harness
        .orchestrator
        .record(&call_id, Some("greeting-check".into()), None, Some(5))
        .await
        .unwrap();
    assert_eq!(outcome.name, "greeting-check");
    assert_eq!(outcome.format, "wav");

    let finished = wait_for_event(&mut events, event_types::CALL_RECORDING_FINISHED).await;
    assert_eq!(finished.data["name"], "greeting-check");
    assert_eq!(harness.call_state(&call_id).await, CallState::Ready);
    assert!(harness
        .switch
        .ops()
        .contains(&"record ch-rec greeting-check".to_string()));
}

#[tokio::test]
async fn test_dtmf_events_reach_the_stream() {
    let harness = Harness::new(HarnessOptions::default()).await;
    let mut events = harness.bus.subscribe();
    let call_id = harness.inbound_ready_call(&mut events, "ch-digit", "5551234").await;

    let event = serde_json::from_value(serde_json::json!({
        "type": "ChannelDtmfReceived",
        "digit": "5",
        "duration_ms": 120,
        "channel": { "id": "ch-digit" },
    }))
    .unwrap();
    harness.orchestrator.handle_event(event).await;

    let dtmf = wait_for_event(&mut events, event_types::CALL_DTMF).await;
    assert_eq!(dtmf.call_id.as_ref(), Some(&call_id));
    assert_eq!(dtmf.data["digit"], "5");
}
