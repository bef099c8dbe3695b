//! Per-call orchestration.
//!
//! The orchestrator drives the call lifecycle state machine: it consumes
//! switch events, runs the inbound answer flow (ring delay, greeting, beep,
//! auto-capture), exposes the operations the admin surface calls, and owns
//! the cancellation cascade that tears a call's pipelines, ASR session, and
//! TTS request down when the call ends, from any path.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allowlist::Allowlist;
use crate::asr::AsrManager;
use crate::call::events::{event_types, CallEvent, EventBus};
use crate::call::{
    BridgeRegistry, CallDirection, CallId, CallRecord, CallRegistry, CallSnapshot, CallState,
};
use crate::capture::{self, CaptureInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::playback;
use crate::switch::{
    is_synthetic_channel_id, Channel, OriginateParams, StasisWaiters, SwitchApi, SwitchEvent,
};
use crate::tts::{SpeakRequest, TtsClient};
use crate::util::TimerSet;
use crate::webhook::WebhookNotifier;
use crate::audio::{parse_wav, prepare_for_playback};

/// Upper bound on waiting for a switch-side playback to finish.
const PLAY_WAIT_DEADLINE: Duration = Duration::from_secs(120);

/// Default wait for a transfer target to answer.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
pub struct OriginateRequest {
    pub endpoint: String,
    pub caller_id: Option<String>,
    pub timeout_secs: Option<u32>,
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct TransferRequest {
    pub endpoint: String,
    pub caller_id: Option<String>,
    pub timeout_secs: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResult {
    #[serde(rename = "newBridgeID")]
    pub bridge_id: String,
    #[serde(rename = "newCallID")]
    pub call_id: CallId,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakOutcome {
    pub voice: String,
    pub language: String,
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOutcome {
    pub name: String,
    pub format: String,
}

struct PlaybackWaiter {
    call_id: CallId,
    tx: oneshot::Sender<()>,
}

struct RecordingWaiter {
    call_id: CallId,
    tx: oneshot::Sender<bool>,
}

pub struct Orchestrator {
    config: Config,
    switch: Arc<dyn SwitchApi>,
    registry: Arc<CallRegistry>,
    bridges: Arc<BridgeRegistry>,
    allowlist: Arc<Allowlist>,
    asr: Arc<AsrManager>,
    tts: Arc<TtsClient>,
    webhook: Arc<WebhookNotifier>,
    bus: EventBus,
    timers: Arc<TimerSet>,
    waiters: Arc<StasisWaiters>,
    playback_waiters: DashMap<String, PlaybackWaiter>,
    recording_waiters: DashMap<String, RecordingWaiter>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        switch: Arc<dyn SwitchApi>,
        registry: Arc<CallRegistry>,
        bridges: Arc<BridgeRegistry>,
        allowlist: Arc<Allowlist>,
        asr: Arc<AsrManager>,
        tts: Arc<TtsClient>,
        webhook: Arc<WebhookNotifier>,
        bus: EventBus,
        timers: Arc<TimerSet>,
        waiters: Arc<StasisWaiters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            switch,
            registry,
            bridges,
            allowlist,
            asr,
            tts,
            webhook,
            bus,
            timers,
            waiters,
            playback_waiters: DashMap::new(),
            recording_waiters: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Arc<CallRegistry> {
        &self.registry
    }

    pub fn bridge_registry(&self) -> &Arc<BridgeRegistry> {
        &self.bridges
    }

    pub fn switch(&self) -> &Arc<dyn SwitchApi> {
        &self.switch
    }

    pub fn allowlist(&self) -> &Arc<Allowlist> {
        &self.allowlist
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Consume the switch event stream until it closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<SwitchEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        info!("switch event stream closed");
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    pub async fn handle_event(self: &Arc<Self>, event: SwitchEvent) {
        match event {
            SwitchEvent::StasisStart { channel, .. } => {
                if is_synthetic_channel_id(&channel.id) {
                    // Pipeline / transfer channels entering the app unblock
                    // their waiters; they never become inbound calls.
                    self.waiters.complete(&channel.id);
                    return;
                }
                if let Some(call) = self.registry.by_channel(&channel.id).await {
                    // An originated leg enters the app once the far end
                    // answers.
                    self.mark_answered(&call).await;
                } else {
                    self.handle_inbound(channel).await;
                }
            }
            SwitchEvent::StasisEnd { channel } => {
                if is_synthetic_channel_id(&channel.id) {
                    self.waiters.fail(&channel.id);
                }
                if let Some(call) = self.registry.by_channel(&channel.id).await {
                    self.end_call(&call, Some("remote hangup".into())).await;
                }
            }
            SwitchEvent::ChannelDestroyed {
                channel,
                cause_txt,
                cause,
            } => {
                if is_synthetic_channel_id(&channel.id) {
                    self.waiters.fail(&channel.id);
                }
                if let Some(call) = self.registry.by_channel(&channel.id).await {
                    let cause = if cause_txt.is_empty() {
                        format!("cause {cause}")
                    } else {
                        cause_txt
                    };
                    self.end_call(&call, Some(cause)).await;
                }
            }
            SwitchEvent::ChannelStateChange { channel } => {
                if is_synthetic_channel_id(&channel.id) {
                    return;
                }
                if channel.state == "Up" {
                    if let Some(call) = self.registry.by_channel(&channel.id).await {
                        self.mark_answered(&call).await;
                    }
                }
            }
            SwitchEvent::ChannelDtmfReceived { digit, duration_ms, channel } => {
                if is_synthetic_channel_id(&channel.id) {
                    return;
                }
                if let Some(call) = self.registry.by_channel(&channel.id).await {
                    let call_id = call.read().await.id.clone();
                    let data = serde_json::json!({
                        "digit": digit,
                        "durationMs": duration_ms,
                        "callID": call_id,
                    });
                    self.bus
                        .emit(CallEvent::call(event_types::CALL_DTMF, &call_id, data.clone()));
                    self.webhook.notify(event_types::CALL_DTMF, data);
                }
            }
            SwitchEvent::PlaybackFinished { playback } => {
                if let Some((_, waiter)) = self.playback_waiters.remove(&playback.id) {
                    self.bus.emit(CallEvent::call(
                        event_types::CALL_PLAYBACK_FINISHED,
                        &waiter.call_id,
                        serde_json::json!({ "mediaURI": playback.media_uri }),
                    ));
                    let _ = waiter.tx.send(());
                }
            }
            SwitchEvent::RecordingFinished { recording } => {
                if let Some((_, waiter)) = self.recording_waiters.remove(&recording.name) {
                    self.bus.emit(CallEvent::call(
                        event_types::CALL_RECORDING_FINISHED,
                        &waiter.call_id,
                        serde_json::json!({
                            "name": recording.name,
                            "format": recording.format,
                        }),
                    ));
                    let _ = waiter.tx.send(true);
                }
            }
            SwitchEvent::RecordingFailed { recording } => {
                if let Some((_, waiter)) = self.recording_waiters.remove(&recording.name) {
                    warn!(recording = %recording.name, cause = %recording.cause, "recording failed");
                    let _ = waiter.tx.send(false);
                }
            }
            SwitchEvent::BridgeCreated { bridge } => {
                self.bridges.on_bridge_created(&bridge);
            }
            SwitchEvent::BridgeDestroyed { bridge } => {
                self.bridges.on_bridge_destroyed(&bridge.id);
                self.unbridge_calls(&bridge.id).await;
            }
            SwitchEvent::PlaybackStarted { .. }
            | SwitchEvent::ChannelVarset { .. }
            | SwitchEvent::Dial { .. }
            | SwitchEvent::Unknown => {}
        }
    }

    /// Inbound new-channel flow: allowlist, ring indication, deferred
    /// answer.
    async fn handle_inbound(self: &Arc<Self>, channel: Channel) {
        let caller = channel.caller.number.clone();
        let callee = channel.dialplan.exten.clone();

        if !self.allowlist.allows_inbound(&caller) {
            warn!(caller = %caller, channel = %channel.id, "inbound call denied by allowlist");
            let mut record = CallRecord::new(
                CallId::generate(),
                &channel.id,
                CallDirection::Inbound,
                &caller,
                &callee,
                CallState::Failed,
            );
            record.ended_at = Some(chrono::Utc::now());
            record.hangup_cause = Some("denied by allowlist".into());
            self.registry.insert(record).await;
            let _ = self.switch.hangup(&channel.id, Some("normal")).await;
            return;
        }

        let call_id = CallId::generate();
        info!(call = %call_id, caller = %caller, channel = %channel.id, "inbound call");
        let record = CallRecord::new(
            call_id.clone(),
            &channel.id,
            CallDirection::Inbound,
            &caller,
            &callee,
            CallState::Ringing,
        );
        let snapshot = record.snapshot();
        let call = self.registry.insert(record).await;

        let data = serde_json::to_value(&snapshot).unwrap_or_default();
        self.bus
            .emit(CallEvent::call(event_types::CALL_INBOUND, &call_id, data.clone()));
        self.webhook.notify(event_types::CALL_INBOUND, data);

        // The caller hears ringing until the answer timer fires.
        if let Err(e) = self.switch.ring(&channel.id).await {
            warn!(call = %call_id, "ring indication failed: {e}");
        }

        let orchestrator = Arc::clone(self);
        self.timers
            .spawn_after(self.config.inbound.ring_delay(), async move {
                orchestrator.answer_inbound(call).await;
            });
    }

    /// Ring-delay expiry: answer, play greeting and beep, go ready, start
    /// capture and transcription.
    async fn answer_inbound(self: &Arc<Self>, call: Arc<RwLock<CallRecord>>) {
        let (call_id, channel_id, state) = {
            let record = call.read().await;
            (record.id.clone(), record.channel_id.clone(), record.state)
        };
        if state.is_terminal() {
            debug!(call = %call_id, "ended before the answer timer fired");
            return;
        }

        if let Err(e) = self.switch.answer(&channel_id).await {
            warn!(call = %call_id, "answer failed: {e}");
            self.end_call(&call, Some("answer failed".into())).await;
            return;
        }
        if self.registry.transition(&call, CallState::Answered).await.is_err() {
            return;
        }
        self.emit_and_notify(&call_id, event_types::CALL_ANSWERED).await;

        for media in [
            self.config.inbound.greeting.clone(),
            self.config.inbound.beep.clone(),
        ] {
            if let Err(e) = self.play_and_wait(&call_id, &channel_id, &media).await {
                warn!(call = %call_id, "greeting playback failed: {e}");
                break;
            }
        }

        if self.registry.transition(&call, CallState::Ready).await.is_err() {
            return;
        }
        self.emit_and_notify(&call_id, event_types::CALL_READY).await;

        if let Err(e) = self.start_capture_on(&call).await {
            if !matches!(e, Error::NotFound { .. }) {
                warn!(call = %call_id, "auto capture failed: {e}");
                self.bus.emit(CallEvent::call(
                    event_types::CALL_AUDIO_CAPTURE_ERROR,
                    &call_id,
                    serde_json::json!({ "error": e.to_string() }),
                ));
            }
        }
    }

    async fn mark_answered(&self, call: &Arc<RwLock<CallRecord>>) {
        let state = call.read().await.state;
        if !matches!(state, CallState::Initiating | CallState::Ringing) {
            return;
        }
        if state == CallState::Initiating {
            // Originate response raced the answer event.
            let _ = self.registry.transition(call, CallState::Ringing).await;
        }
        if self.registry.transition(call, CallState::Answered).await.is_ok() {
            let call_id = call.read().await.id.clone();
            self.emit_and_notify(&call_id, event_types::CALL_ANSWERED).await;
        }
    }

    async fn emit_and_notify(&self, call_id: &CallId, event_type: &str) {
        let data = match self.registry.get(call_id).await {
            Some(call) => {
                serde_json::to_value(call.read().await.snapshot()).unwrap_or_default()
            }
            None => serde_json::json!({ "callID": call_id }),
        };
        self.bus.emit(CallEvent::call(event_type, call_id, data.clone()));
        self.webhook.notify(event_type, data);
    }

    /// Restore any call that was parked in `bridged` on this bridge.
    async fn unbridge_calls(self: &Arc<Self>, bridge_id: &str) {
        for call in self.registry.live_calls().await {
            let matches = {
                let record = call.read().await;
                record.state == CallState::Bridged
                    && record.bridge_id.as_deref() == Some(bridge_id)
            };
            if matches {
                call.write().await.bridge_id = None;
                self.leave_work_state(&call).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Place an outbound call.
    pub async fn originate(self: &Arc<Self>, request: OriginateRequest) -> Result<CallSnapshot> {
        if !self.switch.connected() {
            return Err(Error::Unavailable("switch event link is down".into()));
        }
        let (technology, resource) = request
            .endpoint
            .split_once('/')
            .ok_or_else(|| Error::Validation("endpoint must be technology/resource".into()))?;
        if technology.is_empty() || resource.is_empty() {
            return Err(Error::Validation("endpoint must be technology/resource".into()));
        }

        // Reachability first, then policy.
        self.switch.get_endpoint(technology, resource).await?;
        if !self.allowlist.allows_outbound(resource) {
            return Err(Error::Forbidden(format!(
                "destination {resource} not in outbound allowlist"
            )));
        }

        let call_id = CallId::generate();
        let channel_id = format!("og-{call_id}");
        let record = CallRecord::new(
            call_id.clone(),
            &channel_id,
            CallDirection::Outbound,
            request.caller_id.clone().unwrap_or_default(),
            resource,
            CallState::Initiating,
        );
        let call = self.registry.insert(record).await;
        info!(call = %call_id, endpoint = %request.endpoint, "originating");

        let params = OriginateParams {
            endpoint: request.endpoint.clone(),
            caller_id: request.caller_id.clone(),
            timeout_secs: request.timeout_secs,
            channel_id: Some(channel_id),
            variables: request.variables.clone(),
        };
        if let Err(e) = self.switch.originate(params).await {
            let _ = self.registry.transition(&call, CallState::Failed).await;
            return Err(e);
        }

        // The answer event may already have raced the call past ringing.
        let _ = self.registry.transition(&call, CallState::Ringing).await;
        let snapshot = call.read().await.snapshot();
        Ok(snapshot)
    }

    /// Hang a call up. Switch-side failures are swallowed; the channel may
    /// already be gone.
    pub async fn hangup(self: &Arc<Self>, call_id: &CallId, reason: Option<String>) -> Result<()> {
        let call = self
            .registry
            .get(call_id)
            .await
            .ok_or_else(|| Error::not_found("call", call_id.to_string()))?;
        self.end_call(&call, reason.or_else(|| Some("requested".into())))
            .await;
        Ok(())
    }

    /// Play one or more media URIs through the switch, sequentially,
    /// failing fast.
    pub async fn play_media(self: &Arc<Self>, call_id: &CallId, media: Vec<String>) -> Result<()> {
        if media.is_empty() {
            return Err(Error::Validation("no media to play".into()));
        }
        let call = self.live_call(call_id).await?;
        let channel_id = call.read().await.channel_id.clone();
        self.enter_work_state(&call, CallState::Playing).await?;

        let mut result = Ok(());
        for uri in media {
            if let Err(e) = self.play_and_wait(call_id, &channel_id, &uri).await {
                result = Err(e);
                break;
            }
        }
        self.leave_work_state(&call).await;
        result
    }

    /// Synthesize `text` and stream it into the call in real time.
    pub async fn speak(
        self: &Arc<Self>,
        call_id: &CallId,
        request: SpeakRequest,
    ) -> Result<SpeakOutcome> {
        // Checked before any state change so an unconfigured TTS cannot
        // leave a stray `speaking` state behind.
        if !self.tts.is_configured() {
            return Err(Error::NotImplemented("no TTS server configured".into()));
        }
        let call = self.live_call(call_id).await?;
        let channel_id = call.read().await.channel_id.clone();
        self.enter_work_state(&call, CallState::Speaking).await?;
        self.bus.emit(CallEvent::call(
            event_types::CALL_SPEAK_STARTED,
            call_id,
            serde_json::json!({
                "text": &request.text,
                "voice": &request.voice,
                "language": &request.language,
            }),
        ));

        match self.speak_inner(&call, call_id, &channel_id, &request).await {
            Ok((outcome, cancelled)) => {
                if cancelled {
                    // Hangup raced the stream; teardown owns the state and
                    // the ended event tells the story.
                    return Ok(outcome);
                }
                let data = serde_json::json!({
                    "callID": call_id,
                    "voice": outcome.voice,
                    "language": outcome.language,
                    "durationSeconds": outcome.duration_seconds,
                });
                self.bus.emit(CallEvent::call(
                    event_types::CALL_SPEAK_FINISHED,
                    call_id,
                    data.clone(),
                ));
                self.webhook.notify(event_types::CALL_SPEAK_FINISHED, data);
                self.leave_work_state(&call).await;
                Ok(outcome)
            }
            Err(Error::Cancelled(reason)) => {
                // Superseded by a newer speak (or call teardown); whoever
                // superseded us owns the state now.
                debug!(call = %call_id, "speak cancelled: {reason}");
                Err(Error::Cancelled(reason))
            }
            Err(e) => {
                self.bus.emit(CallEvent::call(
                    event_types::CALL_SPEAK_ERROR,
                    call_id,
                    serde_json::json!({ "error": e.to_string() }),
                ));
                self.leave_work_state(&call).await;
                Err(e)
            }
        }
    }

    async fn speak_inner(
        self: &Arc<Self>,
        call: &Arc<RwLock<CallRecord>>,
        call_id: &CallId,
        channel_id: &str,
        request: &SpeakRequest,
    ) -> Result<(SpeakOutcome, bool)> {
        let synthesis = self.tts.synthesize(call_id, request).await?;

        let wav = parse_wav(&synthesis.wav)
            .map_err(|e| Error::Protocol(format!("TTS WAV: {e}")))?;
        let prepared = prepare_for_playback(wav);
        let duration = prepared.duration_seconds();

        // Reuse the playback pipeline when its rate still matches;
        // otherwise rebuild it for the new codec.
        let existing = {
            let record = call.read().await;
            record
                .playback
                .as_ref()
                .filter(|p| p.sample_rate == prepared.sample_rate)
                .map(|p| p.streamer())
        };
        let streamer = match existing {
            Some(streamer) => streamer,
            None => {
                let stale = call.write().await.playback.take();
                if let Some(stale) = stale {
                    playback::teardown(stale, &self.switch).await;
                }
                let handle = playback::start(
                    &self.switch,
                    call_id,
                    channel_id,
                    prepared.codec,
                    prepared.sample_rate,
                )
                .await?;
                let streamer = handle.streamer();
                {
                    let mut record = call.write().await;
                    if record.state.is_terminal() {
                        drop(record);
                        playback::teardown(handle, &self.switch).await;
                        return Err(Error::Cancelled("call ended during playback setup".into()));
                    }
                    record.playback = Some(handle);
                }
                self.bus.emit(CallEvent::call(
                    event_types::CALL_PLAYBACK_STREAM_STARTED,
                    call_id,
                    serde_json::json!({
                        "format": prepared.codec,
                        "sampleRate": prepared.sample_rate,
                    }),
                ));
                streamer
            }
        };

        let outcome = streamer.stream(&prepared.samples).await;
        let expected_frames = prepared
            .samples
            .len()
            .div_ceil(crate::audio::frame_bytes(prepared.sample_rate) / 2);
        let stream_event = if outcome.cancelled || outcome.frames_sent == expected_frames {
            event_types::CALL_PLAYBACK_STREAM_FINISHED
        } else {
            // The socket went away under a live stream.
            event_types::CALL_PLAYBACK_STREAM_ERROR
        };
        self.bus.emit(CallEvent::call(
            stream_event,
            call_id,
            serde_json::json!({
                "framesSent": outcome.frames_sent,
                "cancelled": outcome.cancelled,
            }),
        ));

        Ok((
            SpeakOutcome {
                voice: synthesis.voice,
                language: synthesis.language,
                duration_seconds: Some(duration),
            },
            outcome.cancelled,
        ))
    }

    /// Start the capture pipeline (and an ASR session) for a call.
    pub async fn start_capture(self: &Arc<Self>, call_id: &CallId) -> Result<CaptureInfo> {
        let call = self.live_call(call_id).await?;
        if call.read().await.capture.is_some() {
            return Err(Error::Validation(format!("call {call_id} already capturing")));
        }
        self.start_capture_on(&call).await
    }

    async fn start_capture_on(self: &Arc<Self>, call: &Arc<RwLock<CallRecord>>) -> Result<CaptureInfo> {
        let (call_id, channel_id) = {
            let record = call.read().await;
            (record.id.clone(), record.channel_id.clone())
        };

        let asr_session = self.asr.start_session(&call_id);
        let handle = match capture::start(
            &self.switch,
            &self.waiters,
            &self.bus,
            asr_session,
            &call_id,
            &channel_id,
        )
        .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.asr.close_session(&call_id).await;
                return Err(e);
            }
        };
        let info = handle.info();

        {
            let mut record = call.write().await;
            if record.state.is_terminal() {
                // The ended event was already queued when capture started;
                // release everything and report the call gone.
                drop(record);
                capture::teardown(handle, &self.switch).await;
                self.asr.close_session(&call_id).await;
                return Err(Error::not_found("call", call_id.to_string()));
            }
            record.asr = self.asr.session(&call_id);
            record.capture = Some(handle);
        }

        self.bus.emit(CallEvent::call(
            event_types::CALL_AUDIO_CAPTURE_STARTED,
            &call_id,
            serde_json::to_value(&info).unwrap_or_default(),
        ));
        Ok(info)
    }

    /// Stop capturing. Idempotent: missing call or absent pipeline is a
    /// no-op.
    pub async fn stop_capture(self: &Arc<Self>, call_id: &CallId) -> Result<()> {
        let Some(call) = self.registry.get(call_id).await else {
            return Ok(());
        };
        let handle = {
            let mut record = call.write().await;
            record.asr = None;
            record.capture.take()
        };
        if let Some(handle) = handle {
            capture::teardown(handle, &self.switch).await;
            self.asr.close_session(call_id).await;
            self.bus.emit(CallEvent::call(
                event_types::CALL_AUDIO_CAPTURE_STOPPED,
                call_id,
                serde_json::json!({}),
            ));
        }
        Ok(())
    }

    /// Record the channel into a switch-side file, holding the `recording`
    /// state until the switch reports completion.
    pub async fn record(
        self: &Arc<Self>,
        call_id: &CallId,
        name: Option<String>,
        format: Option<String>,
        max_seconds: Option<u32>,
    ) -> Result<RecordingOutcome> {
        let call = self.live_call(call_id).await?;
        let channel_id = call.read().await.channel_id.clone();
        let name = name.unwrap_or_else(|| format!("rec-{call_id}"));
        let format = format.unwrap_or_else(|| "wav".into());
        let max_seconds = max_seconds.unwrap_or(60);

        self.enter_work_state(&call, CallState::Recording).await?;

        let (tx, rx) = oneshot::channel();
        self.recording_waiters.insert(
            name.clone(),
            RecordingWaiter {
                call_id: call_id.clone(),
                tx,
            },
        );
        if let Err(e) = self
            .switch
            .record(&channel_id, &name, &format, max_seconds)
            .await
        {
            self.recording_waiters.remove(&name);
            self.leave_work_state(&call).await;
            return Err(e);
        }

        let deadline = Duration::from_secs(max_seconds as u64 + 10);
        let result = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(true)) => Ok(RecordingOutcome {
                name: name.clone(),
                format,
            }),
            Ok(Ok(false)) => Err(Error::upstream(502, format!("recording {name} failed"))),
            // Waiter dropped: the call ended mid-recording.
            Ok(Err(_)) => Err(Error::Cancelled(format!("recording {name}"))),
            Err(_) => {
                self.recording_waiters.remove(&name);
                Err(Error::timeout(format!("recording {name}")))
            }
        };
        self.leave_work_state(&call).await;
        result
    }

    pub async fn send_dtmf(self: &Arc<Self>, call_id: &CallId, digits: &str) -> Result<()> {
        if digits.is_empty()
            || !digits
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D' | 'a'..='d'))
        {
            return Err(Error::Validation(format!("invalid DTMF digits: {digits}")));
        }
        let call = self.live_call(call_id).await?;
        let channel_id = call.read().await.channel_id.clone();
        self.switch.send_dtmf(&channel_id, digits).await
    }

    /// Bridge the call with a freshly originated target leg.
    pub async fn transfer(
        self: &Arc<Self>,
        call_id: &CallId,
        request: TransferRequest,
    ) -> Result<TransferResult> {
        let call = self.live_call(call_id).await?;
        let channel_id = call.read().await.channel_id.clone();
        let (_, resource) = request
            .endpoint
            .split_once('/')
            .ok_or_else(|| Error::Validation("endpoint must be technology/resource".into()))?;

        // The target leg gets a reserved prefix: its events are kept out of
        // inbound-call dispatch, and its StasisStart doubles as the answer
        // signal.
        let target_id = format!("xfer-{}", Uuid::new_v4());
        let answered = self.waiters.register(&target_id);

        if let Err(e) = self
            .switch
            .originate(OriginateParams {
                endpoint: request.endpoint.clone(),
                caller_id: request.caller_id.clone(),
                timeout_secs: request.timeout_secs,
                channel_id: Some(target_id.clone()),
                variables: HashMap::new(),
            })
            .await
        {
            self.waiters.forget(&target_id);
            return Err(e);
        }

        let wait = request
            .timeout_secs
            .map(|s| Duration::from_secs(s as u64))
            .unwrap_or(TRANSFER_TIMEOUT);
        match tokio::time::timeout(wait, answered).await {
            Ok(Ok(true)) => {}
            Ok(_) => {
                return Err(Error::upstream(502, "transfer target ended before answering"));
            }
            Err(_) => {
                self.waiters.forget(&target_id);
                let _ = self.switch.hangup(&target_id, None).await;
                return Err(Error::transfer_timeout("transfer target did not answer"));
            }
        }

        let bridge = match self.switch.create_bridge(&format!("transfer-{call_id}")).await {
            Ok(bridge) => bridge,
            Err(e) => {
                let _ = self.switch.hangup(&target_id, None).await;
                return Err(e);
            }
        };
        for member in [channel_id.as_str(), target_id.as_str()] {
            if let Err(e) = self.switch.add_to_bridge(&bridge.id, member).await {
                // No orphaned bridges on a failed transfer.
                let _ = self.switch.destroy_bridge(&bridge.id).await;
                let _ = self.switch.hangup(&target_id, None).await;
                return Err(e);
            }
        }

        let new_call_id = CallId::generate();
        let mut target_record = CallRecord::new(
            new_call_id.clone(),
            &target_id,
            CallDirection::Outbound,
            request.caller_id.clone().unwrap_or_default(),
            resource,
            CallState::Answered,
        );
        target_record.answered_at = Some(chrono::Utc::now());
        target_record.bridge_id = Some(bridge.id.clone());
        let target_call = self.registry.insert(target_record).await;
        let _ = self.registry.transition(&target_call, CallState::Bridged).await;

        self.enter_work_state(&call, CallState::Bridged).await?;
        call.write().await.bridge_id = Some(bridge.id.clone());

        info!(call = %call_id, target = %new_call_id, bridge = %bridge.id, "transfer bridged");
        Ok(TransferResult {
            bridge_id: bridge.id,
            call_id: new_call_id,
        })
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// End a call from any path. Idempotent. Runs the cancellation cascade:
    /// TTS abort, scheduler cancel, ASR flush-and-close, pipeline
    /// teardowns, then the ended event and webhook.
    pub async fn end_call(self: &Arc<Self>, call: &Arc<RwLock<CallRecord>>, cause: Option<String>) {
        let (call_id, channel_id, capture, playback, bridge_id) = {
            let mut record = call.write().await;
            if record.state.is_terminal() {
                return;
            }
            if record.hangup_cause.is_none() {
                record.hangup_cause = cause.clone();
            }
            record.asr = None;
            (
                record.id.clone(),
                record.channel_id.clone(),
                record.capture.take(),
                record.playback.take(),
                record.bridge_id.take(),
            )
        };
        info!(call = %call_id, cause = ?cause, "ending call");

        let _ = self.registry.transition(call, CallState::Ended).await;

        // Cancellation cascade, in dependency order.
        self.tts.cancel(&call_id);
        if let Some(handle) = &playback {
            handle.cancel();
        }
        self.asr.close_session(&call_id).await;
        if let Some(handle) = playback {
            playback::teardown(handle, &self.switch).await;
        }
        if let Some(handle) = capture {
            capture::teardown(handle, &self.switch).await;
            self.bus.emit(CallEvent::call(
                event_types::CALL_AUDIO_CAPTURE_STOPPED,
                &call_id,
                serde_json::json!({}),
            ));
        }

        // Pending switch-playback and recording waits resolve as the call
        // goes away.
        self.playback_waiters.retain(|_, w| w.call_id != call_id);
        self.recording_waiters.retain(|_, w| w.call_id != call_id);

        // A call-level (transfer) bridge dies with its call; the peer leg is
        // restored by the bridge-destroyed event.
        if let Some(bridge_id) = bridge_id {
            let _ = self.switch.destroy_bridge(&bridge_id).await;
        }

        // The channel may already be gone; hangup errors are swallowed.
        let _ = self.switch.hangup(&channel_id, None).await;

        let cause = call.read().await.hangup_cause.clone();
        let data = serde_json::json!({ "callID": call_id, "cause": cause });
        self.bus
            .emit(CallEvent::call(event_types::CALL_ENDED, &call_id, data.clone()));
        self.webhook.notify(event_types::CALL_ENDED, data);
    }

    /// End every live call, close ASR, drain deferred timers.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("shutting down: ending all calls");
        for call in self.registry.live_calls().await {
            self.end_call(&call, Some("shutdown".into())).await;
        }
        self.asr.shutdown().await;
        self.timers.shutdown();
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    async fn live_call(&self, call_id: &CallId) -> Result<Arc<RwLock<CallRecord>>> {
        let call = self
            .registry
            .get(call_id)
            .await
            .ok_or_else(|| Error::not_found("call", call_id.to_string()))?;
        if call.read().await.state.is_terminal() {
            return Err(Error::not_found("call", call_id.to_string()));
        }
        Ok(call)
    }

    /// Start a switch-side playback and wait for its finished event.
    async fn play_and_wait(
        self: &Arc<Self>,
        call_id: &CallId,
        channel_id: &str,
        media_uri: &str,
    ) -> Result<()> {
        let playback_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.playback_waiters.insert(
            playback_id.clone(),
            PlaybackWaiter {
                call_id: call_id.clone(),
                tx,
            },
        );

        if let Err(e) = self.switch.play(channel_id, media_uri, &playback_id).await {
            self.playback_waiters.remove(&playback_id);
            return Err(e);
        }

        match tokio::time::timeout(PLAY_WAIT_DEADLINE, rx).await {
            Ok(Ok(())) => Ok(()),
            // Waiter dropped: the call ended mid-playback. Not an error.
            Ok(Err(_)) => Ok(()),
            Err(_) => {
                self.playback_waiters.remove(&playback_id);
                Err(Error::timeout(format!("playback of {media_uri}")))
            }
        }
    }

    /// Move into a transient work state, remembering where to come back to.
    async fn enter_work_state(
        &self,
        call: &Arc<RwLock<CallRecord>>,
        work: CallState,
    ) -> Result<()> {
        let resume = {
            let record = call.read().await;
            if record.state.is_terminal() {
                return Err(Error::not_found("call", record.id.to_string()));
            }
            if record.state.is_work_state() {
                record.resume_state.unwrap_or(CallState::Ready)
            } else {
                record.state
            }
        };
        let registry = Arc::clone(&self.registry);
        registry.transition(call, work).await?;
        call.write().await.resume_state = Some(resume);
        Ok(())
    }

    /// Return to the state held before the work state, unless the call
    /// ended meanwhile.
    async fn leave_work_state(&self, call: &Arc<RwLock<CallRecord>>) {
        let resume = call.write().await.resume_state.take();
        if let Some(resume) = resume {
            let registry = Arc::clone(&self.registry);
            let _ = registry.transition(call, resume).await;
        }
    }
}
