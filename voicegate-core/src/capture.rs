//! Audio capture pipeline.
//!
//! For one call: a mirror (snoop) channel copies the caller's audio into a
//! server-mode external-media channel, a mixing bridge ties the two
//! together, and the media socket delivers raw PCM frames which fan out to
//! the event stream (base64) and the ASR session (raw).

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::asr::AsrSession;
use crate::audio::{base64_encode_pcm, DEFAULT_FORMAT, DEFAULT_SAMPLE_RATE};
use crate::call::events::{event_types, CallEvent, EventBus};
use crate::call::CallId;
use crate::error::{Error, Result};
use crate::media::MediaSocket;
use crate::switch::{
    ExternalMediaParams, SnoopParams, StasisWaiters, SwitchApi, MEDIA_CONNECTION_VAR,
    SETUP_DEADLINE,
};

/// One captured PCM frame in flight. Built by the pump, consumed by the
/// event stream and the ASR client, never stored.
pub struct AudioFrame {
    pub call_id: CallId,
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
    pub format: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_count: usize,
}

impl AudioFrame {
    fn event_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "data": base64_encode_pcm(&self.data),
            "format": self.format,
            "sampleRate": self.sample_rate,
            "channels": self.channels,
            "sampleCount": self.sample_count,
        })
    }
}

/// Serializable description of a live capture session.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureInfo {
    #[serde(rename = "snoopChannelID")]
    pub snoop_channel_id: String,
    #[serde(rename = "mediaChannelID")]
    pub media_channel_id: String,
    #[serde(rename = "bridgeID")]
    pub bridge_id: String,
    pub format: String,
    pub sample_rate: u32,
    pub started_at: DateTime<Utc>,
}

/// Switch resources plus socket for one capture session. Destroyed
/// atomically by [`teardown`]; all four switch releases are attempted even
/// when some fail.
pub struct CaptureHandle {
    pub snoop_channel_id: String,
    pub media_channel_id: String,
    pub bridge_id: String,
    pub format: String,
    pub sample_rate: u32,
    pub started_at: DateTime<Utc>,
    socket: Arc<MediaSocket>,
    stopping: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl CaptureHandle {
    pub fn info(&self) -> CaptureInfo {
        CaptureInfo {
            snoop_channel_id: self.snoop_channel_id.clone(),
            media_channel_id: self.media_channel_id.clone(),
            bridge_id: self.bridge_id.clone(),
            format: self.format.clone(),
            sample_rate: self.sample_rate,
            started_at: self.started_at,
        }
    }
}

/// Bring up the capture pipeline for `call_id` on `channel_id`.
///
/// Acquisition order matters: snoop, then the external-media channel, then
/// a wait for that channel to enter the application (server-mode channels
/// refuse bridging until their socket side is connected), then the socket,
/// then the bridge. Failure at any step releases everything acquired so far.
pub async fn start(
    switch: &Arc<dyn SwitchApi>,
    waiters: &Arc<StasisWaiters>,
    bus: &EventBus,
    asr: Option<Arc<AsrSession>>,
    call_id: &CallId,
    channel_id: &str,
) -> Result<CaptureHandle> {
    let snoop_id = format!("snoop-{call_id}");
    let media_id = format!("audiocap-{call_id}");
    let format = DEFAULT_FORMAT.to_string();
    let sample_rate = DEFAULT_SAMPLE_RATE;

    // Mirror incoming audio from the caller.
    let snoop = switch
        .snoop(SnoopParams {
            channel_id: channel_id.to_string(),
            snoop_id: snoop_id.clone(),
            spy: "in".into(),
        })
        .await?;

    // Register before creating the channel so the entered-app event cannot
    // race us.
    let entered = waiters.register(&media_id);
    let media_channel = match switch
        .external_media(ExternalMediaParams {
            channel_id: media_id.clone(),
            format: format.clone(),
        })
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            waiters.forget(&media_id);
            release(switch, Some(&snoop.id), None, None).await;
            return Err(e);
        }
    };

    let connection_id = match media_channel.var(MEDIA_CONNECTION_VAR) {
        Some(id) => id,
        None => {
            waiters.forget(&media_id);
            release(switch, Some(&snoop.id), Some(&media_id), None).await;
            return Err(Error::Protocol(format!(
                "external media channel {media_id} reported no {MEDIA_CONNECTION_VAR}"
            )));
        }
    };

    match tokio::time::timeout(SETUP_DEADLINE, entered).await {
        Ok(Ok(true)) => {}
        Ok(_) => {
            release(switch, Some(&snoop.id), Some(&media_id), None).await;
            return Err(Error::Protocol(format!(
                "external media channel {media_id} went away before entering the app"
            )));
        }
        Err(_) => {
            waiters.forget(&media_id);
            release(switch, Some(&snoop.id), Some(&media_id), None).await;
            return Err(Error::timeout(format!(
                "external media channel {media_id} never entered the app"
            )));
        }
    }

    let url = switch.media_socket_url(&connection_id);
    let (socket, inbound) = match MediaSocket::connect(&url).await {
        Ok(pair) => pair,
        Err(e) => {
            release(switch, Some(&snoop.id), Some(&media_id), None).await;
            return Err(e);
        }
    };
    let socket = Arc::new(socket);

    let bridge = match switch.create_bridge(&format!("capture-{call_id}")).await {
        Ok(bridge) => bridge,
        Err(e) => {
            socket.close().await;
            release(switch, Some(&snoop.id), Some(&media_id), None).await;
            return Err(e);
        }
    };
    for member in [snoop.id.as_str(), media_id.as_str()] {
        if let Err(e) = switch.add_to_bridge(&bridge.id, member).await {
            socket.close().await;
            release(switch, Some(&snoop.id), Some(&media_id), Some(&bridge.id)).await;
            return Err(e);
        }
    }

    let stopping = Arc::new(AtomicBool::new(false));
    let pump = spawn_pump(
        inbound,
        bus.clone(),
        asr,
        call_id.clone(),
        format.clone(),
        sample_rate,
        Arc::clone(&stopping),
    );

    info!(call = %call_id, bridge = %bridge.id, "capture pipeline up");
    Ok(CaptureHandle {
        snoop_channel_id: snoop.id,
        media_channel_id: media_id,
        bridge_id: bridge.id,
        format,
        sample_rate,
        started_at: Utc::now(),
        socket,
        stopping,
        pump,
    })
}

fn spawn_pump(
    mut inbound: tokio::sync::mpsc::Receiver<Vec<u8>>,
    bus: EventBus,
    asr: Option<Arc<AsrSession>>,
    call_id: CallId,
    format: String,
    sample_rate: u32,
    stopping: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = inbound.recv().await {
            let frame = AudioFrame {
                sample_count: data.len() / 2,
                call_id: call_id.clone(),
                timestamp: Utc::now(),
                data,
                format: format.clone(),
                sample_rate,
                channels: 1,
            };
            bus.emit(CallEvent::call(
                event_types::CALL_AUDIO_FRAME,
                &frame.call_id,
                frame.event_payload(),
            ));
            if let Some(asr) = &asr {
                asr.feed(frame.data);
            }
        }
        // A socket that dies under a live pipeline is a capture fault; a
        // stop-initiated close is not.
        if !stopping.load(Ordering::SeqCst) {
            warn!(call = %call_id, "capture socket closed unexpectedly");
            bus.emit(CallEvent::call(
                event_types::CALL_AUDIO_CAPTURE_ERROR,
                &call_id,
                serde_json::json!({ "error": "media socket closed" }),
            ));
        }
    })
}

/// Tear the pipeline down. Best-effort: every release is attempted, each
/// failure is logged, none aborts the rest.
pub async fn teardown(handle: CaptureHandle, switch: &Arc<dyn SwitchApi>) {
    handle.stopping.store(true, Ordering::SeqCst);
    handle.socket.close().await;

    let remove = async {
        log_release(
            "remove media channel from bridge",
            switch
                .remove_from_bridge(&handle.bridge_id, &handle.media_channel_id)
                .await,
        );
    };
    let destroy = async {
        log_release("destroy bridge", switch.destroy_bridge(&handle.bridge_id).await);
    };
    let hang_snoop = async {
        log_release(
            "hang up snoop channel",
            switch.hangup(&handle.snoop_channel_id, None).await,
        );
    };
    let hang_media = async {
        log_release(
            "hang up media channel",
            switch.hangup(&handle.media_channel_id, None).await,
        );
    };
    tokio::join!(remove, destroy, hang_snoop, hang_media);

    handle.pump.abort();
    debug!("capture pipeline torn down");
}

/// Partial-acquisition cleanup used by the startup error paths.
async fn release(
    switch: &Arc<dyn SwitchApi>,
    snoop_id: Option<&str>,
    media_id: Option<&str>,
    bridge_id: Option<&str>,
) {
    if let Some(id) = bridge_id {
        log_release("destroy bridge", switch.destroy_bridge(id).await);
    }
    if let Some(id) = snoop_id {
        log_release("hang up snoop channel", switch.hangup(id, None).await);
    }
    if let Some(id) = media_id {
        log_release("hang up media channel", switch.hangup(id, None).await);
    }
}

fn log_release(what: &str, result: Result<()>) {
    if let Err(e) = result {
        debug!("capture teardown: {what} failed: {e}");
    }
}
