//! Audio playback pipeline and the real-time PCM scheduler.
//!
//! Playback mirrors capture without the snoop: a server-mode external-media
//! channel is bridged with the call channel itself, and synthesized PCM is
//! paced onto the media socket in 20 ms frames. The scheduler computes each
//! frame's send time from the stream start (`start + i * 20ms`), never by
//! chaining interval timers; chained timers accumulate scheduler error that
//! audibly clicks within half a minute.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::audio::{frame_bytes, i16_to_bytes, FRAME_MS};
use crate::call::CallId;
use crate::error::{Error, Result};
use crate::media::{MediaSink, MediaSocket};
use crate::switch::{ExternalMediaParams, SwitchApi, MEDIA_CONNECTION_VAR};

/// Suspend sending when this many bytes sit unflushed on the socket.
pub const HIGH_WATER_BYTES: usize = 64 * 1024;
/// Resume once the backlog falls below this.
pub const LOW_WATER_BYTES: usize = 32 * 1024;
/// Poll cadence while suspended and while draining.
const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Upper bound on the post-stream drain wait.
const DRAIN_DEADLINE: Duration = Duration::from_millis(500);

/// Outbound counterpart of the capture handle.
pub struct PlaybackHandle {
    pub media_channel_id: String,
    pub bridge_id: String,
    pub format: String,
    pub sample_rate: u32,
    pub started_at: DateTime<Utc>,
    socket: Arc<MediaSocket>,
    cancelled: Arc<AtomicBool>,
    streaming: Arc<AtomicBool>,
}

impl PlaybackHandle {
    /// Cooperative cancel; the scheduler notices at the next frame boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    /// Detached streaming view. The caller streams through this without
    /// holding the call record (and therefore this handle) locked, so
    /// teardown can still reach the cancel flag mid-stream.
    pub fn streamer(&self) -> PlaybackStreamer {
        PlaybackStreamer {
            socket: Arc::clone(&self.socket),
            cancelled: Arc::clone(&self.cancelled),
            streaming: Arc::clone(&self.streaming),
            sample_rate: self.sample_rate,
        }
    }
}

/// Clonable handle onto a playback pipeline's socket and flags.
#[derive(Clone)]
pub struct PlaybackStreamer {
    socket: Arc<MediaSocket>,
    cancelled: Arc<AtomicBool>,
    streaming: Arc<AtomicBool>,
    sample_rate: u32,
}

impl PlaybackStreamer {
    /// Pace one PCM buffer onto the socket in real time.
    pub async fn stream(&self, samples: &[i16]) -> StreamOutcome {
        self.streaming.store(true, Ordering::SeqCst);
        let bytes = i16_to_bytes(samples);
        let outcome = stream_pcm(
            self.socket.as_ref(),
            &self.cancelled,
            &bytes,
            self.sample_rate,
        )
        .await;
        self.streaming.store(false, Ordering::SeqCst);
        outcome
    }
}

/// Bring up the playback pipeline: external-media channel, socket connected
/// *before* bridging, then a mixing bridge joining the call channel itself
/// with the media channel.
pub async fn start(
    switch: &Arc<dyn SwitchApi>,
    call_id: &CallId,
    channel_id: &str,
    format: &str,
    sample_rate: u32,
) -> Result<PlaybackHandle> {
    let media_id = format!("ttsplay-{call_id}");

    let media_channel = switch
        .external_media(ExternalMediaParams {
            channel_id: media_id.clone(),
            format: format.to_string(),
        })
        .await?;

    let connection_id = media_channel.var(MEDIA_CONNECTION_VAR).ok_or_else(|| {
        Error::Protocol(format!(
            "external media channel {media_id} reported no {MEDIA_CONNECTION_VAR}"
        ))
    });
    let connection_id = match connection_id {
        Ok(id) => id,
        Err(e) => {
            release(switch, &media_id, None).await;
            return Err(e);
        }
    };

    let url = switch.media_socket_url(&connection_id);
    let (socket, _inbound) = match MediaSocket::connect(&url).await {
        Ok(pair) => pair,
        Err(e) => {
            release(switch, &media_id, None).await;
            return Err(e);
        }
    };
    let socket = Arc::new(socket);

    let bridge = match switch.create_bridge(&format!("playback-{call_id}")).await {
        Ok(bridge) => bridge,
        Err(e) => {
            socket.close().await;
            release(switch, &media_id, None).await;
            return Err(e);
        }
    };
    for member in [channel_id, media_id.as_str()] {
        if let Err(e) = switch.add_to_bridge(&bridge.id, member).await {
            socket.close().await;
            release(switch, &media_id, Some(&bridge.id)).await;
            return Err(e);
        }
    }

    info!(call = %call_id, bridge = %bridge.id, "playback pipeline up");
    Ok(PlaybackHandle {
        media_channel_id: media_id,
        bridge_id: bridge.id,
        format: format.to_string(),
        sample_rate,
        started_at: Utc::now(),
        socket,
        cancelled: Arc::new(AtomicBool::new(false)),
        streaming: Arc::new(AtomicBool::new(false)),
    })
}

/// Tear the pipeline down; same best-effort contract as capture teardown.
pub async fn teardown(handle: PlaybackHandle, switch: &Arc<dyn SwitchApi>) {
    handle.cancel();
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
    let hang_media = async {
        log_release(
            "hang up media channel",
            switch.hangup(&handle.media_channel_id, None).await,
        );
    };
    tokio::join!(remove, destroy, hang_media);
    debug!("playback pipeline torn down");
}

async fn release(switch: &Arc<dyn SwitchApi>, media_id: &str, bridge_id: Option<&str>) {
    if let Some(id) = bridge_id {
        log_release("destroy bridge", switch.destroy_bridge(id).await);
    }
    log_release("hang up media channel", switch.hangup(media_id, None).await);
}

fn log_release(what: &str, result: Result<()>) {
    if let Err(e) = result {
        debug!("playback teardown: {what} failed: {e}");
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamOutcome {
    pub frames_sent: usize,
    pub cancelled: bool,
}

/// Stream `pcm` to `sink` in fixed 20 ms frames.
///
/// Guarantees:
/// - frame `i` is released at `start + i * 20ms` (absolute target, no
///   cumulative drift);
/// - sending suspends above [`HIGH_WATER_BYTES`] of socket backlog and
///   resumes below [`LOW_WATER_BYTES`];
/// - after the last frame, waits for the backlog to reach zero, bounded by
///   a 500 ms deadline, so an immediate hangup does not clip the tail;
/// - the cancel flag is honored at every frame boundary and during
///   backpressure polls, resolving cleanly;
/// - a sink that is not open resolves cleanly (the call may already be
///   gone).
pub async fn stream_pcm<S>(
    sink: &S,
    cancelled: &AtomicBool,
    pcm: &[u8],
    sample_rate: u32,
) -> StreamOutcome
where
    S: MediaSink + ?Sized,
{
    let frame_len = frame_bytes(sample_rate);
    let start = tokio::time::Instant::now();
    let mut outcome = StreamOutcome::default();

    'frames: for (index, frame) in pcm.chunks(frame_len).enumerate() {
        if cancelled.load(Ordering::SeqCst) {
            outcome.cancelled = true;
            break;
        }
        if !sink.is_open() {
            break;
        }

        if sink.buffered_bytes() > HIGH_WATER_BYTES {
            while sink.buffered_bytes() >= LOW_WATER_BYTES {
                if cancelled.load(Ordering::SeqCst) {
                    outcome.cancelled = true;
                    break 'frames;
                }
                if !sink.is_open() {
                    break 'frames;
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }

        let target = start + Duration::from_millis(index as u64 * FRAME_MS);
        tokio::time::sleep_until(target).await;

        if cancelled.load(Ordering::SeqCst) {
            outcome.cancelled = true;
            break;
        }
        if !sink.send_frame(frame.to_vec()) {
            break;
        }
        outcome.frames_sent += 1;
    }

    let deadline = tokio::time::Instant::now() + DRAIN_DEADLINE;
    while sink.buffered_bytes() > 0
        && sink.is_open()
        && !cancelled.load(Ordering::SeqCst)
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Recording sink with scriptable backlog behaviour.
    struct MockSink {
        sent: Mutex<Vec<(tokio::time::Instant, usize)>>,
        buffered: AtomicUsize,
        open: AtomicBool,
        /// When true, queued bytes never leave the backlog.
        retain: bool,
    }

    impl MockSink {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                buffered: AtomicUsize::new(0),
                open: AtomicBool::new(true),
                retain: false,
            }
        }

        fn retaining() -> Self {
            Self {
                retain: true,
                ..Self::new()
            }
        }
    }

    impl MediaSink for MockSink {
        fn send_frame(&self, frame: Vec<u8>) -> bool {
            self.sent
                .lock()
                .push((tokio::time::Instant::now(), frame.len()));
            if self.retain {
                self.buffered.fetch_add(frame.len(), Ordering::SeqCst);
            }
            true
        }

        fn buffered_bytes(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacing_is_drift_free() {
        // 10 s of 16 kHz mono: 500 frames of 640 bytes.
        let sink = MockSink::new();
        let cancelled = AtomicBool::new(false);
        let pcm = vec![0u8; 640 * 500];

        let outcome = stream_pcm(&sink, &cancelled, &pcm, 16_000).await;
        assert_eq!(outcome.frames_sent, 500);
        assert!(!outcome.cancelled);

        let sent = sink.sent.lock();
        let start = sent[0].0;
        for (index, (at, len)) in sent.iter().enumerate() {
            assert_eq!(*len, 640);
            let offset = at.duration_since(start);
            let expected = Duration::from_millis(index as u64 * FRAME_MS);
            let error = if offset > expected {
                offset - expected
            } else {
                expected - offset
            };
            assert!(
                error <= Duration::from_millis(5),
                "frame {index} drifted by {error:?}"
            );
        }
        // Cumulative check over the whole 10 s window.
        let total = sent[499].0.duration_since(start);
        let expected = Duration::from_millis(499 * FRAME_MS);
        assert!(total >= expected && total <= expected + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_resolves_cleanly() {
        let sink = Arc::new(MockSink::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        let pcm = vec![0u8; 640 * 250]; // 5 s

        let task = {
            let sink = Arc::clone(&sink);
            let cancelled = Arc::clone(&cancelled);
            tokio::spawn(async move { stream_pcm(sink.as_ref(), &cancelled, &pcm, 16_000).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancelled.store(true, Ordering::SeqCst);
        let outcome = task.await.unwrap();

        assert!(outcome.cancelled);
        // ~15 frames in 300 ms, certainly nowhere near the full 250.
        assert!(outcome.frames_sent < 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_honored_during_backpressure_poll() {
        let sink = Arc::new(MockSink::new());
        sink.buffered.store(HIGH_WATER_BYTES + 1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        let pcm = vec![0u8; 640 * 50];

        let task = {
            let sink = Arc::clone(&sink);
            let cancelled = Arc::clone(&cancelled);
            tokio::spawn(async move { stream_pcm(sink.as_ref(), &cancelled, &pcm, 16_000).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancelled.store(true, Ordering::SeqCst);
        let outcome = task.await.unwrap();

        assert!(outcome.cancelled);
        assert_eq!(outcome.frames_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_sink_resolves_immediately() {
        let sink = MockSink::new();
        sink.open.store(false, Ordering::SeqCst);
        let cancelled = AtomicBool::new(false);

        let outcome = stream_pcm(&sink, &cancelled, &vec![0u8; 640 * 100], 16_000).await;
        assert_eq!(outcome.frames_sent, 0);
        assert!(!outcome.cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_bounded_by_deadline() {
        // Backlog never empties: the drain must give up after ~500 ms.
        let sink = MockSink::retaining();
        let cancelled = AtomicBool::new(false);
        let pcm = vec![0u8; 640 * 3];

        let before = tokio::time::Instant::now();
        let outcome = stream_pcm(&sink, &cancelled, &pcm, 16_000).await;
        let elapsed = tokio::time::Instant::now().duration_since(before);

        assert_eq!(outcome.frames_sent, 3);
        // 2 frame gaps (40 ms) + 500 ms drain, small poll slack.
        assert!(elapsed >= Duration::from_millis(540));
        assert!(elapsed <= Duration::from_millis(560));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_is_a_noop() {
        let sink = MockSink::new();
        let cancelled = AtomicBool::new(false);
        let outcome = stream_pcm(&sink, &cancelled, &[], 16_000).await;
        assert_eq!(outcome.frames_sent, 0);
    }
}
