//! Call event stream.
//!
//! Events flow through one broadcast channel with a discriminated payload.
//! Subscribers are explicit; there are no implicit multi-cast registrations
//! to accumulate across reconnects.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::call::CallId;

/// Stable event type identifiers.
pub mod event_types {
    pub const CALL_CREATED: &str = "call.created";
    pub const CALL_STATE_CHANGED: &str = "call.state_changed";
    pub const CALL_INBOUND: &str = "call.inbound";
    pub const CALL_ANSWERED: &str = "call.answered";
    pub const CALL_READY: &str = "call.ready";
    pub const CALL_DTMF: &str = "call.dtmf";
    pub const CALL_PLAYBACK_FINISHED: &str = "call.playback_finished";
    pub const CALL_RECORDING_FINISHED: &str = "call.recording_finished";
    pub const CALL_AUDIO_CAPTURE_STARTED: &str = "call.audio_capture_started";
    pub const CALL_AUDIO_CAPTURE_STOPPED: &str = "call.audio_capture_stopped";
    pub const CALL_AUDIO_FRAME: &str = "call.audio_frame";
    pub const CALL_AUDIO_CAPTURE_ERROR: &str = "call.audio_capture_error";
    pub const CALL_TRANSCRIPTION: &str = "call.transcription";
    pub const CALL_ASR_ERROR: &str = "call.asr_error";
    pub const CALL_ASR_DISCONNECTED: &str = "call.asr_disconnected";
    pub const CALL_SPEAK_STARTED: &str = "call.speak_started";
    pub const CALL_SPEAK_FINISHED: &str = "call.speak_finished";
    pub const CALL_SPEAK_ERROR: &str = "call.speak_error";
    pub const CALL_PLAYBACK_STREAM_STARTED: &str = "call.playback_stream_started";
    pub const CALL_PLAYBACK_STREAM_FINISHED: &str = "call.playback_stream_finished";
    pub const CALL_PLAYBACK_STREAM_ERROR: &str = "call.playback_stream_error";
    pub const CALL_ENDED: &str = "call.ended";
    pub const BRIDGE_CREATED: &str = "bridge.created";
    pub const BRIDGE_DESTROYED: &str = "bridge.destroyed";
}

/// One event on the stream. `data` shape depends on `event_type`.
#[derive(Debug, Clone, Serialize)]
pub struct CallEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "callID")]
    pub call_id: Option<CallId>,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl CallEvent {
    pub fn call(event_type: &str, call_id: &CallId, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            call_id: Some(call_id.clone()),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn bridge(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            call_id: None,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Broadcast bus for [`CallEvent`]s.
///
/// Delivery to subscribers is best-effort: a lagging receiver loses old
/// events rather than stalling producers.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CallEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: CallEvent) {
        trace!(event_type = %event.event_type, "emit");
        // No receivers is fine; the stream simply has no subscribers yet.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        // Audio-frame events are ~1 KiB each at 50/s per call; a few
        // thousand buffered events rides out slow subscribers.
        Self::new(4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_emission_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let call_id = CallId::from("c1");

        for i in 0..10 {
            bus.emit(CallEvent::call(
                event_types::CALL_STATE_CHANGED,
                &call_id,
                serde_json::json!({ "seq": i }),
            ));
        }

        for i in 0..10 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.data["seq"], i);
        }
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(CallEvent::bridge(
            event_types::BRIDGE_CREATED,
            serde_json::json!({ "id": "b1" }),
        ));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = CallEvent::call(
            event_types::CALL_READY,
            &CallId::from("abc"),
            serde_json::json!({}),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "call.ready");
        assert_eq!(json["callID"], "abc");
        assert!(json["timestamp"].is_string());
    }
}
