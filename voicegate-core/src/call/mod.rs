//! Call domain model: identifiers, lifecycle states, and per-call records.

pub mod bridges;
pub mod events;
pub mod registry;

pub use bridges::{BridgeRecord, BridgeRegistry};
pub use events::{event_types, CallEvent, EventBus};
pub use registry::CallRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::asr::AsrSession;
use crate::capture::CaptureHandle;
use crate::playback::PlaybackHandle;

/// Stable opaque identifier for one call, minted by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    pub fn generate() -> Self {
        CallId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        CallId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Call lifecycle states.
///
/// `Playing`, `Speaking`, `Recording`, and `Bridged` are transient work
/// states; completing the work returns the call to whichever of
/// `Answered`/`Ready` it held at entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Initiating,
    Ringing,
    Answered,
    Ready,
    Playing,
    Speaking,
    Recording,
    Bridged,
    Ended,
    Failed,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Ended | CallState::Failed)
    }

    pub fn is_work_state(self) -> bool {
        matches!(
            self,
            CallState::Playing | CallState::Speaking | CallState::Recording | CallState::Bridged
        )
    }

    /// Whether the lifecycle permits `self -> next`.
    pub fn can_transition_to(self, next: CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == CallState::Ended {
            return true;
        }
        match (self, next) {
            (CallState::Initiating, CallState::Ringing | CallState::Failed) => true,
            (CallState::Ringing, CallState::Answered) => true,
            (CallState::Answered, CallState::Ready) => true,
            (CallState::Answered | CallState::Ready, n) if n.is_work_state() => true,
            (s, CallState::Answered | CallState::Ready) if s.is_work_state() => true,
            // Superseding work (e.g. back-to-back speak) stays legal.
            (s, n) if s.is_work_state() && n.is_work_state() => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Initiating => "initiating",
            CallState::Ringing => "ringing",
            CallState::Answered => "answered",
            CallState::Ready => "ready",
            CallState::Playing => "playing",
            CallState::Speaking => "speaking",
            CallState::Recording => "recording",
            CallState::Bridged => "bridged",
            CallState::Ended => "ended",
            CallState::Failed => "failed",
        }
    }
}

/// One live (or recently ended) call.
///
/// Owned exclusively by the orchestrator; everyone else sees
/// [`CallSnapshot`]s.
pub struct CallRecord {
    pub id: CallId,
    pub channel_id: String,
    pub direction: CallDirection,
    pub caller_number: String,
    pub callee_number: String,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub hangup_cause: Option<String>,
    pub state: CallState,
    /// Which of `Answered`/`Ready` to restore when transient work finishes.
    pub resume_state: Option<CallState>,
    pub capture: Option<CaptureHandle>,
    pub playback: Option<PlaybackHandle>,
    pub asr: Option<Arc<AsrSession>>,
    pub bridge_id: Option<String>,
}

impl CallRecord {
    pub fn new(
        id: CallId,
        channel_id: impl Into<String>,
        direction: CallDirection,
        caller_number: impl Into<String>,
        callee_number: impl Into<String>,
        state: CallState,
    ) -> Self {
        Self {
            id,
            channel_id: channel_id.into(),
            direction,
            caller_number: caller_number.into(),
            callee_number: callee_number.into(),
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            hangup_cause: None,
            state,
            resume_state: None,
            capture: None,
            playback: None,
            asr: None,
            bridge_id: None,
        }
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            id: self.id.clone(),
            channel_id: self.channel_id.clone(),
            direction: self.direction,
            caller_number: self.caller_number.clone(),
            callee_number: self.callee_number.clone(),
            created_at: self.created_at,
            answered_at: self.answered_at,
            ended_at: self.ended_at,
            hangup_cause: self.hangup_cause.clone(),
            state: self.state,
            capturing: self.capture.is_some(),
            streaming: self
                .playback
                .as_ref()
                .map(|p| p.is_streaming())
                .unwrap_or(false),
            bridge_id: self.bridge_id.clone(),
        }
    }
}

/// Serializable view of a call for the admin surface and event stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub id: CallId,
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub direction: CallDirection,
    pub caller_number: String,
    pub callee_number: String,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub hangup_cause: Option<String>,
    pub state: CallState,
    pub capturing: bool,
    pub streaming: bool,
    #[serde(rename = "bridgeID")]
    pub bridge_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        use CallState::*;
        assert!(Initiating.can_transition_to(Ringing));
        assert!(Ringing.can_transition_to(Answered));
        assert!(Answered.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Speaking));
        assert!(Speaking.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Ended));
    }

    #[test]
    fn test_work_states_enterable_from_answered() {
        use CallState::*;
        // Outbound calls never reach Ready but still get spoken to.
        assert!(Answered.can_transition_to(Speaking));
        assert!(Speaking.can_transition_to(Answered));
        assert!(Answered.can_transition_to(Bridged));
    }

    #[test]
    fn test_superseding_work() {
        assert!(CallState::Speaking.can_transition_to(CallState::Speaking));
        assert!(CallState::Speaking.can_transition_to(CallState::Playing));
    }

    #[test]
    fn test_terminal_states_are_final() {
        use CallState::*;
        for state in [Ended, Failed] {
            assert!(!state.can_transition_to(Ringing));
            assert!(!state.can_transition_to(Ended));
        }
    }

    #[test]
    fn test_illegal_jumps() {
        use CallState::*;
        assert!(!Initiating.can_transition_to(Answered));
        assert!(!Ringing.can_transition_to(Ready));
        assert!(!Ringing.can_transition_to(Speaking));
        assert!(!Ready.can_transition_to(Answered));
    }

    #[test]
    fn test_anything_live_can_end() {
        use CallState::*;
        for state in [Initiating, Ringing, Answered, Ready, Playing, Speaking, Recording, Bridged]
        {
            assert!(state.can_transition_to(Ended));
        }
    }

    #[test]
    fn test_snapshot_reflects_record() {
        let record = CallRecord::new(
            CallId::generate(),
            "ch-1",
            CallDirection::Inbound,
            "5551234",
            "100",
            CallState::Ringing,
        );
        let snapshot = record.snapshot();
        assert_eq!(snapshot.state, CallState::Ringing);
        assert_eq!(snapshot.caller_number, "5551234");
        assert!(!snapshot.capturing);
    }
}
