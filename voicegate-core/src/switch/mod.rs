//! Typed adapter over the switch's REST + event-stream control interface.
//!
//! The rest of the service only sees [`SwitchApi`] and the [`SwitchEvent`]
//! enum; protocol details, auth, deadlines, and error normalization all live
//! behind them.

pub mod client;
pub mod events;
pub mod types;

pub use client::{ExternalMediaParams, HttpSwitch, OriginateParams, SnoopParams, SwitchApi};
pub use events::{spawn_event_pump, StasisWaiters};
pub use types::{
    is_synthetic_channel_id, Bridge, CallerInfo, Channel, Endpoint, LiveRecording, Playback,
    StoredRecording, SwitchEvent, MEDIA_CONNECTION_VAR,
};

/// Deadline for every setup-path call against the switch.
pub const SETUP_DEADLINE: std::time::Duration = std::time::Duration::from_secs(10);

/// Deadline for connecting a media socket.
pub const MEDIA_CONNECT_DEADLINE: std::time::Duration = std::time::Duration::from_secs(5);

/// Fixed delay before the event link reconnects after a drop.
pub const RECONNECT_DELAY: std::time::Duration = std::time::Duration::from_secs(5);
