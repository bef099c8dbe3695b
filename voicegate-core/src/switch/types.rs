//! Wire types for the switch protocol.
//!
//! Only the fields the orchestrator actually reads are modeled; everything
//! else in the switch's JSON passes through undeserialized.

use serde::{Deserialize, Serialize};

/// Channel variable carrying the media-socket connection identifier for a
/// server-mode external-media channel.
pub const MEDIA_CONNECTION_VAR: &str = "MEDIA_WEBSOCKET_CONNECTION_ID";

/// Prefixes of channel IDs we mint for internal synthetic channels. Events
/// for these never correspond to real calls and are kept out of call
/// dispatch.
pub const SYNTHETIC_CHANNEL_PREFIXES: [&str; 4] = ["snoop-", "audiocap-", "ttsplay-", "xfer-"];

pub fn is_synthetic_channel_id(id: &str) -> bool {
    SYNTHETIC_CHANNEL_PREFIXES
        .iter()
        .any(|prefix| id.starts_with(prefix))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub number: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DialplanInfo {
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub exten: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub caller: CallerInfo,
    #[serde(default)]
    pub dialplan: DialplanInfo,
    #[serde(default)]
    pub channelvars: Option<serde_json::Value>,
}

impl Channel {
    /// Read a channel variable from the protocol object, if present.
    pub fn var(&self, name: &str) -> Option<String> {
        self.channelvars
            .as_ref()?
            .get(name)?
            .as_str()
            .map(|s| s.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Bridge {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "bridge_type")]
    pub bridge_type: String,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Endpoint {
    pub technology: String,
    pub resource: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Playback {
    pub id: String,
    #[serde(default)]
    pub media_uri: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoredRecording {
    pub name: String,
    #[serde(default)]
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiveRecording {
    pub name: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub cause: String,
}

/// Events delivered over the switch's event socket.
///
/// Unknown event types deserialize to `Unknown` rather than failing the
/// whole stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum SwitchEvent {
    StasisStart {
        #[serde(default)]
        args: Vec<String>,
        channel: Channel,
    },
    StasisEnd {
        channel: Channel,
    },
    ChannelStateChange {
        channel: Channel,
    },
    ChannelDtmfReceived {
        digit: String,
        #[serde(default)]
        duration_ms: u64,
        channel: Channel,
    },
    ChannelDestroyed {
        #[serde(default)]
        cause: i32,
        #[serde(default)]
        cause_txt: String,
        channel: Channel,
    },
    ChannelVarset {
        variable: String,
        #[serde(default)]
        value: String,
        #[serde(default)]
        channel: Option<Channel>,
    },
    PlaybackStarted {
        playback: Playback,
    },
    PlaybackFinished {
        playback: Playback,
    },
    RecordingFinished {
        recording: LiveRecording,
    },
    RecordingFailed {
        recording: LiveRecording,
    },
    BridgeCreated {
        bridge: Bridge,
    },
    BridgeDestroyed {
        bridge: Bridge,
    },
    Dial {
        #[serde(default)]
        dialstatus: String,
        #[serde(default)]
        peer: Option<Channel>,
    },
    #[serde(other)]
    Unknown,
}

impl SwitchEvent {
    /// The channel this event is about, when it is about one.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            SwitchEvent::StasisStart { channel, .. }
            | SwitchEvent::StasisEnd { channel }
            | SwitchEvent::ChannelStateChange { channel }
            | SwitchEvent::ChannelDtmfReceived { channel, .. }
            | SwitchEvent::ChannelDestroyed { channel, .. } => Some(&channel.id),
            SwitchEvent::ChannelVarset { channel, .. } => channel.as_ref().map(|c| c.id.as_str()),
            _ => None,
        }
    }
}
