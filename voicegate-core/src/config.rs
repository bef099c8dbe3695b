//! Runtime configuration.
//!
//! Loaded from an optional JSON file (`VOICEGATE_CONFIG` or the first CLI
//! argument) with `VOICEGATE_*` environment overrides for the common knobs.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub switch: SwitchConfig,
    pub admin: AdminConfig,
    pub inbound: InboundConfig,
    pub asr: AsrConfig,
    pub tts: TtsConfig,
    pub webhook: WebhookConfig,
    pub allowlist: AllowlistConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    /// Base URL of the switch's REST interface, e.g. `http://127.0.0.1:8088`.
    pub url: String,
    pub username: String,
    pub password: String,
    /// Stasis application name calls are routed into.
    pub app: String,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8088".into(),
            username: "voicegate".into(),
            password: "voicegate".into(),
            app: "voicegate".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9080,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    /// How long the caller hears ringing before the service answers.
    pub ring_delay_ms: u64,
    pub greeting: String,
    pub beep: String,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            ring_delay_ms: 3000,
            greeting: "sound:hello-world".into(),
            beep: "sound:beep".into(),
        }
    }
}

impl InboundConfig {
    pub fn ring_delay(&self) -> Duration {
        Duration::from_millis(self.ring_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    /// WebSocket URL of the ASR server. Unset disables transcription.
    pub url: Option<String>,
    /// Language locked on session open; the server auto-detects otherwise
    /// and flips between languages on silence.
    pub language: String,
    pub reconnect_delay_ms: u64,
    /// 0 = retry forever.
    pub max_reconnect_attempts: u32,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            url: None,
            language: "English".into(),
            reconnect_delay_ms: 2000,
            max_reconnect_attempts: 10,
        }
    }
}

impl AsrConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// HTTP URL of the TTS server. Unset makes `speak` report 501.
    pub url: Option<String>,
    pub default_voice: String,
    pub default_language: String,
    pub timeout_ms: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: None,
            default_voice: "default".into(),
            default_language: "en".into(),
            timeout_ms: 30_000,
        }
    }
}

impl TtsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AllowlistConfig {
    /// Path to a JSON file `{"inbound": [...], "outbound": [...]}`.
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load from the given JSON file, or defaults when `path` is `None`,
    /// then apply environment overrides.
    pub fn load(path: Option<&std::path::Path>) -> Result<Config> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p).map_err(|e| {
                    Error::Validation(format!("cannot read config {}: {e}", p.display()))
                })?;
                serde_json::from_str(&raw)
                    .map_err(|e| Error::Validation(format!("bad config {}: {e}", p.display())))?
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("VOICEGATE_SWITCH_URL") {
            self.switch.url = v;
        }
        if let Ok(v) = std::env::var("VOICEGATE_SWITCH_USERNAME") {
            self.switch.username = v;
        }
        if let Ok(v) = std::env::var("VOICEGATE_SWITCH_PASSWORD") {
            self.switch.password = v;
        }
        if let Ok(v) = std::env::var("VOICEGATE_APP") {
            self.switch.app = v;
        }
        if let Ok(v) = std::env::var("VOICEGATE_ADMIN_HOST") {
            self.admin.host = v;
        }
        if let Some(v) = env_parse("VOICEGATE_ADMIN_PORT") {
            self.admin.port = v;
        }
        if let Ok(v) = std::env::var("VOICEGATE_API_KEY") {
            self.admin.api_key = Some(v);
        }
        if let Some(v) = env_parse("VOICEGATE_RING_DELAY_MS") {
            self.inbound.ring_delay_ms = v;
        }
        if let Ok(v) = std::env::var("VOICEGATE_ASR_URL") {
            self.asr.url = Some(v);
        }
        if let Ok(v) = std::env::var("VOICEGATE_ASR_LANGUAGE") {
            self.asr.language = v;
        }
        if let Ok(v) = std::env::var("VOICEGATE_TTS_URL") {
            self.tts.url = Some(v);
        }
        if let Ok(v) = std::env::var("VOICEGATE_WEBHOOK_URL") {
            self.webhook.url = Some(v);
        }
        if let Ok(v) = std::env::var("VOICEGATE_ALLOWLIST") {
            self.allowlist.path = Some(PathBuf::from(v));
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
