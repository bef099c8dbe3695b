//! TTS synthesis client.
//!
//! One HTTP request per utterance against the configured TTS server, with
//! per-call cancellation: a newer `speak` for the same call aborts the one
//! in flight (most recent wins), and call teardown aborts whatever remains.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use crate::call::CallId;
use crate::config::TtsConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct SpeakRequest {
    pub text: String,
    pub voice: Option<String>,
    pub language: Option<String>,
    pub speed: Option<f32>,
}

#[derive(Serialize)]
struct SynthesisBody<'a> {
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
    language: &'a str,
}

/// Result of one synthesis: the WAV payload plus the resolved parameters.
#[derive(Debug)]
pub struct Synthesis {
    pub wav: Vec<u8>,
    pub voice: String,
    pub language: String,
}

pub struct TtsClient {
    config: TtsConfig,
    http: reqwest::Client,
    inflight: DashMap<CallId, Arc<Notify>>,
}

impl TtsClient {
    pub fn new(config: TtsConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            http: reqwest::Client::new(),
            inflight: DashMap::new(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.config.url.is_some()
    }

    pub fn default_voice(&self) -> &str {
        &self.config.default_voice
    }

    pub fn default_language(&self) -> &str {
        &self.config.default_language
    }

    /// Fetch synthesized speech for one call. Supersedes any in-flight
    /// request for the same call.
    pub async fn synthesize(&self, call_id: &CallId, request: &SpeakRequest) -> Result<Synthesis> {
        let url = self
            .config
            .url
            .clone()
            .ok_or_else(|| Error::NotImplemented("no TTS server configured".into()))?;

        let voice = request
            .voice
            .clone()
            .unwrap_or_else(|| self.config.default_voice.clone());
        let language = request
            .language
            .clone()
            .unwrap_or_else(|| self.config.default_language.clone());

        // Most recent wins: wake whoever was in flight for this call.
        let token = Arc::new(Notify::new());
        if let Some(previous) = self.inflight.insert(call_id.clone(), Arc::clone(&token)) {
            debug!(call = %call_id, "superseding in-flight TTS request");
            previous.notify_one();
        }

        let body = SynthesisBody {
            input: &request.text,
            voice: &voice,
            response_format: "wav",
            speed: request.speed,
            language: &language,
        };

        let fetch = async {
            let response = self.http.post(&url).json(&body).send().await?;
            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(Error::upstream(status.as_u16(), message));
            }
            let wav = response.bytes().await?.to_vec();
            Ok(wav)
        };

        let result = tokio::select! {
            _ = token.notified() => Err(Error::Cancelled(format!("TTS for call {call_id}"))),
            outcome = tokio::time::timeout(self.config.timeout(), fetch) => {
                match outcome {
                    Err(_) => Err(Error::tts_timeout("TTS synthesis")),
                    Ok(result) => result,
                }
            }
        };

        // Only clear the slot if it is still ours; a superseding request
        // may already have replaced it.
        self.inflight
            .remove_if(call_id, |_, current| Arc::ptr_eq(current, &token));

        result.map(|wav| Synthesis {
            wav,
            voice,
            language,
        })
    }

    /// Abort whatever is in flight for this call (call teardown path).
    pub fn cancel(&self, call_id: &CallId) {
        if let Some((_, token)) = self.inflight.remove(call_id) {
            token.notify_one();
        }
    }
}
