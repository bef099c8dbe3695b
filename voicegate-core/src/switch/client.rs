//! REST side of the switch adapter.
//!
//! [`SwitchApi`] is the narrow surface the orchestrator and pipelines are
//! allowed to touch; [`HttpSwitch`] is the production implementation. Tests
//! substitute their own.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::SwitchConfig;
use crate::error::{Error, Result};
use crate::switch::types::{Bridge, Channel, Endpoint, Playback, StoredRecording};
use crate::switch::SETUP_DEADLINE;

#[derive(Debug, Clone, Default)]
pub struct OriginateParams {
    /// `technology/resource`, e.g. `PJSIP/9901`.
    pub endpoint: String,
    pub caller_id: Option<String>,
    pub timeout_secs: Option<u32>,
    pub channel_id: Option<String>,
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SnoopParams {
    /// Channel being mirrored.
    pub channel_id: String,
    /// ID to assign the mirror channel.
    pub snoop_id: String,
    /// Which direction to mirror: `in`, `out`, or `both`.
    pub spy: String,
}

#[derive(Debug, Clone)]
pub struct ExternalMediaParams {
    /// ID to assign the external-media channel.
    pub channel_id: String,
    /// slin codec name, e.g. `slin16`.
    pub format: String,
}

/// Operations the core invokes on the switch. One method per protocol
/// operation; every implementation owns its own deadlines.
#[async_trait]
pub trait SwitchApi: Send + Sync {
    // Channels
    async fn originate(&self, params: OriginateParams) -> Result<Channel>;
    async fn answer(&self, id: &str) -> Result<()>;
    async fn ring(&self, id: &str) -> Result<()>;
    async fn hangup(&self, id: &str, reason: Option<&str>) -> Result<()>;
    async fn play(&self, channel_id: &str, media_uri: &str, playback_id: &str)
        -> Result<Playback>;
    async fn record(&self, channel_id: &str, name: &str, format: &str, max_seconds: u32)
        -> Result<()>;
    async fn send_dtmf(&self, channel_id: &str, digits: &str) -> Result<()>;
    async fn snoop(&self, params: SnoopParams) -> Result<Channel>;
    async fn external_media(&self, params: ExternalMediaParams) -> Result<Channel>;

    // Bridges
    async fn create_bridge(&self, name: &str) -> Result<Bridge>;
    async fn get_bridge(&self, id: &str) -> Result<Bridge>;
    async fn list_bridges(&self) -> Result<Vec<Bridge>>;
    async fn destroy_bridge(&self, id: &str) -> Result<()>;
    async fn add_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()>;
    async fn remove_from_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()>;

    // Stored recordings
    async fn list_recordings(&self) -> Result<Vec<StoredRecording>>;
    async fn get_recording(&self, name: &str) -> Result<StoredRecording>;
    async fn get_recording_bytes(&self, name: &str) -> Result<Vec<u8>>;
    async fn delete_recording(&self, name: &str) -> Result<()>;
    async fn copy_recording(&self, name: &str, destination: &str) -> Result<StoredRecording>;

    // Endpoints
    async fn list_endpoints(&self) -> Result<Vec<Endpoint>>;
    async fn get_endpoint(&self, technology: &str, resource: &str) -> Result<Endpoint>;

    /// URL a media socket client should connect to for a server-mode
    /// external-media channel with the given connection identifier.
    fn media_socket_url(&self, connection_id: &str) -> String;

    /// Whether the event link is currently up.
    fn connected(&self) -> bool {
        true
    }
}

/// Production switch client over HTTP.
pub struct HttpSwitch {
    http: reqwest::Client,
    base: String,
    ws_base: String,
    username: String,
    password: String,
    app: String,
    link_up: Arc<AtomicBool>,
}

impl HttpSwitch {
    pub fn new(config: &SwitchConfig) -> Self {
        let base = config.url.trim_end_matches('/').to_string();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            format!("ws://{base}")
        };
        Self {
            http: reqwest::Client::new(),
            base,
            ws_base,
            username: config.username.clone(),
            password: config.password.clone(),
            app: config.app.clone(),
            link_up: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag the event pump flips as the event link comes and goes.
    pub fn link_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.link_up)
    }

    /// Event-socket URL for the pump.
    pub fn events_url(&self) -> String {
        format!(
            "{}/ari/events?app={}&api_key={}:{}&subscribeAll=true",
            self.ws_base, self.app, self.username, self.password
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/ari{path}", self.base)
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let req = req.basic_auth(&self.username, Some(&self.password));
        let response = tokio::time::timeout(SETUP_DEADLINE, req.send())
            .await
            .map_err(|_| Error::timeout(format!("switch: {what}")))??;
        Self::check(response).await
    }

    /// Normalize a failed switch response into `{status, message}` by
    /// digging a `message`/`error` field out of the JSON body when there
    /// is one.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("message")
                    .or_else(|| v.get("error"))
                    .and_then(|m| m.as_str().map(str::to_string))
            })
            .unwrap_or(body);
        Err(Error::upstream(status.as_u16(), message))
    }

    async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        response
            .json::<T>()
            .await
            .map_err(|e| Error::Protocol(format!("switch response: {e}")))
    }
}

/// Rewrite an upstream 404 into the domain's not-found class.
fn map_404(err: Error, kind: &'static str, id: &str) -> Error {
    match err {
        Error::Upstream { status, .. } if status == StatusCode::NOT_FOUND.as_u16() => {
            Error::not_found(kind, id)
        }
        other => other,
    }
}

#[async_trait]
impl SwitchApi for HttpSwitch {
    async fn originate(&self, params: OriginateParams) -> Result<Channel> {
        let mut query: Vec<(&str, String)> = vec![
            ("endpoint", params.endpoint.clone()),
            ("app", self.app.clone()),
        ];
        if let Some(caller_id) = &params.caller_id {
            query.push(("callerId", caller_id.clone()));
        }
        if let Some(timeout) = params.timeout_secs {
            query.push(("timeout", timeout.to_string()));
        }
        if let Some(channel_id) = &params.channel_id {
            query.push(("channelId", channel_id.clone()));
        }
        let body = serde_json::json!({ "variables": params.variables });
        let req = self.http.post(self.url("/channels")).query(&query).json(&body);
        Self::parse(self.send(req, "originate").await?).await
    }

    async fn answer(&self, id: &str) -> Result<()> {
        let req = self.http.post(self.url(&format!("/channels/{id}/answer")));
        self.send(req, "answer").await.map(|_| ())
    }

    async fn ring(&self, id: &str) -> Result<()> {
        let req = self.http.post(self.url(&format!("/channels/{id}/ring")));
        self.send(req, "ring").await.map(|_| ())
    }

    async fn hangup(&self, id: &str, reason: Option<&str>) -> Result<()> {
        let mut req = self.http.delete(self.url(&format!("/channels/{id}")));
        if let Some(reason) = reason {
            req = req.query(&[("reason", reason)]);
        }
        self.send(req, "hangup").await.map(|_| ())
    }

    async fn play(
        &self,
        channel_id: &str,
        media_uri: &str,
        playback_id: &str,
    ) -> Result<Playback> {
        let req = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/play/{playback_id}")))
            .query(&[("media", media_uri)]);
        Self::parse(
            self.send(req, "play")
                .await
                .map_err(|e| map_404(e, "channel", channel_id))?,
        )
        .await
    }

    async fn record(
        &self,
        channel_id: &str,
        name: &str,
        format: &str,
        max_seconds: u32,
    ) -> Result<()> {
        let max_seconds = max_seconds.to_string();
        let req = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/record")))
            .query(&[
                ("name", name),
                ("format", format),
                ("maxDurationSeconds", max_seconds.as_str()),
                ("ifExists", "overwrite"),
            ]);
        self.send(req, "record").await.map(|_| ())
    }

    async fn send_dtmf(&self, channel_id: &str, digits: &str) -> Result<()> {
        let req = self
            .http
            .post(self.url(&format!("/channels/{channel_id}/dtmf")))
            .query(&[("dtmf", digits)]);
        self.send(req, "dtmf")
            .await
            .map(|_| ())
            .map_err(|e| map_404(e, "channel", channel_id))
    }

    async fn snoop(&self, params: SnoopParams) -> Result<Channel> {
        let req = self
            .http
            .post(self.url(&format!(
                "/channels/{}/snoop/{}",
                params.channel_id, params.snoop_id
            )))
            .query(&[("app", self.app.as_str()), ("spy", params.spy.as_str())]);
        Self::parse(self.send(req, "snoop").await?).await
    }

    async fn external_media(&self, params: ExternalMediaParams) -> Result<Channel> {
        let req = self
            .http
            .post(self.url("/channels/externalMedia"))
            .query(&[
                ("app", self.app.as_str()),
                ("channelId", params.channel_id.as_str()),
                ("format", params.format.as_str()),
                ("transport", "websocket"),
                ("encapsulation", "none"),
                ("external_host", "INCOMING"),
            ]);
        Self::parse(self.send(req, "external media").await?).await
    }

    async fn create_bridge(&self, name: &str) -> Result<Bridge> {
        let req = self
            .http
            .post(self.url("/bridges"))
            .query(&[("type", "mixing"), ("name", name)]);
        Self::parse(self.send(req, "create bridge").await?).await
    }

    async fn get_bridge(&self, id: &str) -> Result<Bridge> {
        let req = self.http.get(self.url(&format!("/bridges/{id}")));
        Self::parse(
            self.send(req, "get bridge")
                .await
                .map_err(|e| map_404(e, "bridge", id))?,
        )
        .await
    }

    async fn list_bridges(&self) -> Result<Vec<Bridge>> {
        let req = self.http.get(self.url("/bridges"));
        Self::parse(self.send(req, "list bridges").await?).await
    }

    async fn destroy_bridge(&self, id: &str) -> Result<()> {
        let req = self.http.delete(self.url(&format!("/bridges/{id}")));
        self.send(req, "destroy bridge")
            .await
            .map(|_| ())
            .map_err(|e| map_404(e, "bridge", id))
    }

    async fn add_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        let req = self
            .http
            .post(self.url(&format!("/bridges/{bridge_id}/addChannel")))
            .query(&[("channel", channel_id)]);
        self.send(req, "add to bridge").await.map(|_| ())
    }

    async fn remove_from_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<()> {
        let req = self
            .http
            .post(self.url(&format!("/bridges/{bridge_id}/removeChannel")))
            .query(&[("channel", channel_id)]);
        self.send(req, "remove from bridge").await.map(|_| ())
    }

    async fn list_recordings(&self) -> Result<Vec<StoredRecording>> {
        let req = self.http.get(self.url("/recordings/stored"));
        Self::parse(self.send(req, "list recordings").await?).await
    }

    async fn get_recording(&self, name: &str) -> Result<StoredRecording> {
        let req = self.http.get(self.url(&format!("/recordings/stored/{name}")));
        Self::parse(
            self.send(req, "get recording")
                .await
                .map_err(|e| map_404(e, "recording", name))?,
        )
        .await
    }

    async fn get_recording_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let req = self
            .http
            .get(self.url(&format!("/recordings/stored/{name}/file")));
        let response = self
            .send(req, "get recording file")
            .await
            .map_err(|e| map_404(e, "recording", name))?;
        Ok(response
            .bytes()
            .await
            .map_err(|e| Error::Protocol(format!("recording body: {e}")))?
            .to_vec())
    }

    async fn delete_recording(&self, name: &str) -> Result<()> {
        let req = self.http.delete(self.url(&format!("/recordings/stored/{name}")));
        self.send(req, "delete recording")
            .await
            .map(|_| ())
            .map_err(|e| map_404(e, "recording", name))
    }

    async fn copy_recording(&self, name: &str, destination: &str) -> Result<StoredRecording> {
        let req = self
            .http
            .post(self.url(&format!("/recordings/stored/{name}/copy")))
            .query(&[("destinationRecordingName", destination)]);
        Self::parse(
            self.send(req, "copy recording")
                .await
                .map_err(|e| map_404(e, "recording", name))?,
        )
        .await
    }

    async fn list_endpoints(&self) -> Result<Vec<Endpoint>> {
        let req = self.http.get(self.url("/endpoints"));
        Self::parse(self.send(req, "list endpoints").await?).await
    }

    async fn get_endpoint(&self, technology: &str, resource: &str) -> Result<Endpoint> {
        let req = self
            .http
            .get(self.url(&format!("/endpoints/{technology}/{resource}")));
        Self::parse(
            self.send(req, "get endpoint")
                .await
                .map_err(|e| map_404(e, "endpoint", resource))?,
        )
        .await
    }

    fn media_socket_url(&self, connection_id: &str) -> String {
        format!("{}/media/{connection_id}", self.ws_base)
    }

    fn connected(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }
}
