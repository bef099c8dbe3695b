//! Fire-and-forget webhook delivery.
//!
//! Selected call events are POSTed to a single configured URL. Delivery
//! failures are logged and never surface into call handling.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WebhookNotifier {
    url: Option<String>,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            url,
            http: reqwest::Client::new(),
        })
    }

    pub fn disabled() -> Arc<Self> {
        Self::new(None)
    }

    /// Deliver `{event, data, timestamp}` in the background.
    pub fn notify(&self, event: &str, data: serde_json::Value) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let body = serde_json::json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now(),
        });
        let http = self.http.clone();
        let event = event.to_string();
        tokio::spawn(async move {
            let result = http
                .post(&url)
                .timeout(DELIVERY_TIMEOUT)
                .json(&body)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    debug!(%event, "webhook delivered");
                }
                Ok(response) => {
                    warn!(%event, status = %response.status(), "webhook rejected");
                }
                Err(e) => {
                    warn!(%event, "webhook delivery failed: {e}");
                }
            }
        });
    }
}
