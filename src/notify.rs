//! Outbound notifications.
//!
//! Decisions and pending approvals are announced to an optional webhook
//! URL. Delivery is fire-and-forget on a spawned task after the state
//! change has committed; a delivery failure is logged and never unwinds
//! the decision.

use serde_json::json;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl Notifier {
    pub fn new(url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Post `{event, payload}` to the configured URL, if any. Returns
    /// immediately; the request runs on its own task.
    pub fn send(&self, event: &str, payload: serde_json::Value) {
        let Some(url) = self.url.clone() else {
            debug!(event, "no notify url configured, dropping event");
            return;
        };
        let client = self.client.clone();
        let event = event.to_string();
        tokio::spawn(async move {
            let body = json!({ "event": event, "payload": payload });
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(event, "notification delivered");
                }
                Ok(resp) => {
                    warn!(event, status = %resp.status(), "notification rejected");
                }
                Err(err) => {
                    warn!(event, error = %err, "notification delivery failed");
                }
            }
        });
    }
}
