//! OpenAI-compatible HTTP completion provider.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::{Provider, ProviderOutput};
use crate::error::{ControlError, Result};

/// Provider backed by an OpenAI-compatible chat-completions endpoint.
///
/// The control plane treats the wire format as a detail: parameters carry a
/// `prompt` field (everything else is serialized into the user message), and
/// the reported token usage becomes `units_consumed` in thousands.
pub struct HttpProvider {
    id: String,
    client: Client,
    endpoint: String,
    model: Option<String>,
    api_key: Option<String>,
    unit_cost_cents: f64,
}

impl HttpProvider {
    pub fn new(
        id: String,
        endpoint: String,
        model: Option<String>,
        api_key: Option<String>,
        unit_cost_cents: f64,
    ) -> Self {
        Self {
            id,
            client: Client::new(),
            endpoint,
            model,
            api_key,
            unit_cost_cents,
        }
    }

    fn provider_err(&self, message: impl Into<String>) -> ControlError {
        ControlError::Provider {
            provider: self.id.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn unit_cost_cents(&self) -> f64 {
        self.unit_cost_cents
    }

    async fn invoke(&self, params: &serde_json::Value) -> Result<ProviderOutput> {
        let prompt = params
            .get("prompt")
            .and_then(|p| p.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| params.to_string());

        let request = CompletionRequest {
            model: self.model.clone(),
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: prompt,
            }],
        };

        tracing::debug!(provider = %self.id, "invoking completion endpoint");
        let start = Instant::now();

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                self.provider_err(format!("request timeout: {}", e))
            } else if e.is_connect() {
                self.provider_err(format!("connection failed: {}", e))
            } else {
                self.provider_err(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(self.provider_err(format!("HTTP {}: {}", status.as_u16(), body)));
        }

        let parsed: CompletionResponse = serde_json::from_str(&body)
            .map_err(|e| self.provider_err(format!("failed to parse response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| self.provider_err("no choices in response"))?;

        // Price per 1K tokens; fall back to a conservative single unit when
        // the upstream does not report usage.
        let units = parsed
            .usage
            .map(|u| u.total_tokens as f64 / 1000.0)
            .unwrap_or(1.0);

        Ok(ProviderOutput {
            output: serde_json::json!({ "content": content }),
            units_consumed: units,
            latency_ms: start.elapsed().as_millis() as i64,
        })
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<WireMessage>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    total_tokens: u64,
}
