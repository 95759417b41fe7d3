use super::{ReplyRequest, ReplyTransport, TransportError};
use crate::db::models::Sender;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// Identifies this client in the `from` field of every request.
    pub from: String,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct WebhookRequest<'a> {
    message: &'a str,
    sender: &'static str,
    timestamp: String,
    from: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a str>,
}

pub struct WebhookClient {
    client: Client,
    config: WebhookConfig,
}

impl WebhookClient {
    pub fn new(config: WebhookConfig) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    async fn post(&self, body: &Value) -> Result<Option<String>, TransportError> {
        let resp = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(TransportError::Api {
                status,
                message: text,
            });
        }

        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);
        let text = resp.text().await?;
        debug!("Webhook responded ({} bytes, json: {})", text.len(), is_json);

        if is_json {
            if let Ok(data) = serde_json::from_str::<Value>(&text) {
                return Ok(extract_reply(&data));
            }
        }
        Ok(non_blank(&text))
    }

    /// Re-posts `body` without waiting for or reading the response, so the
    /// backend still receives the message.
    fn deliver_detached(&self, body: Value) {
        let client = self.client.clone();
        let url = self.config.url.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(_) => debug!("Detached webhook delivery sent"),
                Err(e) => warn!("Detached webhook delivery failed: {}", e),
            }
        });
    }
}

#[async_trait]
impl ReplyTransport for WebhookClient {
    async fn request_reply(&self, request: &ReplyRequest) -> Option<String> {
        if request.sender == Sender::Bot {
            debug!("Not forwarding bot-authored message to webhook");
            return None;
        }

        let body = WebhookRequest {
            message: &request.message,
            sender: Sender::User.as_str(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            from: &self.config.from,
            context: request.context.as_deref(),
        };
        let body = match serde_json::to_value(&body) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to encode webhook request: {}", e);
                return None;
            }
        };

        info!("Sending message to webhook");
        match self.post(&body).await {
            Ok(Some(reply)) => Some(reply),
            Ok(None) => {
                info!("Webhook accepted the message but returned no usable reply");
                None
            }
            Err(e) => {
                warn!("Webhook request failed: {}", e);
                self.deliver_detached(body);
                None
            }
        }
    }
}

/// Pulls the reply text out of the shapes automation backends answer with.
pub fn extract_reply(data: &Value) -> Option<String> {
    const PATHS: &[&[&str]] = &[
        &["output"],
        &["data", "output"],
        &["item", "json", "output"],
        &["response"],
        &["message"],
    ];

    for path in PATHS {
        let found = path.iter().try_fold(data, |node, key| node.get(key));
        if let Some(text) = found.and_then(Value::as_str).and_then(non_blank) {
            return Some(text);
        }
    }

    first_string(data)
}

/// Depth-first search for the first non-blank string value.
fn first_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => non_blank(s),
        Value::Array(items) => items.iter().find_map(first_string),
        Value::Object(map) => map.values().find_map(first_string),
        _ => None,
    }
}

fn non_blank(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
