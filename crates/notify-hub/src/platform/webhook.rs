//! Generic webhook platform.
//!
//! Posts a JSON envelope of the message to each target URL.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header::HeaderMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Platform;
use crate::message::Message;
use crate::result::DeliveryResult;
use crate::target::{TARGET_TYPE_WEBHOOK, Target};
use crate::{Error, Result};

/// Webhook platform configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Registry name of this platform instance.
    #[serde(default = "default_name")]
    pub name: String,
    /// HTTP method (default: POST).
    #[serde(default = "default_method")]
    pub method: String,
    /// Custom headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// Authentication type.
    pub auth: Option<WebhookAuth>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Largest accepted title + body size in bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Optional URL probed by health checks.
    pub health_url: Option<String>,
}

fn default_name() -> String {
    "webhook".to_string()
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

/// Webhook authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WebhookAuth {
    /// Bearer token authentication.
    Bearer { token: String },
    /// Basic authentication.
    Basic { username: String, password: String },
    /// Custom header authentication.
    Header { name: String, value: String },
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            method: default_method(),
            headers: Vec::new(),
            auth: None,
            timeout_secs: default_timeout(),
            max_body_bytes: default_max_body_bytes(),
            health_url: None,
        }
    }
}

/// Generic webhook platform.
pub struct WebhookPlatform {
    config: WebhookConfig,
    client: Client,
    closed: AtomicBool,
}

impl WebhookPlatform {
    /// Create a new webhook platform.
    pub fn new(config: WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self {
            config,
            client,
            closed: AtomicBool::new(false),
        }
    }

    /// Build the request headers.
    fn build_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &self.config.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<reqwest::header::HeaderName>(),
                value.parse::<reqwest::header::HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        if let Some(auth) = &self.config.auth {
            match auth {
                WebhookAuth::Bearer { token } => {
                    if let Ok(value) = format!("Bearer {}", token).parse() {
                        headers.insert(reqwest::header::AUTHORIZATION, value);
                    }
                }
                WebhookAuth::Header { name, value } => {
                    if let (Ok(name), Ok(value)) = (
                        name.parse::<reqwest::header::HeaderName>(),
                        value.parse::<reqwest::header::HeaderValue>(),
                    ) {
                        headers.insert(name, value);
                    }
                }
                // Applied on the request builder.
                WebhookAuth::Basic { .. } => {}
            }
        }

        headers
    }

    /// Build the JSON payload for one target.
    fn build_payload(&self, message: &Message, target: &Target) -> serde_json::Value {
        let mut payload = json!({
            "message_id": message.id,
            "title": message.title,
            "body": message.body,
            "format": message.format.as_str(),
            "priority": message.priority.to_string(),
            "metadata": message.metadata,
            "target": target.value,
        });

        if let Some(extra) = message.platform_data(&self.config.name) {
            payload["data"] = extra.clone();
        }

        payload
    }

    async fn post(&self, message: &Message, target: &Target) -> Result<serde_json::Value> {
        let mut request = match self.config.method.to_uppercase().as_str() {
            "PUT" => self.client.put(&target.value),
            _ => self.client.post(&target.value),
        };

        request = request
            .headers(self.build_headers())
            .json(&self.build_payload(message, target));

        if let Some(WebhookAuth::Basic { username, password }) = &self.config.auth {
            request = request.basic_auth(username, Some(password));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(Duration::from_secs(self.config.timeout_secs))
            } else {
                Error::from(e)
            }
        })?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            warn!(platform = %self.config.name, %status, "Webhook failed");
            return Err(classify_status(status, &body));
        }

        let body_json = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
        Ok(json!({ "status": status.as_u16(), "body": body_json }))
    }

    async fn send_one(
        &self,
        token: &CancellationToken,
        message: &Message,
        target: &Target,
    ) -> DeliveryResult {
        if target.target_type != TARGET_TYPE_WEBHOOK {
            return DeliveryResult::failed(
                &message.id,
                target.clone(),
                Error::InvalidTargetType(target.target_type.clone()),
            );
        }
        if target.value.trim().is_empty() {
            return DeliveryResult::failed(&message.id, target.clone(), Error::EmptyTargetValue);
        }

        let outcome = tokio::select! {
            _ = token.cancelled() => Err(Error::cancelled()),
            outcome = self.post(message, target) => outcome,
        };

        match outcome {
            Ok(response) => {
                debug!(platform = %self.config.name, recipient = %target.value, "Webhook delivered");
                DeliveryResult::sent(&message.id, target.clone()).with_response(response)
            }
            Err(e) => DeliveryResult::failed(&message.id, target.clone(), e),
        }
    }
}

/// Map a non-success HTTP status to a delivery error.
fn classify_status(status: StatusCode, body: &str) -> Error {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::InvalidCredentials(format!("{} - {}", status, body))
        }
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited,
        _ => Error::transport(format!("webhook failed: {} - {}", status, body)),
    }
}

#[async_trait]
impl Platform for WebhookPlatform {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn send(
        &self,
        token: &CancellationToken,
        message: &Message,
        targets: &[Target],
    ) -> Result<Vec<DeliveryResult>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transport(format!(
                "platform {} is closed",
                self.config.name
            )));
        }

        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            results.push(self.send_one(token, message, target).await);
        }
        Ok(results)
    }

    fn validate(&self, message: &Message) -> Result<()> {
        let size = message.title.len() + message.body.len();
        if size > self.config.max_body_bytes {
            return Err(Error::invalid_message(format!(
                "message is {} bytes, webhook limit is {}",
                size, self.config.max_body_bytes
            )));
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn health_check(&self) -> Result<()> {
        if !self.is_available() {
            return Err(Error::transport(format!(
                "platform {} is closed",
                self.config.name
            )));
        }
        let Some(url) = &self.config.health_url else {
            return Ok(());
        };

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::transport(format!(
                "health probe returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(platform = %self.config.name, "Webhook platform closed");
        }
        Ok(())
    }
}
