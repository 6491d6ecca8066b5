//! Provider gateway
//!
//! Uniform "send prompt → text | typed error" contract over the
//! heterogeneous external text-generation providers. The executor
//! assumes nothing about wire formats beyond this trait.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use bpd_common::config::ProviderConfig;
use bpd_common::{Error, Result};

const USER_AGENT: &str = concat!("bpd-dx/", env!("CARGO_PKG_VERSION"));

/// Maximum stored length of a provider error body
const ERROR_BODY_LIMIT: usize = 512;

/// Typed provider call failure: an optional HTTP status plus the raw
/// provider message, which the classifier turns into an error kind
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub http_status: Option<u16>,
    pub message: String,
}

impl GatewayError {
    pub fn new(http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            http_status,
            message: message.into(),
        }
    }
}

/// Uniform provider call contract
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Send one prompt to the named provider and return its text
    /// response, or a typed error for the classifier.
    async fn call(
        &self,
        provider: &str,
        prompt: &str,
        timeout: Duration,
    ) -> std::result::Result<String, GatewayError>;
}

/// HTTP gateway over reqwest; one client, per-provider endpoints
pub struct HttpProviderGateway {
    http_client: reqwest::Client,
    providers: HashMap<String, ProviderConfig>,
}

impl HttpProviderGateway {
    pub fn new(providers: HashMap<String, ProviderConfig>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            providers,
        })
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderGateway {
    async fn call(
        &self,
        provider: &str,
        prompt: &str,
        timeout: Duration,
    ) -> std::result::Result<String, GatewayError> {
        let endpoint = self.providers.get(provider).ok_or_else(|| {
            GatewayError::new(None, format!("provider not configured: {}", provider))
        })?;

        let body = json!({
            "model": endpoint.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        tracing::debug!(provider, url = %endpoint.base_url, "Dispatching provider call");

        let mut request = self
            .http_client
            .post(&endpoint.base_url)
            .timeout(timeout)
            .json(&body);
        if let Some(key) = &endpoint.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::new(None, "request timed out")
            } else {
                GatewayError::new(None, format!("network error: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let mut error_text = response.text().await.unwrap_or_default();
            error_text.truncate(ERROR_BODY_LIMIT);
            return Err(GatewayError::new(Some(status.as_u16()), error_text));
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::new(None, format!("response parse error: {}", e)))?;

        extract_text(&value)
            .ok_or_else(|| GatewayError::new(None, "unrecognized response shape"))
    }
}

/// Pull the generated text out of the common response shapes:
/// OpenAI-style chat choices, completion-style `text`, or a bare
/// `output`/`content` field.
fn extract_text(value: &Value) -> Option<String> {
    if let Some(content) = value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
    {
        return Some(content.to_string());
    }
    if let Some(text) = value.pointer("/choices/0/text").and_then(Value::as_str) {
        return Some(text.to_string());
    }
    for key in ["output_text", "output", "text", "content"] {
        if let Some(text) = value.get(key).and_then(Value::as_str) {
            return Some(text.to_string());
        }
    }
    None
}
