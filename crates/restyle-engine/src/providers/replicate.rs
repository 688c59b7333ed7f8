use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::Client as HttpClient;
use restyle_contracts::assets::GenerationAttempt;
use serde_json::{json, Value};

use super::{decode_prediction_output, ImageProvider, STYLE_TRANSFER_PROMPT};
use crate::config::ReplicateConfig;
use crate::error::AttemptError;
use crate::util::truncate_text;

/// Synchronous (`Prefer: wait`) prediction against a hosted model.
pub struct ReplicateProvider {
    endpoint: String,
    api_token: String,
    http: HttpClient,
}

impl ReplicateProvider {
    pub fn new(config: &ReplicateConfig) -> Result<Self> {
        Self::with_client(config, HttpClient::new())
    }

    pub fn with_client(config: &ReplicateConfig, http: HttpClient) -> Result<Self> {
        let Some(api_token) = config
            .api_token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        else {
            bail!("REPLICATE_API_TOKEN not set");
        };
        Ok(Self {
            endpoint: config.predictions_endpoint(),
            api_token: api_token.to_string(),
            http,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Subject first, style second; the model reads them in that order.
    pub fn request_payload(attempt: &GenerationAttempt) -> Value {
        json!({
            "input": {
                "prompt": STYLE_TRANSFER_PROMPT,
                "image_input": [attempt.subject_url, attempt.style_url],
            }
        })
    }
}

#[async_trait]
impl ImageProvider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    async fn predict(&self, attempt: &GenerationAttempt) -> Result<String, AttemptError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_token)
            .header("Prefer", "wait")
            .json(&Self::request_payload(attempt))
            .send()
            .await
            .map_err(|err| AttemptError::Transport(format!("{} ({err})", self.endpoint)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| AttemptError::Transport(format!("response body read failed: {err}")))?;
        if !status.is_success() {
            return Err(AttemptError::Status {
                status: status.as_u16(),
                body: truncate_text(&body, 512),
            });
        }
        let payload: Value = serde_json::from_str(&body)
            .map_err(|err| AttemptError::InvalidPayload(format!("not JSON: {err}")))?;
        decode_prediction_output(&payload)
    }
}
