use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use restyle_contracts::assets::GenerationAttempt;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::error::AttemptError;

mod dryrun;
mod replicate;

pub use dryrun::DryrunProvider;
pub use replicate::ReplicateProvider;

/// Instruction sent with every synthesis call. The first image anchors
/// identity, the second donates appearance.
pub const STYLE_TRANSFER_PROMPT: &str = "Use the FIRST image as the subject identity anchor. \
Preserve the exact face, age, skin tone, hair, and body proportions from the FIRST image.\
Apply ONLY the costume, materials, colors, lighting, background mood, and overall style from the SECOND image.\
Make the scene natural and photorealistic. Keep the same person from the FIRST image, no new characters.\
Do not change facial structure or identity. No cartoon look, no text, no logos, no distortions";

/// A single synthesis call. Retrying is the caller's business.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn predict(&self, attempt: &GenerationAttempt) -> Result<String, AttemptError>;

    /// Called once the output has been materialized (or failed to be).
    async fn discard_output(&self, _output_url: &str) {}
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Arc<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Arc::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ImageProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// `output` of a prediction: one URL or an ordered list of URLs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PredictionOutput {
    Single(String),
    Many(Vec<String>),
}

impl PredictionOutput {
    pub fn first_url(&self) -> Option<&str> {
        let url = match self {
            PredictionOutput::Single(url) => url.as_str(),
            PredictionOutput::Many(urls) => urls.first()?.as_str(),
        };
        let url = url.trim();
        (!url.is_empty()).then_some(url)
    }
}

/// Decodes a prediction body. A missing or null `output` and an empty list are
/// [`AttemptError::MissingOutput`]; any other non-conforming shape, or a URL
/// that is not http(s), is a parse error.
pub fn decode_prediction_output(payload: &Value) -> Result<String, AttemptError> {
    let Some(raw) = payload.get("output").filter(|value| !value.is_null()) else {
        return Err(AttemptError::MissingOutput);
    };
    let output = PredictionOutput::deserialize(raw)
        .map_err(|err| AttemptError::InvalidPayload(format!("output: {err}")))?;
    let url = output.first_url().ok_or(AttemptError::MissingOutput)?;
    match Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(url.to_string()),
        _ => Err(AttemptError::InvalidPayload(format!(
            "output is not an http(s) url: {url}"
        ))),
    }
}
