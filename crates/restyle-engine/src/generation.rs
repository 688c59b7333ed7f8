use std::sync::Arc;
use std::time::Duration;

use restyle_contracts::assets::GenerationAttempt;

use crate::config::RetryConfig;
use crate::error::{AttemptError, GenerationError};
use crate::providers::ImageProvider;

/// Fixed-delay retry: no growth, no jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(RetryConfig::default())
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: config.delay(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub output_url: String,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum AttemptEvent<'a> {
    Started(&'a GenerationAttempt),
    Failed(&'a GenerationAttempt, &'a AttemptError),
}

pub struct GenerationClient {
    provider: Arc<dyn ImageProvider>,
    policy: RetryPolicy,
}

impl GenerationClient {
    pub fn new(provider: Arc<dyn ImageProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn discard_output(&self, output_url: &str) {
        self.provider.discard_output(output_url).await;
    }

    pub async fn generate(
        &self,
        subject_url: &str,
        style_url: &str,
    ) -> Result<Generated, GenerationError> {
        self.generate_observed(subject_url, style_url, &|_| {}).await
    }

    /// Runs up to `max_attempts` predictions, sleeping `delay` between failed ones.
    pub async fn generate_observed(
        &self,
        subject_url: &str,
        style_url: &str,
        observe: &(dyn Fn(AttemptEvent<'_>) + Send + Sync),
    ) -> Result<Generated, GenerationError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = AttemptError::MissingOutput;

        for attempt_number in 1..=max_attempts {
            let attempt = GenerationAttempt {
                subject_url: subject_url.to_string(),
                style_url: style_url.to_string(),
                attempt_number,
                max_attempts,
            };
            observe(AttemptEvent::Started(&attempt));

            match self.provider.predict(&attempt).await {
                Ok(output_url) => {
                    return Ok(Generated {
                        output_url,
                        attempts: attempt_number,
                    })
                }
                Err(err) => {
                    observe(AttemptEvent::Failed(&attempt, &err));
                    last = err;
                    if !attempt.is_last() {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
            }
        }

        Err(GenerationError {
            attempts: max_attempts,
            last,
        })
    }
}
