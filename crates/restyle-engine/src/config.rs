use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::non_empty_env;

pub const DEFAULT_UPLOAD_API_BASE: &str = "https://tmpfiles.org";
pub const DEFAULT_REPLICATE_API_BASE: &str = "https://api.replicate.com/v1";
pub const DEFAULT_REPLICATE_MODEL: &str = "google/nano-banana";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Durable, app-private directory for results and materialized style copies.
    pub documents_dir: PathBuf,
    /// Root that catalog `asset_ref` paths are relative to.
    pub bundle_dir: PathBuf,
    /// Read-only installation root, probed at `assets/styles/<id>.<ext>`.
    pub install_dir: PathBuf,
    pub style_extension: String,
    /// Style used when the requested one cannot be resolved or uploaded.
    /// `None` means the first non-identity catalog entry.
    pub fallback_style: Option<String>,
    pub provider: String,
    pub upload: UploadConfig,
    pub replicate: ReplicateConfig,
    pub retry: RetryConfig,
    pub write_receipts: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            documents_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("restyle"),
            bundle_dir: PathBuf::from("assets"),
            install_dir: PathBuf::from("."),
            style_extension: "png".to_string(),
            fallback_style: None,
            provider: "replicate".to_string(),
            upload: UploadConfig::default(),
            replicate: ReplicateConfig::default(),
            retry: RetryConfig::default(),
            write_receipts: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub api_base: String,
    pub upload_path: String,
    /// Path segment that turns a share URL into a direct-download URL.
    pub direct_segment: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_UPLOAD_API_BASE.to_string(),
            upload_path: "/api/v1/upload".to_string(),
            direct_segment: "dl".to_string(),
        }
    }
}

impl UploadConfig {
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            self.upload_path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicateConfig {
    pub api_base: String,
    pub model: String,
    /// Only ever populated from the environment.
    #[serde(skip)]
    pub api_token: Option<String>,
}

impl Default for ReplicateConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_REPLICATE_API_BASE.to_string(),
            model: DEFAULT_REPLICATE_MODEL.to_string(),
            api_token: None,
        }
    }
}

impl ReplicateConfig {
    pub fn predictions_endpoint(&self) -> String {
        format!(
            "{}/models/{}/predictions",
            self.api_base.trim_end_matches('/'),
            self.model.trim_matches('/')
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 2000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl PipelineConfig {
    /// Reads the optional JSON file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed reading config {}", path.display()))?;
                serde_json::from_str::<Self>(&raw)
                    .with_context(|| format!("invalid config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(non_empty_env);
        Ok(config)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("RESTYLE_DOCUMENTS_DIR") {
            self.documents_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("RESTYLE_BUNDLE_DIR") {
            self.bundle_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("RESTYLE_INSTALL_DIR") {
            self.install_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("RESTYLE_PROVIDER") {
            self.provider = value.to_ascii_lowercase();
        }
        if let Some(value) = lookup("TMPFILES_API_BASE") {
            self.upload.api_base = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = lookup("REPLICATE_API_BASE") {
            self.replicate.api_base = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = lookup("REPLICATE_MODEL") {
            self.replicate.model = value;
        }
        if let Some(token) = lookup("REPLICATE_API_TOKEN").or_else(|| lookup("REPLICATE_API_KEY"))
        {
            self.replicate.api_token = Some(token);
        }
    }

    /// Where tier three looks for a style asset.
    pub fn installed_style_path(&self, style_id: &str) -> PathBuf {
        self.install_dir
            .join("assets")
            .join("styles")
            .join(format!("{style_id}.{}", self.style_extension))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_service_contracts() {
        let config = PipelineConfig::default();
        assert_eq!(config.upload.endpoint(), "https://tmpfiles.org/api/v1/upload");
        assert_eq!(
            config.replicate.predictions_endpoint(),
            "https://api.replicate.com/v1/models/google/nano-banana/predictions"
        );
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay(), Duration::from_secs(2));
        assert_eq!(config.provider, "replicate");
    }

    #[test]
    fn partial_json_keeps_defaults_and_never_reads_token() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("restyle.json");
        std::fs::write(
            &path,
            r#"{"provider": "dryrun", "retry": {"delay_ms": 10}, "replicate": {"api_token": "leak"}}"#,
        )?;
        let mut config: PipelineConfig = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(config.provider, "dryrun");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay_ms, 10);
        assert_eq!(config.replicate.api_token, None);

        config.apply_overrides(|_| None);
        assert_eq!(config.replicate.api_token, None);
        Ok(())
    }

    #[test]
    fn overrides_apply_and_key_is_a_token_fallback() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("REPLICATE_API_KEY", "key-2"),
            ("REPLICATE_API_BASE", "http://127.0.0.1:9/v1/"),
            ("RESTYLE_INSTALL_DIR", "/opt/restyle"),
        ]);
        let mut config = PipelineConfig::default();
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));

        assert_eq!(config.replicate.api_token.as_deref(), Some("key-2"));
        assert_eq!(config.replicate.api_base, "http://127.0.0.1:9/v1");
        assert_eq!(
            config.installed_style_path("pirate"),
            PathBuf::from("/opt/restyle/assets/styles/pirate.png")
        );
    }
}
