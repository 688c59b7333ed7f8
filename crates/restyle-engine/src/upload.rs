//! Remote upload: pushes a local file to an anonymous host and returns a
//! URL that serves raw bytes.

use async_trait::async_trait;
use reqwest::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::Client as HttpClient;
use restyle_contracts::assets::{LocalAsset, RemoteAsset};
use serde::Deserialize;
use url::Url;

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::util::{truncate_text, upload_mime_for_path};

#[async_trait]
pub trait AssetHost: Send + Sync {
    fn name(&self) -> &str;
    async fn upload(&self, asset: &LocalAsset) -> Result<RemoteAsset, UploadError>;
}

/// Share-URL to direct-URL contract, version 1: the configured segment becomes
/// the first path segment. Already-direct URLs are returned unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectUrlRule {
    segment: String,
}

impl DirectUrlRule {
    pub fn new(segment: impl Into<String>) -> Self {
        Self {
            segment: segment.into().trim_matches('/').to_string(),
        }
    }

    pub fn apply(&self, share_url: &str) -> Result<String, UploadError> {
        let mut url = Url::parse(share_url.trim())
            .map_err(|err| UploadError::Shape(format!("share url '{share_url}': {err}")))?;
        if self.segment.is_empty() {
            return Ok(url.into());
        }
        let path = url.path().to_string();
        let prefix = format!("/{}/", self.segment);
        if !path.starts_with(&prefix) {
            url.set_path(&format!("/{}{}", self.segment, path));
        }
        Ok(url.into())
    }
}

#[derive(Debug, Deserialize)]
struct TmpFilesResponse {
    status: Option<String>,
    data: Option<TmpFilesData>,
}

#[derive(Debug, Deserialize)]
struct TmpFilesData {
    url: Option<String>,
}

/// Multipart upload to a tmpfiles-style host (`POST /api/v1/upload`, field `file`).
pub struct TmpFilesHost {
    endpoint: String,
    rule: DirectUrlRule,
    http: HttpClient,
}

impl TmpFilesHost {
    pub fn new(config: &UploadConfig) -> Self {
        Self::with_client(config, HttpClient::new())
    }

    pub fn with_client(config: &UploadConfig, http: HttpClient) -> Self {
        Self {
            endpoint: config.endpoint(),
            rule: DirectUrlRule::new(config.direct_segment.clone()),
            http,
        }
    }

    fn upload_file_name(asset: &LocalAsset, mime: &str) -> String {
        match (asset.file_name(), mime) {
            (Some(name), "image/png") => name.to_string(),
            (None, "image/png") => "style.png".to_string(),
            _ => "photo.jpg".to_string(),
        }
    }

    fn parse_share_url(body: &str) -> Result<String, UploadError> {
        let parsed: TmpFilesResponse = serde_json::from_str(body).map_err(|err| {
            UploadError::Shape(format!("{err}: {}", truncate_text(body, 256)))
        })?;
        let status = parsed.status.unwrap_or_default();
        if status != "success" {
            return Err(UploadError::Shape(format!(
                "status '{status}': {}",
                truncate_text(body, 256)
            )));
        }
        parsed
            .data
            .and_then(|data| data.url)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| UploadError::Shape("success response without data.url".to_string()))
    }
}

#[async_trait]
impl AssetHost for TmpFilesHost {
    fn name(&self) -> &str {
        "tmpfiles"
    }

    async fn upload(&self, asset: &LocalAsset) -> Result<RemoteAsset, UploadError> {
        let bytes = tokio::fs::read(asset.path())
            .await
            .map_err(|source| UploadError::Read {
                path: asset.path().to_path_buf(),
                source,
            })?;
        let mime = upload_mime_for_path(asset.path());
        let part = MultipartPart::bytes(bytes)
            .file_name(Self::upload_file_name(asset, mime))
            .mime_str(mime)
            .map_err(|err| UploadError::Transport(format!("invalid mime '{mime}': {err}")))?;
        let form = MultipartForm::new().part("file", part);

        let response = self
            .http
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|err| UploadError::Transport(format!("{} ({err})", self.endpoint)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| UploadError::Transport(format!("response body read failed: {err}")))?;
        if !status.is_success() {
            return Err(UploadError::Status {
                status: status.as_u16(),
                body: truncate_text(&body, 512),
            });
        }

        let share_url = Self::parse_share_url(&body)?;
        Ok(RemoteAsset::new(self.rule.apply(&share_url)?))
    }
}

/// Offline host: hands back the file's own `file://` URI.
pub struct DryrunHost;

#[async_trait]
impl AssetHost for DryrunHost {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn upload(&self, asset: &LocalAsset) -> Result<RemoteAsset, UploadError> {
        tokio::fs::metadata(asset.path())
            .await
            .map_err(|source| UploadError::Read {
                path: asset.path().to_path_buf(),
                source,
            })?;
        Ok(RemoteAsset::new(asset.file_uri()))
    }
}
