//! Style asset resolution.
//!
//! A style id is turned into a readable local file by walking an ordered list
//! of tiers; the first tier that produces a file wins. When every tier misses
//! for a non-identity style, the whole walk is repeated once for the fallback
//! style.

use std::fmt;
use std::path::{Path, PathBuf};

use reqwest::Client as HttpClient;
use restyle_contracts::assets::LocalAsset;
use restyle_contracts::styles::StyleCatalog;

use crate::config::PipelineConfig;
use crate::error::{AssetResolutionError, TierMiss};
use crate::util::truncate_text;

/// What the bundled package knows about a style's reference image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetHandle {
    File(PathBuf),
    Url(String),
}

impl AssetHandle {
    fn extension(&self) -> Option<String> {
        let name = match self {
            AssetHandle::File(path) => path.file_name()?.to_str()?.to_string(),
            AssetHandle::Url(url) => url.rsplit('/').next()?.split(['?', '#']).next()?.to_string(),
        };
        let (_, ext) = name.rsplit_once('.')?;
        let ext = ext.to_ascii_lowercase();
        (!ext.is_empty() && ext.chars().all(|ch| ch.is_ascii_alphanumeric())).then_some(ext)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTier {
    /// The bundled handle already is a readable local file.
    Bundled,
    /// The bundled handle was copied into the documents directory.
    Materialized,
    /// The read-only installation directory carried the file.
    Installation,
}

impl ResolutionTier {
    pub const ORDER: [ResolutionTier; 3] = [
        ResolutionTier::Bundled,
        ResolutionTier::Materialized,
        ResolutionTier::Installation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionTier::Bundled => "bundled",
            ResolutionTier::Materialized => "materialized",
            ResolutionTier::Installation => "installation",
        }
    }
}

impl fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub requested: String,
    /// Style whose file was found; differs from `requested` after a fallback.
    pub style_id: String,
    pub asset: LocalAsset,
    pub tier: ResolutionTier,
    pub misses: Vec<TierMiss>,
}

impl Resolution {
    pub fn fell_back(&self) -> bool {
        self.style_id != self.requested
    }
}

pub struct AssetResolver {
    catalog: StyleCatalog,
    config: PipelineConfig,
    http: HttpClient,
}

impl AssetResolver {
    pub fn new(config: &PipelineConfig, catalog: StyleCatalog) -> Self {
        Self::with_client(config, catalog, HttpClient::new())
    }

    pub fn with_client(config: &PipelineConfig, catalog: StyleCatalog, http: HttpClient) -> Self {
        Self {
            catalog,
            config: config.clone(),
            http,
        }
    }

    pub fn catalog(&self) -> &StyleCatalog {
        &self.catalog
    }

    /// Configured fallback, else the first non-identity catalog entry.
    pub fn fallback_style_id(&self) -> Option<&str> {
        self.config
            .fallback_style
            .as_deref()
            .or_else(|| self.catalog.default_fallback().map(|style| style.id.as_str()))
            .filter(|id| !self.catalog.is_identity(id))
    }

    /// Bundled-package lookup by style id.
    pub fn lookup(&self, style_id: &str) -> Option<AssetHandle> {
        let asset_ref = self.catalog.get(style_id)?.asset_ref.as_deref()?.trim();
        if asset_ref.is_empty() {
            return None;
        }
        if asset_ref.starts_with("http://") || asset_ref.starts_with("https://") {
            return Some(AssetHandle::Url(asset_ref.to_string()));
        }
        let local = LocalAsset::parse(asset_ref);
        if local.path().is_absolute() {
            return Some(AssetHandle::File(local.path().to_path_buf()));
        }
        Some(AssetHandle::File(self.config.bundle_dir.join(local.path())))
    }

    /// Full resolution: all tiers for `style_id`, then once more for the fallback style.
    pub async fn resolve(&self, style_id: &str) -> Result<Resolution, AssetResolutionError> {
        if self.catalog.is_identity(style_id) {
            return Err(AssetResolutionError {
                style_id: style_id.to_string(),
                misses: Vec::new(),
            });
        }

        let mut misses = Vec::new();
        if let Some((asset, tier)) = self.walk_tiers(style_id, &mut misses).await {
            return Ok(Resolution {
                requested: style_id.to_string(),
                style_id: style_id.to_string(),
                asset,
                tier,
                misses,
            });
        }

        if let Some(fallback) = self.fallback_style_id().filter(|id| *id != style_id) {
            if let Some((asset, tier)) = self.walk_tiers(fallback, &mut misses).await {
                return Ok(Resolution {
                    requested: style_id.to_string(),
                    style_id: fallback.to_string(),
                    asset,
                    tier,
                    misses,
                });
            }
        }

        Err(AssetResolutionError {
            style_id: style_id.to_string(),
            misses,
        })
    }

    async fn walk_tiers(
        &self,
        style_id: &str,
        misses: &mut Vec<TierMiss>,
    ) -> Option<(LocalAsset, ResolutionTier)> {
        let handle = self.lookup(style_id);
        for tier in ResolutionTier::ORDER {
            match self.try_tier(tier, style_id, handle.as_ref()).await {
                Ok(asset) => return Some((asset, tier)),
                Err(reason) => misses.push(TierMiss {
                    style_id: style_id.to_string(),
                    tier: tier.as_str(),
                    reason,
                }),
            }
        }
        None
    }

    async fn try_tier(
        &self,
        tier: ResolutionTier,
        style_id: &str,
        handle: Option<&AssetHandle>,
    ) -> Result<LocalAsset, String> {
        match tier {
            ResolutionTier::Bundled => match handle {
                Some(AssetHandle::File(path)) => {
                    readable_file(path).await.map(|_| LocalAsset::from_path(path))
                }
                Some(AssetHandle::Url(url)) => Err(format!("handle is not a local file ({url})")),
                None => Err("no bundled asset".to_string()),
            },
            ResolutionTier::Materialized => {
                let handle = handle.ok_or_else(|| "no bundled asset to copy".to_string())?;
                self.materialize(style_id, handle).await
            }
            ResolutionTier::Installation => {
                if !is_plain_style_id(style_id) {
                    return Err(format!("style id '{style_id}' is not a file name"));
                }
                let path = self.config.installed_style_path(style_id);
                readable_file(&path).await.map(|_| LocalAsset::from_path(&path))
            }
        }
    }

    async fn materialize(&self, style_id: &str, handle: &AssetHandle) -> Result<LocalAsset, String> {
        let ext = handle
            .extension()
            .unwrap_or_else(|| self.config.style_extension.clone());
        let documents_dir = &self.config.documents_dir;
        let target = documents_dir.join(format!("{style_id}_style.{ext}"));
        tokio::fs::create_dir_all(documents_dir)
            .await
            .map_err(|err| format!("cannot create {}: {err}", documents_dir.display()))?;

        match handle {
            AssetHandle::File(source) => {
                tokio::fs::copy(source, &target)
                    .await
                    .map_err(|err| format!("copy from {} failed: {err}", source.display()))?;
            }
            AssetHandle::Url(url) => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(|err| format!("fetch {url} failed: {err}"))?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(format!(
                        "fetch {url} returned {}: {}",
                        status.as_u16(),
                        truncate_text(&body, 128)
                    ));
                }
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|err| format!("reading {url} failed: {err}"))?;
                tokio::fs::write(&target, &bytes)
                    .await
                    .map_err(|err| format!("write {} failed: {err}", target.display()))?;
            }
        }
        Ok(LocalAsset::from_path(target))
    }
}

async fn readable_file(path: &Path) -> Result<(), String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|err| format!("{}: {err}", path.display()))?;
    if !metadata.is_file() {
        return Err(format!("{} is not a file", path.display()));
    }
    tokio::fs::File::open(path)
        .await
        .map(|_| ())
        .map_err(|err| format!("{} unreadable: {err}", path.display()))
}

fn is_plain_style_id(style_id: &str) -> bool {
    !style_id.is_empty()
        && style_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}
