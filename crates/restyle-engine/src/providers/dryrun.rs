use std::path::{Path, PathBuf};

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use restyle_contracts::assets::GenerationAttempt;
use sha2::{Digest, Sha256};

use super::{ImageProvider, STYLE_TRANSFER_PROMPT};
use crate::error::AttemptError;
use crate::util::unique_stamp;

const DRYRUN_SIZE: u32 = 64;

/// Offline provider: renders a flat colour derived from the prompt and both
/// inputs and returns its `file://` URL.
pub struct DryrunProvider {
    scratch_dir: PathBuf,
}

impl DryrunProvider {
    pub fn new(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }
}

#[async_trait]
impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn predict(&self, attempt: &GenerationAttempt) -> Result<String, AttemptError> {
        let digest = input_digest(&attempt.subject_url, &attempt.style_url);
        let path = self.scratch_dir.join(format!(
            "dryrun-{}-{}.png",
            hex::encode(&digest[..4]),
            unique_stamp()
        ));
        let target = path.clone();
        tokio::task::spawn_blocking(move || {
            write_dryrun_image(&target, (digest[0], digest[1], digest[2]))
        })
        .await
        .map_err(|err| AttemptError::Transport(format!("dryrun render task failed: {err}")))?
        .map_err(|err| AttemptError::Transport(format!("dryrun render failed: {err}")))?;
        Ok(format!("file://{}", path.to_string_lossy()))
    }

    /// Removes a render once it has been copied out. Paths outside the
    /// scratch directory are left alone.
    async fn discard_output(&self, output_url: &str) {
        let Some(path) = output_url.strip_prefix("file://").map(Path::new) else {
            return;
        };
        if path.parent() == Some(self.scratch_dir.as_path()) {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

fn input_digest(subject_url: &str, style_url: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(STYLE_TRANSFER_PROMPT.as_bytes());
    hasher.update(subject_url.as_bytes());
    hasher.update([0u8]);
    hasher.update(style_url.as_bytes());
    hasher.finalize().to_vec()
}

fn write_dryrun_image(path: &Path, (r, g, b): (u8, u8, u8)) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut image = RgbImage::new(DRYRUN_SIZE, DRYRUN_SIZE);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    image.save(path)?;
    Ok(())
}
