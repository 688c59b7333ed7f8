use std::fmt;
use std::path::PathBuf;

use restyle_contracts::state::PipelineStage;
use thiserror::Error;

/// Why a single resolution tier did not produce a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierMiss {
    pub style_id: String,
    pub tier: &'static str,
    pub reason: String,
}

impl fmt::Display for TierMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]: {}", self.tier, self.style_id, self.reason)
    }
}

#[derive(Debug, Error)]
#[error("no local asset for style '{style_id}' ({})", join_misses(.misses))]
pub struct AssetResolutionError {
    pub style_id: String,
    pub misses: Vec<TierMiss>,
}

fn join_misses(misses: &[TierMiss]) -> String {
    if misses.is_empty() {
        return "no tiers attempted".to_string();
    }
    misses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("failed reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("upload request failed: {0}")]
    Transport(String),
    #[error("upload rejected ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("unexpected upload response: {0}")]
    Shape(String),
}

/// One failed call to the synthesis service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AttemptError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response carried no output")]
    MissingOutput,
    #[error("invalid response payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Error)]
#[error("generation failed after {attempts} attempts: {last}")]
pub struct GenerationError {
    pub attempts: u32,
    pub last: AttemptError,
}

#[derive(Debug, Error)]
#[error("download of {url} failed{}: {message}", status_suffix(.status))]
pub struct DownloadError {
    pub url: String,
    pub status: Option<u16>,
    pub message: String,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|code| format!(" ({code})")).unwrap_or_default()
}

impl DownloadError {
    pub fn new(url: &str, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            status,
            message: message.into(),
        }
    }
}

/// Component error carried untouched by [`PipelineError::Stage`].
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Resolve(#[from] AssetResolutionError),
    #[error(transparent)]
    Upload(#[from] UploadError),
    #[error(transparent)]
    Generate(#[from] GenerationError),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("a generation is already in flight")]
    Busy,
    #[error("{stage} failed: {source}")]
    Stage {
        stage: PipelineStage,
        #[source]
        source: StageError,
    },
}

impl PipelineError {
    pub fn at(stage: PipelineStage, source: impl Into<StageError>) -> Self {
        PipelineError::Stage {
            stage,
            source: source.into(),
        }
    }

    /// Stable taxonomy name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Busy => "busy",
            PipelineError::Stage { source, .. } => match source {
                StageError::Resolve(_) => "asset_resolution",
                StageError::Upload(_) => "upload",
                StageError::Generate(_) => "generation",
                StageError::Download(_) => "download",
            },
        }
    }

    pub fn stage(&self) -> Option<PipelineStage> {
        match self {
            PipelineError::Busy => None,
            PipelineError::Stage { stage, .. } => Some(*stage),
        }
    }

    pub fn generation(&self) -> Option<&GenerationError> {
        match self {
            PipelineError::Stage {
                source: StageError::Generate(err),
                ..
            } => Some(err),
            _ => None,
        }
    }
}
