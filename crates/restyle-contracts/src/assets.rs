use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const FILE_SCHEME: &str = "file://";

/// A file on local disk, remembered together with the exact string the caller used for it.
///
/// The caller's string is kept so that pass-through results (the identity style)
/// hand back precisely what was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAsset {
    uri: String,
    path: PathBuf,
}

impl LocalAsset {
    /// Accepts either a `file://` URI or a plain filesystem path.
    pub fn parse(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let path = PathBuf::from(uri.strip_prefix(FILE_SCHEME).unwrap_or(&uri));
        Self { uri, path }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            uri: path.to_string_lossy().to_string(),
            path,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_uri(&self) -> String {
        format!("{FILE_SCHEME}{}", self.path.to_string_lossy())
    }

    /// Lowercased extension without the dot.
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase())
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|value| value.to_str())
    }
}

impl fmt::Display for LocalAsset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// Publicly fetchable location of an uploaded [`LocalAsset`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAsset {
    pub url: String,
}

impl RemoteAsset {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// One call to the synthesis service. Subject first, style second.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationAttempt {
    pub subject_url: String,
    pub style_url: String,
    pub attempt_number: u32,
    pub max_attempts: u32,
}

impl GenerationAttempt {
    pub fn is_last(&self) -> bool {
        self.attempt_number >= self.max_attempts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub remote_output_url: String,
    pub local_result_path: PathBuf,
}

impl GenerationResult {
    pub fn local_asset(&self) -> LocalAsset {
        LocalAsset::from_path(&self.local_result_path)
    }
}
