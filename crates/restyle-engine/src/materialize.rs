use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client as HttpClient, StatusCode};
use restyle_contracts::assets::GenerationResult;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::DownloadError;
use crate::util::{output_extension_from_mime, unique_stamp};

const MAX_NAME_ATTEMPTS: usize = 16;

/// Writes a remote result into the documents directory under a name no
/// earlier result has used.
pub struct ResultMaterializer {
    documents_dir: PathBuf,
    http: HttpClient,
    allow_local_sources: bool,
}

impl ResultMaterializer {
    pub fn new(documents_dir: impl Into<PathBuf>) -> Self {
        Self::with_client(documents_dir, HttpClient::new())
    }

    pub fn with_client(documents_dir: impl Into<PathBuf>, http: HttpClient) -> Self {
        Self {
            documents_dir: documents_dir.into(),
            http,
            allow_local_sources: false,
        }
    }

    /// Accept `file://` outputs. Only the offline provider produces them.
    pub fn allow_local_sources(mut self, allow: bool) -> Self {
        self.allow_local_sources = allow;
        self
    }

    pub fn documents_dir(&self) -> &Path {
        &self.documents_dir
    }

    pub async fn materialize(&self, url: &str) -> Result<GenerationResult, DownloadError> {
        let local_source = url.strip_prefix("file://");
        if local_source.is_some() && !self.allow_local_sources {
            return Err(DownloadError::new(url, None, "local sources are not accepted"));
        }
        tokio::fs::create_dir_all(&self.documents_dir)
            .await
            .map_err(|err| DownloadError::new(url, None, format!("documents dir: {err}")))?;

        let local_result_path = match local_source {
            Some(source) => self.copy_local(url, Path::new(source)).await?,
            None => self.fetch(url).await?,
        };
        Ok(GenerationResult {
            remote_output_url: url.to_string(),
            local_result_path,
        })
    }

    async fn copy_local(&self, url: &str, source: &Path) -> Result<PathBuf, DownloadError> {
        let ext = match source
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase())
        {
            Some(ext) if matches!(ext.as_str(), "png" | "webp" | "jpg") => ext,
            _ => "jpg".to_string(),
        };
        let mut input = File::open(source)
            .await
            .map_err(|err| DownloadError::new(url, None, err.to_string()))?;
        let (dest, mut file) = create_unique_result(&self.documents_dir, &ext, unique_stamp)
            .await
            .map_err(|err| DownloadError::new(url, None, err.to_string()))?;

        let copied = async {
            tokio::io::copy(&mut input, &mut file).await?;
            file.flush().await
        }
        .await;
        if let Err(err) = copied {
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(DownloadError::new(url, None, err.to_string()));
        }
        Ok(dest)
    }

    async fn fetch(&self, url: &str) -> Result<PathBuf, DownloadError> {
        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| DownloadError::new(url, None, err.to_string()))?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(DownloadError::new(
                url,
                Some(status.as_u16()),
                status.canonical_reason().unwrap_or("unexpected status"),
            ));
        }

        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let ext = output_extension_from_mime(mime.as_deref());
        let (dest, mut file) = create_unique_result(&self.documents_dir, ext, unique_stamp)
            .await
            .map_err(|err| DownloadError::new(url, None, err.to_string()))?;

        let written = async {
            while let Some(chunk) = response.chunk().await.map_err(|err| err.to_string())? {
                file.write_all(&chunk).await.map_err(|err| err.to_string())?;
            }
            file.flush().await.map_err(|err| err.to_string())
        }
        .await;

        if let Err(message) = written {
            drop(file);
            let _ = tokio::fs::remove_file(&dest).await;
            return Err(DownloadError::new(url, None, message));
        }
        Ok(dest)
    }
}

/// Creates `generated_<stamp>.<ext>` exclusively, moving to the next stamp
/// when a file of that name already exists.
async fn create_unique_result(
    dir: &Path,
    ext: &str,
    mut next_stamp: impl FnMut() -> u64,
) -> std::io::Result<(PathBuf, File)> {
    let mut taken = None;
    for _ in 0..MAX_NAME_ATTEMPTS {
        let path = dir.join(format!("generated_{}.{ext}", next_stamp()));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => taken = Some(err),
            Err(err) => return Err(err),
        }
    }
    Err(taken.unwrap_or_else(|| std::io::Error::new(ErrorKind::AlreadyExists, "no free result name")))
}
