//! Content download with retry, size ceiling and audio extraction.
//!
//! Assets stream to ephemeral storage chunk by chunk; the progress callback
//! fires on every buffer write. Temp files delete themselves on drop, so
//! partial downloads never outlive a failure.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::adapters::ffmpeg;
use crate::core::resolver::{ResolvedUrl, BROWSER_USER_AGENT};
use crate::core::retry::RetryPolicy;

/// Rough media kind of a downloaded asset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("transient download failure: {0}")]
    Transient(String),

    #[error("download failed: {0}")]
    Fatal(String),

    #[error("download exceeds size ceiling: {actual} bytes > {ceiling} bytes")]
    SizeExceeded { actual: u64, ceiling: u64 },

    #[error("unsupported content type: {0}")]
    UnsupportedType(String),
}

impl DownloadError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Storage backing a downloaded asset
#[derive(Debug)]
enum AssetStorage {
    /// Temp file, deleted when the asset drops
    Ephemeral(TempPath),

    /// Caller's own file; never deleted by us
    Borrowed(PathBuf),
}

/// A fetched media asset.
///
/// Owned by exactly one job; the ephemeral backing file is removed when the
/// asset drops, which happens when the job reaches a terminal state.
#[derive(Debug)]
pub struct DownloadedAsset {
    storage: AssetStorage,
    pub kind: MediaKind,
    pub byte_size: u64,
}

impl DownloadedAsset {
    /// Wrap a caller-owned file; never deleted on drop
    pub fn borrowed(path: PathBuf, kind: MediaKind, byte_size: u64) -> Self {
        Self {
            storage: AssetStorage::Borrowed(path),
            kind,
            byte_size,
        }
    }

    /// Take ownership of a temp file; it is deleted when the asset drops
    pub fn ephemeral(path: TempPath, kind: MediaKind, byte_size: u64) -> Self {
        Self {
            storage: AssetStorage::Ephemeral(path),
            kind,
            byte_size,
        }
    }

    pub fn path(&self) -> &Path {
        match &self.storage {
            AssetStorage::Ephemeral(path) => path,
            AssetStorage::Borrowed(path) => path,
        }
    }
}

/// Progress callback: (bytes so far, total if known)
pub type ProgressFn = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Extensions accepted as audio
pub(crate) const AUDIO_EXTENSIONS: &[&str] =
    &["mp3", "wav", "m4a", "aac", "ogg", "flac", "wma", "opus"];

/// Extensions accepted as video (audio track gets extracted)
pub(crate) const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "webm", "mkv", "m4v", "flv"];

/// Ceiling on establishing a connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// A download that produces no bytes for this long counts as stalled and
/// fails the attempt as transient, so the retry policy applies
const STALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Downloads or copies resolved assets into job-scoped ephemeral storage
pub struct ContentFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
    stall_timeout: Duration,
}

impl Default for ContentFetcher {
    fn default() -> Self {
        Self::new(RetryPolicy::for_downloads())
    }
}

impl ContentFetcher {
    pub fn new(retry: RetryPolicy) -> Self {
        Self::with_stall_timeout(retry, STALL_TIMEOUT)
    }

    pub fn with_stall_timeout(retry: RetryPolicy, stall_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .user_agent(BROWSER_USER_AGENT)
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            retry,
            stall_timeout,
        }
    }

    /// Fetch a resolved URL into ephemeral storage.
    ///
    /// Transient failures retry under the policy; fatal ones surface
    /// immediately. If the asset is a video container, its audio track is
    /// extracted and the video file discarded before returning.
    #[instrument(skip(self, progress), fields(url = %url.0))]
    pub async fn fetch_url(
        &self,
        url: &ResolvedUrl,
        size_ceiling: u64,
        progress: &ProgressFn,
    ) -> Result<DownloadedAsset, DownloadError> {
        let mut attempt = 0u32;

        let asset = loop {
            attempt += 1;

            match self.download_once(&url.0, size_ceiling, progress).await {
                Ok(asset) => break asset,
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    warn!(
                        attempt,
                        error = %e,
                        delay_ms = self.retry.delay_for_attempt(attempt).as_millis() as u64,
                        "Download failed, retrying"
                    );
                    self.retry.wait(attempt).await;
                }
                Err(e) => return Err(e),
            }
        };

        self.normalize(asset).await
    }

    /// Use a local file directly, extracting audio if it is a video.
    ///
    /// The caller's file is never deleted.
    pub async fn fetch_local(
        &self,
        path: &Path,
        size_ceiling: u64,
    ) -> Result<DownloadedAsset, DownloadError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| DownloadError::Fatal(format!("cannot read {}: {}", path.display(), e)))?;

        if !metadata.is_file() {
            return Err(DownloadError::Fatal(format!(
                "{} is not a file",
                path.display()
            )));
        }

        if metadata.len() > size_ceiling {
            return Err(DownloadError::SizeExceeded {
                actual: metadata.len(),
                ceiling: size_ceiling,
            });
        }

        let kind = kind_from_extension(path).ok_or_else(|| {
            DownloadError::UnsupportedType(format!("{}", path.display()))
        })?;

        self.normalize(DownloadedAsset::borrowed(
            path.to_path_buf(),
            kind,
            metadata.len(),
        ))
        .await
    }

    /// One download attempt, streaming to a temp file
    async fn download_once(
        &self,
        url: &str,
        size_ceiling: u64,
        progress: &ProgressFn,
    ) -> Result<DownloadedAsset, DownloadError> {
        let mut response = tokio::time::timeout(self.stall_timeout, self.client.get(url).send())
            .await
            .map_err(|_| {
                DownloadError::Transient(format!(
                    "no response after {}s",
                    self.stall_timeout.as_secs_f64()
                ))
            })?
            .map_err(classify_reqwest_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(DownloadError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(DownloadError::Fatal(format!("HTTP {}", status)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase());

        let kind = classify_media(content_type.as_deref(), url)?;

        let total = response.content_length();
        if let Some(total) = total {
            if total > size_ceiling {
                return Err(DownloadError::SizeExceeded {
                    actual: total,
                    ceiling: size_ceiling,
                });
            }
        }

        let mut file = NamedTempFile::with_suffix(suffix_for(url, kind))
            .map_err(|e| DownloadError::Fatal(format!("temp file creation failed: {}", e)))?;

        let mut written: u64 = 0;
        loop {
            let chunk = match tokio::time::timeout(self.stall_timeout, response.chunk()).await {
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => break,
                // Mid-stream failures and stalls are worth another attempt
                Ok(Err(e)) => return Err(DownloadError::Transient(e.to_string())),
                Err(_) => {
                    return Err(DownloadError::Transient(format!(
                        "download stalled for {}s",
                        self.stall_timeout.as_secs_f64()
                    )))
                }
            };

            written += chunk.len() as u64;
            if written > size_ceiling {
                return Err(DownloadError::SizeExceeded {
                    actual: written,
                    ceiling: size_ceiling,
                });
            }

            file.write_all(&chunk)
                .map_err(|e| DownloadError::Fatal(format!("write failed: {}", e)))?;

            progress(written, total);
        }

        file.flush()
            .map_err(|e| DownloadError::Fatal(format!("flush failed: {}", e)))?;

        debug!(bytes = written, "Download complete");

        Ok(DownloadedAsset {
            storage: AssetStorage::Ephemeral(file.into_temp_path()),
            kind,
            byte_size: written,
        })
    }

    /// Videos lose their container here; the pipeline downstream only ever
    /// sees audio
    async fn normalize(&self, asset: DownloadedAsset) -> Result<DownloadedAsset, DownloadError> {
        if asset.kind == MediaKind::Audio {
            return Ok(asset);
        }

        info!(path = %asset.path().display(), "Extracting audio track from video");

        let extracted = ffmpeg::extract_audio(asset.path())
            .await
            .map_err(|e| DownloadError::Fatal(format!("audio extraction failed: {}", e)))?;

        let byte_size = extracted
            .as_file()
            .metadata()
            .map(|m| m.len())
            .unwrap_or(0);

        // The video asset drops here, deleting its temp file
        Ok(DownloadedAsset {
            storage: AssetStorage::Ephemeral(extracted.into_temp_path()),
            kind: MediaKind::Audio,
            byte_size,
        })
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> DownloadError {
    if err.is_timeout() || err.is_connect() {
        DownloadError::Transient(err.to_string())
    } else {
        DownloadError::Fatal(err.to_string())
    }
}

/// Decide the media kind from content type, falling back to the URL's
/// extension; anything outside the allow-list is rejected
fn classify_media(content_type: Option<&str>, url: &str) -> Result<MediaKind, DownloadError> {
    if let Some(ct) = content_type {
        if ct.starts_with("audio/") {
            return Ok(MediaKind::Audio);
        }
        if ct.starts_with("video/") {
            return Ok(MediaKind::Video);
        }
        // Generic types defer to the extension
        if !matches!(ct, "application/octet-stream" | "binary/octet-stream" | "") {
            if !ct.starts_with("application/") {
                return Err(DownloadError::UnsupportedType(ct.to_string()));
            }
        }
    }

    kind_from_extension(Path::new(url.split(['?', '#']).next().unwrap_or(url)))
        .ok_or_else(|| DownloadError::UnsupportedType(content_type.unwrap_or("unknown").to_string()))
}

fn kind_from_extension(path: &Path) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Audio)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

fn suffix_for(url: &str, kind: MediaKind) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    if let Some(ext) = Path::new(trimmed).extension().and_then(|e| e.to_str()) {
        return format!(".{}", ext.to_ascii_lowercase());
    }
    match kind {
        MediaKind::Audio => ".mp3".to_string(),
        MediaKind::Video => ".mp4".to_string(),
    }
}
