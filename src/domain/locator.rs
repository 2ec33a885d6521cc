//! Content locators and platform classification.
//!
//! A locator is anything a user (or an email) can hand us that identifies
//! audio/video content: a local path, a direct URL, or a sharing/hosting
//! link that needs rewriting before it can be fetched.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// File-sharing platforms with known direct-download rewrites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingPlatform {
    Dropbox,
    GoogleDrive,
    OneDrive,
    Box,
    WeTransfer,
}

impl fmt::Display for SharingPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dropbox => "dropbox",
            Self::GoogleDrive => "google_drive",
            Self::OneDrive => "onedrive",
            Self::Box => "box",
            Self::WeTransfer => "wetransfer",
        };
        f.write_str(name)
    }
}

/// Video/meeting-recording hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoPlatform {
    YouTube,
    Vimeo,
    Zoom,
    Loom,
}

impl fmt::Display for VideoPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::YouTube => "youtube",
            Self::Vimeo => "vimeo",
            Self::Zoom => "zoom",
            Self::Loom => "loom",
        };
        f.write_str(name)
    }
}

/// Coarse platform kind, used by the ingestor's candidate filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformKind {
    SharingService,
    VideoHosting,
    GenericHttp,
    LocalPath,
}

/// A classified content locator.
///
/// Immutable once created; `LinkResolver::classify` is the only constructor
/// for the URL variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ContentLocator {
    /// File already on local disk
    LocalPath { path: PathBuf },

    /// Plain HTTP(S) URL, unknown host
    DirectUrl { url: String },

    /// Link on a file-sharing service that needs a download rewrite
    SharingService {
        url: String,
        platform: SharingPlatform,
    },

    /// Link on a video/recording host
    VideoHosting {
        url: String,
        platform: VideoPlatform,
    },
}

impl ContentLocator {
    /// Coarse kind tag
    pub fn kind(&self) -> PlatformKind {
        match self {
            Self::LocalPath { .. } => PlatformKind::LocalPath,
            Self::DirectUrl { .. } => PlatformKind::GenericHttp,
            Self::SharingService { .. } => PlatformKind::SharingService,
            Self::VideoHosting { .. } => PlatformKind::VideoHosting,
        }
    }

    /// URL of the locator, if it has one
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::LocalPath { .. } => None,
            Self::DirectUrl { url }
            | Self::SharingService { url, .. }
            | Self::VideoHosting { url, .. } => Some(url),
        }
    }

    /// Short human-readable source name for reports and email subjects.
    ///
    /// For URLs this is the last path segment without query string; for
    /// local paths the file name.
    pub fn source_name(&self) -> String {
        match self {
            Self::LocalPath { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string()),
            Self::DirectUrl { url }
            | Self::SharingService { url, .. }
            | Self::VideoHosting { url, .. } => {
                let trimmed = url.split(['?', '#']).next().unwrap_or(url);
                trimmed
                    .rsplit('/')
                    .find(|seg| !seg.is_empty())
                    .unwrap_or(trimmed)
                    .to_string()
            }
        }
    }
}

impl fmt::Display for ContentLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalPath { path } => write!(f, "{}", path.display()),
            Self::DirectUrl { url } => f.write_str(url),
            Self::SharingService { url, .. } | Self::VideoHosting { url, .. } => {
                f.write_str(url)
            }
        }
    }
}
