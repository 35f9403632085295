use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::media::generate_file_name;

/// Stable identifier of an episode
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(String);

impl EpisodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EpisodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Persisted state of an episode as the downloader sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub id: EpisodeId,
    pub title: String,
    /// Source URL of the media file
    pub url: String,
    /// File name inside the download directory
    pub file_name: String,
    #[serde(default)]
    pub downloaded: bool,
    /// Bytes of a partial transfer that can be resumed
    #[serde(default)]
    pub offset: u64,
    /// Size of the media file in bytes (0 when unknown)
    #[serde(default)]
    pub filesize: u64,
    pub last_update: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub is_video: bool,
}

impl EpisodeRecord {
    /// Create a fresh, not yet downloaded record with a generated file name
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        let title = title.into();
        let url = url.into();
        let file_name = generate_file_name(&title, None, &url, None);

        Self {
            id: EpisodeId::new(id),
            title,
            url,
            file_name,
            downloaded: false,
            offset: 0,
            filesize: 0,
            last_update: Utc::now(),
            published: None,
            mime_type: None,
            is_video: false,
        }
    }

    /// The source URL, if it is a valid http(s) URL
    pub fn download_url(&self) -> Option<Url> {
        Url::parse(&self.url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some())
    }

    /// File name reduced to its last component so it cannot escape a directory
    pub fn stored_file_name(&self) -> String {
        Path::new(&self.file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .map(String::from)
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Where the finished file lives
    pub fn local_path(&self, download_dir: &Path) -> PathBuf {
        download_dir.join(self.stored_file_name())
    }

    /// Name of the resumable partial file in the scratch directory
    pub fn partial_file_name(&self) -> String {
        format!("{}.partial", self.stored_file_name())
    }

    /// Whether an interrupted transfer left bytes that can be resumed
    pub fn has_partial(&self) -> bool {
        !self.downloaded && self.offset > 0
    }
}
