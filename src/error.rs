use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while transferring an episode
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("HTTP request failed for {url}: {source}")]
    HttpFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Authentication required for {url} (HTTP {status})")]
    AuthenticationRequired { url: String, status: u16 },

    #[error("Failed to create file {path}: {source}")]
    FileCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write to file {path}: {source}")]
    FileWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stream error while downloading {url}: {source}")]
    StreamFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Download stalled: no progress for {seconds}s")]
    Stalled { seconds: u64 },

    #[error("Download engine crashed: {message}")]
    EngineCrashed { message: String },

    #[error("Download handle was already started")]
    AlreadyStarted,

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

impl DownloadError {
    /// Whether bytes already written to the partial file may be resumed later
    pub fn is_resumable(&self) -> bool {
        !matches!(
            self,
            DownloadError::AuthenticationRequired { .. }
                | DownloadError::FileCreateFailed { .. }
        )
    }
}

/// Errors that can occur when reading or writing the episode library
#[derive(Error, Debug)]
pub enum LibraryError {
    #[error("Failed to read library file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write library file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse library JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize library: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),

    #[error("Unknown episode '{0}'")]
    UnknownEpisode(String),
}

/// Errors that can occur when touching the download or scratch directories
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage is not available at {0}")]
    Unavailable(PathBuf),

    #[error("Failed to read directory {path}: {source}")]
    ReadDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create directory {path}: {source}")]
    CreateDirectoryFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Library error: {0}")]
    Library(#[from] LibraryError),
}

/// Errors that can occur when loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON in {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// A policy action name that does not map to any known action
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown network action '{0}'")]
pub struct ActionParseError(pub String);
