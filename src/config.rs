use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const BYTES_PER_MEGABYTE: u64 = 1024 * 1024;

/// User preferences consulted on every policy decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Only download over unmetered links (Wi-Fi, Ethernet, ...)
    pub wifi_only: bool,
    /// Download new episodes automatically after a refresh
    pub auto_download: bool,
    /// Size budget for downloaded episodes, in megabytes
    pub megabytes_to_keep: u64,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            wifi_only: true,
            auto_download: true,
            megabytes_to_keep: 1000,
        }
    }
}

impl Preferences {
    /// The storage budget in bytes
    pub fn bytes_to_keep(&self) -> u64 {
        self.megabytes_to_keep.saturating_mul(BYTES_PER_MEGABYTE)
    }
}

/// Source of the current preferences.
///
/// Read on every decision so changes take effect without restarting.
pub trait PreferencesProvider: Send + Sync {
    fn preferences(&self) -> Preferences;
}

/// Preferences held in memory and replaceable at runtime
#[derive(Debug, Default)]
pub struct SharedPreferences {
    inner: RwLock<Preferences>,
}

impl SharedPreferences {
    pub fn new(preferences: Preferences) -> Self {
        Self {
            inner: RwLock::new(preferences),
        }
    }

    /// Replace the current preferences
    pub fn set(&self, preferences: Preferences) {
        match self.inner.write() {
            Ok(mut guard) => *guard = preferences,
            Err(poisoned) => *poisoned.into_inner() = preferences,
        }
    }
}

impl PreferencesProvider for SharedPreferences {
    fn preferences(&self) -> Preferences {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// HTTP transfer settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 20,
            read_timeout_secs: 20,
            max_redirects: 10,
            user_agent: concat!("podqueue/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Top-level configuration for the downloader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    /// Directory finished episodes are stored in
    pub download_dir: PathBuf,
    /// Scratch directory for partial transfers (defaults to `<download_dir>/.tmp`)
    pub tmp_dir: Option<PathBuf>,
    pub preferences: Preferences,
    pub http: HttpConfig,
    /// Minimum interval between progress reports
    pub progress_interval_ms: u64,
    /// Abort a transfer that makes no progress for this long
    pub stall_timeout_secs: u64,
    /// Capacity of the bounded enqueue-signal buffer
    pub signal_buffer: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("podcasts"),
            tmp_dir: None,
            preferences: Preferences::default(),
            http: HttpConfig::default(),
            progress_interval_ms: 1000,
            stall_timeout_secs: 120,
            signal_buffer: 10_000,
        }
    }
}

impl DownloaderConfig {
    /// Load configuration from a JSON file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir
            .clone()
            .unwrap_or_else(|| self.download_dir.join(".tmp"))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs.max(1))
    }
}
