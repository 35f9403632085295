//! Disk-quota enforcement.
//!
//! Keeps the newest downloads within a byte budget, evicts the rest
//! oldest-first, then deletes files in the download directory that no
//! episode accounts for. The active transfer's file, the library file and
//! any other protected path are never treated as orphans.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::PreferencesProvider;
use crate::error::StorageError;
use crate::library::{EpisodeLibrary, EpisodeRecord};
use crate::progress::{ProgressEvent, SharedProgressReporter};
use crate::storage::{Storage, same_file};

/// Outcome of one reclaim sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Files kept within the budget
    pub kept: Vec<String>,
    /// Episodes whose files were evicted or found missing
    pub deleted_episodes: usize,
    /// Untracked files removed from the download directory
    pub orphans_removed: usize,
    /// Sum of the sizes of kept episodes
    pub bytes_kept: u64,
}

/// Run one sweep against `budget` bytes.
///
/// `active` is the episode currently being transferred, if any. Its file is
/// neither counted against the budget nor removed.
///
/// Blocking; call it from a blocking context.
pub fn reclaim(
    storage: &Storage,
    library: &dyn EpisodeLibrary,
    budget: u64,
    active: Option<&EpisodeRecord>,
) -> Result<ReclaimReport, StorageError> {
    let download_dir = storage.download_dir();
    if !download_dir.is_dir() {
        return Err(StorageError::Unavailable(download_dir.to_path_buf()));
    }

    let mut report = ReclaimReport::default();
    let mut keep: HashSet<String> = HashSet::new();
    if let Some(active) = active {
        keep.insert(active.stored_file_name());
    }

    let mut downloaded: Vec<(SystemTime, EpisodeRecord)> = library
        .downloaded_episodes()
        .into_iter()
        .filter(|episode| active.is_none_or(|a| a.id != episode.id))
        .map(|episode| {
            let modified = std::fs::metadata(storage.destination_path(&episode))
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, episode)
        })
        .collect();

    // Newest first
    downloaded.sort_by(|a, b| b.0.cmp(&a.0));

    let mut remaining = i128::from(budget);

    for (_, mut episode) in downloaded {
        let path = storage.destination_path(&episode);

        if path.is_file() {
            remaining -= i128::from(episode.filesize);
            if remaining >= 0 {
                let name = episode.stored_file_name();
                report.bytes_kept += episode.filesize;
                report.kept.push(name.clone());
                keep.insert(name);
                continue;
            }

            tracing::debug!(episode = %episode.id, path = %path.display(), "Evicting download");
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to delete expired file");
            }
        } else {
            tracing::debug!(episode = %episode.id, "Downloaded file missing, clearing flag");
        }

        episode.downloaded = false;
        episode.offset = 0;
        if let Err(e) = library.update_episode(&episode) {
            tracing::warn!(episode = %episode.id, error = %e, "Failed to clear downloaded flag");
            continue;
        }
        report.deleted_episodes += 1;
    }

    let library_file = library.backing_file();

    let entries =
        std::fs::read_dir(download_dir).map_err(|e| StorageError::ReadDirectoryFailed {
            path: download_dir.to_path_buf(),
            source: e,
        })?;

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if keep.contains(&name) {
            continue;
        }

        let is_library = library_file
            .as_deref()
            .is_some_and(|file| same_file(file, &path));
        if is_library || storage.is_protected(&path) {
            tracing::debug!(path = %path.display(), "Skipping protected file");
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => report.orphans_removed += 1,
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to delete orphan"),
        }
    }

    Ok(report)
}

/// Best-effort reclaim runner.
///
/// Never fails: errors are logged and the sweep is treated as a no-op.
#[derive(Clone)]
pub struct StorageReclaimer {
    storage: Storage,
    library: Arc<dyn EpisodeLibrary>,
    preferences: Arc<dyn PreferencesProvider>,
    reporter: SharedProgressReporter,
}

impl StorageReclaimer {
    pub fn new(
        storage: Storage,
        library: Arc<dyn EpisodeLibrary>,
        preferences: Arc<dyn PreferencesProvider>,
        reporter: SharedProgressReporter,
    ) -> Self {
        Self {
            storage,
            library,
            preferences,
            reporter,
        }
    }

    /// Run a sweep on the current thread, sparing the `active` transfer's file
    pub fn run_blocking(&self, active: Option<&EpisodeRecord>) -> Option<ReclaimReport> {
        if !self.storage.download_dir().is_dir() {
            tracing::debug!("Download directory not mounted, skipping reclaim");
            return None;
        }

        let budget = self.preferences.preferences().bytes_to_keep();
        match reclaim(&self.storage, self.library.as_ref(), budget, active) {
            Ok(report) => {
                tracing::info!(
                    kept = report.kept.len(),
                    deleted = report.deleted_episodes,
                    orphans = report.orphans_removed,
                    "Reclaim sweep finished"
                );
                self.reporter.report(ProgressEvent::StorageReclaimed {
                    deleted_episodes: report.deleted_episodes,
                    orphans_removed: report.orphans_removed,
                    bytes_kept: report.bytes_kept,
                });
                Some(report)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Reclaim sweep failed");
                None
            }
        }
    }

    /// Run a sweep on the blocking thread pool
    pub async fn run(&self, active: Option<EpisodeRecord>) -> Option<ReclaimReport> {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || this.run_blocking(active.as_ref())).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "Reclaim task failed");
                None
            }
        }
    }
}
