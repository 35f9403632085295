use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::config::DownloaderConfig;
use crate::error::StorageError;
use crate::library::EpisodeRecord;

/// The writable medium: a download directory plus a scratch directory
#[derive(Debug, Clone)]
pub struct Storage {
    download_dir: PathBuf,
    tmp_dir: PathBuf,
    /// Files that may live in the download directory but are not downloads
    protected: Vec<PathBuf>,
}

impl Storage {
    pub fn new(download_dir: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            tmp_dir: tmp_dir.into(),
            protected: Vec::new(),
        }
    }

    pub fn from_config(config: &DownloaderConfig) -> Self {
        Self::new(config.download_dir.clone(), config.tmp_dir())
    }

    /// Never delete these paths when sweeping the download directory
    pub fn with_protected(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.protected.extend(paths);
        self
    }

    pub fn is_protected(&self, path: &Path) -> bool {
        self.protected.iter().any(|p| same_file(p, path))
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Create both directories if needed and check they are writable
    pub fn ensure(&self) -> Result<(), StorageError> {
        for dir in [&self.download_dir, &self.tmp_dir] {
            std::fs::create_dir_all(dir).map_err(|e| StorageError::CreateDirectoryFailed {
                path: dir.clone(),
                source: e,
            })?;

            let writable = std::fs::metadata(dir)
                .map(|m| m.is_dir() && !m.permissions().readonly())
                .unwrap_or(false);
            if !writable {
                return Err(StorageError::Unavailable(dir.clone()));
            }
        }
        Ok(())
    }

    /// Whether downloads can be written right now
    pub fn is_available(&self) -> bool {
        match self.ensure() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Storage unavailable");
                false
            }
        }
    }

    pub fn destination_path(&self, episode: &EpisodeRecord) -> PathBuf {
        episode.local_path(&self.download_dir)
    }

    pub fn partial_path(&self, episode: &EpisodeRecord) -> PathBuf {
        self.tmp_dir.join(episode.partial_file_name())
    }

    /// Remove everything in the scratch directory except the named files.
    ///
    /// Returns the number of entries removed. A missing directory is not an error.
    pub fn clean_tmp(&self, keep: &HashSet<String>) -> Result<usize, StorageError> {
        if !self.tmp_dir.is_dir() {
            return Ok(0);
        }

        let entries =
            std::fs::read_dir(&self.tmp_dir).map_err(|e| StorageError::ReadDirectoryFailed {
                path: self.tmp_dir.clone(),
                source: e,
            })?;

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::ReadDirectoryFailed {
                path: self.tmp_dir.clone(),
                source: e,
            })?;

            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if keep.contains(&name) {
                continue;
            }

            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };

            match result {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove tmp entry"),
            }
        }

        Ok(removed)
    }
}

/// Whether two paths name the same directory entry, even if one does not exist yet
pub(crate) fn same_file(a: &Path, b: &Path) -> bool {
    match (resolve(a), resolve(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn resolve(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Some(parent.canonicalize().ok()?.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ensure_creates_missing_directories() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("dl"), dir.path().join("dl/.tmp"));

        assert!(storage.is_available());
        assert!(dir.path().join("dl/.tmp").is_dir());
    }

    #[test]
    fn unavailable_when_download_dir_is_a_file() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("dl");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let storage = Storage::new(&blocker, dir.path().join("tmp"));
        assert!(!storage.is_available());
    }

    #[test]
    fn clean_tmp_spares_kept_partials() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("dl"), dir.path().join("tmp"));
        storage.ensure().unwrap();

        std::fs::write(storage.tmp_dir().join("a.mp3.partial"), b"keep").unwrap();
        std::fs::write(storage.tmp_dir().join("b.mp3.partial"), b"stale").unwrap();
        std::fs::create_dir(storage.tmp_dir().join("junk")).unwrap();

        let keep: HashSet<String> = ["a.mp3.partial".to_string()].into_iter().collect();
        let removed = storage.clean_tmp(&keep).unwrap();

        assert_eq!(removed, 2);
        assert!(storage.tmp_dir().join("a.mp3.partial").exists());
        assert!(!storage.tmp_dir().join("b.mp3.partial").exists());
        assert!(!storage.tmp_dir().join("junk").exists());
    }

    #[test]
    fn clean_tmp_without_directory_is_noop() {
        let dir = tempdir().unwrap();
        let storage = Storage::new(dir.path().join("dl"), dir.path().join("missing"));
        assert_eq!(storage.clean_tmp(&HashSet::new()).unwrap(), 0);
    }

    #[test]
    fn paths_follow_episode_file_name() {
        let storage = Storage::new("/dl", "/dl/.tmp");
        let mut episode = EpisodeRecord::new("ep", "t", "https://example.com/a.mp3");
        episode.file_name = "show.mp3".to_string();

        assert_eq!(storage.destination_path(&episode), PathBuf::from("/dl/show.mp3"));
        assert_eq!(storage.partial_path(&episode), PathBuf::from("/dl/.tmp/show.mp3.partial"));
    }
}
