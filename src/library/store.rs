// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::LibraryError;

use super::episode::{EpisodeId, EpisodeRecord};
use super::media::unique_file_name;

/// Episode-access interface consumed by the downloader.
///
/// The surrounding application owns persistence; the downloader only reads
/// records and writes back the download-related fields.
pub trait EpisodeLibrary: Send + Sync {
    fn get_by_id(&self, id: &EpisodeId) -> Option<EpisodeRecord>;

    /// Store an updated record
    fn update_episode(&self, episode: &EpisodeRecord) -> Result<(), LibraryError>;

    /// Every known episode
    fn episodes(&self) -> Vec<EpisodeRecord>;

    fn mark_downloaded(&self, id: &EpisodeId, downloaded: bool) -> Result<(), LibraryError> {
        let mut episode = self
            .get_by_id(id)
            .ok_or_else(|| LibraryError::UnknownEpisode(id.to_string()))?;
        episode.downloaded = downloaded;
        self.update_episode(&episode)
    }

    fn downloaded_episodes(&self) -> Vec<EpisodeRecord> {
        self.episodes().into_iter().filter(|e| e.downloaded).collect()
    }

    /// File the library is persisted to, if any
    fn backing_file(&self) -> Option<PathBuf> {
        None
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibraryFile {
    episodes: Vec<EpisodeRecord>,
}

/// Episode library kept in memory and optionally mirrored to a JSON file
#[derive(Debug)]
pub struct FileLibrary {
    path: Option<PathBuf>,
    episodes: Mutex<BTreeMap<EpisodeId, EpisodeRecord>>,
}

impl FileLibrary {
    /// A library that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            episodes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open a JSON library file, starting empty if it does not exist yet
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        let episodes = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| LibraryError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
            let file: LibraryFile =
                serde_json::from_str(&content).map_err(|e| LibraryError::JsonParseFailed {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            file.episodes
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            episodes: Mutex::new(episodes),
        })
    }

    /// Add or replace an episode.
    ///
    /// If another episode already owns the file name, the new record gets a
    /// numbered one. Returns the record as stored.
    pub fn insert(&self, mut episode: EpisodeRecord) -> Result<EpisodeRecord, LibraryError> {
        let mut episodes = self.lock();

        // Compared case-insensitively for case-folding filesystems
        let taken: HashSet<String> = episodes
            .values()
            .filter(|other| other.id != episode.id)
            .map(|other| other.stored_file_name().to_lowercase())
            .collect();
        let stored = episode.stored_file_name();
        if taken.contains(&stored.to_lowercase()) {
            let unique = unique_file_name(&stored, |name| taken.contains(&name.to_lowercase()));
            tracing::debug!(episode = %episode.id, from = %stored, to = %unique, "File name taken, renaming");
            episode.file_name = unique;
        }

        episodes.insert(episode.id.clone(), episode.clone());
        self.persist(&episodes)?;
        Ok(episode)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<EpisodeId, EpisodeRecord>> {
        self.episodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, episodes: &BTreeMap<EpisodeId, EpisodeRecord>) -> Result<(), LibraryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = LibraryFile {
            episodes: episodes.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json).map_err(|e| LibraryError::WriteFailed {
            path: path.clone(),
            source: e,
        })
    }
}

impl EpisodeLibrary for FileLibrary {
    fn get_by_id(&self, id: &EpisodeId) -> Option<EpisodeRecord> {
        self.lock().get(id).cloned()
    }

    fn update_episode(&self, episode: &EpisodeRecord) -> Result<(), LibraryError> {
        let mut episodes = self.lock();
        match episodes.get_mut(&episode.id) {
            Some(existing) => *existing = episode.clone(),
            None => return Err(LibraryError::UnknownEpisode(episode.id.to_string())),
        }
        self.persist(&episodes)
    }

    fn episodes(&self) -> Vec<EpisodeRecord> {
        self.lock().values().cloned().collect()
    }

    fn backing_file(&self) -> Option<PathBuf> {
        self.path.clone()
    }
}
