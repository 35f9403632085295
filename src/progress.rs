use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::library::EpisodeId;

/// Immutable snapshot published after every queue mutation or active-slot transition.
///
/// Listeners should treat it as the current state, not as a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueChangedEvent {
    /// Number of entries waiting in the queue (the active item is not counted)
    pub queue_size: usize,
}

/// Events emitted by the downloader
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The queue or the active slot changed
    QueueChanged(QueueChangedEvent),

    /// A transfer became the active download
    DownloadStarting {
        episode_id: EpisodeId,
        episode_title: String,
        /// Offset the transfer resumes from
        resume_from: u64,
    },

    /// Byte progress of the active transfer
    DownloadProgress {
        episode_id: EpisodeId,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },

    /// A transfer finished and the file is in the download directory
    DownloadCompleted {
        episode_id: EpisodeId,
        episode_title: String,
        bytes_downloaded: u64,
    },

    /// A transfer ended without completing
    DownloadInterrupted {
        episode_id: EpisodeId,
        episode_title: String,
        /// Bytes kept for a later resume
        resumable_offset: u64,
        error: String,
    },

    /// A queue entry was dropped because its episode is missing or malformed
    EntryDropped { episode_id: EpisodeId, reason: String },

    /// A finished file is ready to be picked up by a media index
    MediaAvailable { episode_id: EpisodeId, path: PathBuf },

    /// A reclaim sweep finished
    StorageReclaimed {
        deleted_episodes: usize,
        orphans_removed: usize,
        bytes_kept: u64,
    },

    /// Leftovers were removed from the scratch directory
    TmpCleanedUp { count: usize },
}

/// Trait for receiving downloader events.
///
/// Implementations can use this to display progress bars, refresh a UI,
/// or collect statistics. Must not block.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {
        // Intentionally empty
    }
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

/// Rate limiter for byte-progress events
#[derive(Debug)]
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    /// True when enough time has passed since the last emitted update
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_reporter_accepts_events() {
        let reporter = NoopReporter::shared();

        reporter.report(ProgressEvent::QueueChanged(QueueChangedEvent { queue_size: 3 }));
        reporter.report(ProgressEvent::DownloadProgress {
            episode_id: EpisodeId::from("ep"),
            bytes_downloaded: 512,
            total_bytes: Some(1024),
        });
        reporter.report(ProgressEvent::TmpCleanedUp { count: 2 });
    }

    #[test]
    fn throttle_first_emit_passes() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_emit());
        assert!(!throttle.should_emit());
    }

    #[test]
    fn throttle_reopens_after_interval() {
        let mut throttle = ProgressThrottle::new(Duration::from_millis(20));
        assert!(throttle.should_emit());
        std::thread::sleep(Duration::from_millis(30));
        assert!(throttle.should_emit());
    }
}
