//! Transfer engines.
//!
//! A [`DownloadEngine`] moves the bytes of one episode; a [`DownloadHandle`]
//! wraps one run of an engine in a `Created -> Started -> Completed |
//! Interrupted` state machine with cancellation and a stall watchdog.

mod handle;
mod http;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::DownloadError;
use crate::library::{EpisodeId, EpisodeRecord};
use crate::progress::{ProgressEvent, ProgressThrottle, SharedProgressReporter};

pub use handle::{DownloadHandle, HandleId, HandleSettings, HandleState, TransferCallback};
pub use http::HttpEngine;

/// Everything an engine needs to move one episode to disk
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub episode: EpisodeRecord,
    pub url: Url,
    /// Scratch file the bytes are streamed into
    pub partial_path: PathBuf,
    /// Final location once the transfer is complete
    pub destination: PathBuf,
    /// Recorded offset of a previous partial transfer (0 for a fresh start)
    pub resume_from: u64,
}

/// Result of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    /// Bytes received in this run
    pub bytes_downloaded: u64,
    /// Size of the finished file
    pub file_size: u64,
    /// Offset the transfer actually resumed from
    pub resumed_from: u64,
    /// Content-Type announced by the server
    pub content_type: Option<String>,
}

/// Byte progress of a transfer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_downloaded: u64,
    pub total_bytes: Option<u64>,
}

/// Progress channel handed to an engine for one transfer.
///
/// Every update feeds the stall watchdog; reporter events are throttled.
pub struct ProgressSink {
    episode_id: EpisodeId,
    tx: watch::Sender<TransferProgress>,
    reporter: SharedProgressReporter,
    throttle: ProgressThrottle,
}

impl ProgressSink {
    pub fn new(
        episode_id: EpisodeId,
        tx: watch::Sender<TransferProgress>,
        reporter: SharedProgressReporter,
        interval: Duration,
    ) -> Self {
        Self {
            episode_id,
            tx,
            reporter,
            throttle: ProgressThrottle::new(interval),
        }
    }

    pub fn update(&mut self, bytes_downloaded: u64, total_bytes: Option<u64>) {
        let progress = TransferProgress {
            bytes_downloaded,
            total_bytes,
        };
        self.tx.send_replace(progress);

        if self.throttle.should_emit() {
            self.emit(progress);
        }
    }

    /// Emit the latest progress regardless of the throttle
    pub fn flush(&mut self) {
        let progress = *self.tx.borrow();
        self.emit(progress);
    }

    fn emit(&self, progress: TransferProgress) {
        self.reporter.report(ProgressEvent::DownloadProgress {
            episode_id: self.episode_id.clone(),
            bytes_downloaded: progress.bytes_downloaded,
            total_bytes: progress.total_bytes,
        });
    }
}

/// Moves the bytes of one episode.
///
/// Implementations must return promptly once `cancel` fires.
#[async_trait]
pub trait DownloadEngine: Send + Sync {
    async fn transfer(
        &self,
        job: TransferJob,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<TransferReport, DownloadError>;
}

/// Creates the engine used for an episode
pub trait EngineFactory: Send + Sync {
    fn new_engine(&self, episode: &EpisodeRecord) -> Arc<dyn DownloadEngine>;
}

impl<F> EngineFactory for F
where
    F: Fn(&EpisodeRecord) -> Arc<dyn DownloadEngine> + Send + Sync,
{
    fn new_engine(&self, episode: &EpisodeRecord) -> Arc<dyn DownloadEngine> {
        self(episode)
    }
}
