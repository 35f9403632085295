//! The download orchestrator.
//!
//! A single worker task owns the active slot. Producers (enqueue, removal,
//! connectivity changes) only mutate the [`QueueStore`] and post a signal
//! through a bounded channel; transfer outcomes come back through an
//! unbounded internal channel. Only the worker starts transfers, so at most
//! one [`DownloadHandle`] is active at any time.
//!
//! The `active` slot and the queue lock are never held together, and
//! neither is held across an await.

mod worker;


use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::config::{DownloaderConfig, PreferencesProvider};
use crate::engine::{DownloadHandle, EngineFactory, HandleId, HandleSettings, TransferReport};
use crate::library::{EpisodeId, EpisodeLibrary, EpisodeRecord};
use crate::network::{self, Action, ConnectivityProvider, NetworkState, SubscriptionPolicy};
use crate::progress::SharedProgressReporter;
use crate::queue::{QueueEntry, QueuePosition, QueueStore};
use crate::reclaim::{ReclaimReport, StorageReclaimer};
use crate::storage::Storage;
use crate::telemetry::SharedErrorReporter;

/// Episodes updated within this window count as new for automatic download
const NEW_EPISODE_WINDOW_MINUTES: i64 = 10;

/// Where an episode stands from the downloader's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Nothing,
    Pending,
    Downloading,
    Done,
    /// Not downloaded, but a partial transfer can be resumed
    Interrupted,
}

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// Capacity of the bounded signal channel
    pub signal_buffer: usize,
    pub handle: HandleSettings,
}

impl OrchestratorSettings {
    pub fn from_config(config: &DownloaderConfig) -> Self {
        Self {
            signal_buffer: config.signal_buffer.max(1),
            handle: HandleSettings {
                stall_timeout: config.stall_timeout(),
                progress_interval: config.progress_interval(),
            },
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&DownloaderConfig::default())
    }
}

/// Collaborators injected into the orchestrator
pub struct OrchestratorDeps {
    pub library: Arc<dyn EpisodeLibrary>,
    pub connectivity: Arc<dyn ConnectivityProvider>,
    pub preferences: Arc<dyn PreferencesProvider>,
    pub engines: Arc<dyn EngineFactory>,
    pub reporter: SharedProgressReporter,
    pub telemetry: SharedErrorReporter,
    pub storage: Storage,
    pub settings: OrchestratorSettings,
}

/// Wake-up posted by producers
#[derive(Debug)]
enum Signal {
    Enqueued(EpisodeId),
    Advance(&'static str),
}

/// Messages from transfers and on-demand requests
enum Internal {
    Finished {
        handle: HandleId,
        episode: EpisodeRecord,
        outcome: Outcome,
    },
    Reclaim(oneshot::Sender<Option<ReclaimReport>>),
}

enum Outcome {
    Completed(TransferReport),
    Interrupted(Failure),
}

struct Failure {
    message: String,
    resumable: bool,
    crashed: bool,
}

struct ActiveDownload {
    entry: QueueEntry,
    handle: Arc<DownloadHandle>,
}

struct WorkerChannels {
    signals: mpsc::Receiver<Signal>,
    internal: mpsc::UnboundedReceiver<Internal>,
}

struct Inner {
    library: Arc<dyn EpisodeLibrary>,
    connectivity: Arc<dyn ConnectivityProvider>,
    preferences: Arc<dyn PreferencesProvider>,
    engines: Arc<dyn EngineFactory>,
    reporter: SharedProgressReporter,
    telemetry: SharedErrorReporter,
    storage: Storage,
    settings: OrchestratorSettings,
    queue: QueueStore,
    reclaimer: StorageReclaimer,
    /// Written only by the worker
    active: Mutex<Option<ActiveDownload>>,
    signals: mpsc::Sender<Signal>,
    internal: mpsc::UnboundedSender<Internal>,
    /// Signals posted but not yet fully handled
    signals_in_flight: AtomicUsize,
    /// The worker is handling a message
    busy: AtomicBool,
    /// The head of the queue is blocked by policy or storage
    stalled: AtomicBool,
    tmp_dirty: AtomicBool,
    next_handle: AtomicU64,
    settled: Notify,
    shutdown: CancellationToken,
}

impl Inner {
    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveDownload>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn active_handle(&self) -> Option<Arc<DownloadHandle>> {
        self.lock_active().as_ref().map(|a| Arc::clone(&a.handle))
    }

    fn network_state(&self) -> NetworkState {
        network::evaluate(
            self.connectivity.current_connectivity(),
            &self.preferences.preferences(),
        )
    }

    fn signal(&self, signal: Signal) {
        self.signals_in_flight.fetch_add(1, Ordering::SeqCst);
        match self.signals.try_send(signal) {
            Ok(()) => {}
            Err(TrySendError::Full(signal)) => {
                self.signals_in_flight.fetch_sub(1, Ordering::SeqCst);
                self.telemetry.report(
                    "download_queue",
                    &format!("signal buffer full, dropping {signal:?}"),
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.signals_in_flight.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!("Download worker stopped, signal ignored");
            }
        }
    }

    fn is_settled(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
            && self.lock_active().is_none()
            && self.signals_in_flight.load(Ordering::SeqCst) == 0
            && (self.queue.is_empty() || self.stalled.load(Ordering::SeqCst))
    }
}

/// Owns the download queue and the single active transfer.
///
/// Cheap to clone; the worker stops when the last clone is dropped or
/// [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
    _guard: Arc<DropGuard>,
}

impl DownloadOrchestrator {
    /// Build the orchestrator and spawn its worker on the current runtime
    pub fn spawn(deps: OrchestratorDeps) -> Self {
        let (orchestrator, channels) = Self::build(deps);
        tokio::spawn(worker::run(Arc::clone(&orchestrator.inner), channels));
        orchestrator
    }

    fn build(deps: OrchestratorDeps) -> (Self, WorkerChannels) {
        let (signal_tx, signal_rx) = mpsc::channel(deps.settings.signal_buffer.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let reclaimer = StorageReclaimer::new(
            deps.storage.clone(),
            Arc::clone(&deps.library),
            Arc::clone(&deps.preferences),
            Arc::clone(&deps.reporter),
        );

        let inner = Arc::new(Inner {
            queue: QueueStore::new(Arc::clone(&deps.reporter)),
            library: deps.library,
            connectivity: deps.connectivity,
            preferences: deps.preferences,
            engines: deps.engines,
            reporter: deps.reporter,
            telemetry: deps.telemetry,
            storage: deps.storage,
            settings: deps.settings,
            reclaimer,
            active: Mutex::new(None),
            signals: signal_tx,
            internal: internal_tx,
            signals_in_flight: AtomicUsize::new(0),
            busy: AtomicBool::new(true),
            stalled: AtomicBool::new(false),
            tmp_dirty: AtomicBool::new(true),
            next_handle: AtomicU64::new(1),
            settled: Notify::new(),
            shutdown: shutdown.clone(),
        });

        let orchestrator = Self {
            inner,
            _guard: Arc::new(shutdown.drop_guard()),
        };
        let channels = WorkerChannels {
            signals: signal_rx,
            internal: internal_rx,
        };
        (orchestrator, channels)
    }

    /// Queue an episode. Returns false if it is already queued or downloading.
    pub fn add_item_to_queue(&self, episode_id: &EpisodeId, position: QueuePosition) -> bool {
        let added = self.inner.queue.enqueue(episode_id.clone(), position);
        if added {
            tracing::info!(episode = %episode_id, ?position, "Episode queued");
            self.inner.signal(Signal::Enqueued(episode_id.clone()));
        }
        added
    }

    pub fn remove_from_queue(&self, episode_id: &EpisodeId) -> bool {
        let removed = self.inner.queue.remove_episode(episode_id);
        if removed {
            self.inner.signal(Signal::Advance("entry removed"));
        }
        removed
    }

    pub fn remove_at(&self, index: usize) -> bool {
        let removed = self.inner.queue.remove_at(index).is_some();
        if removed {
            self.inner.signal(Signal::Advance("entry removed"));
        }
        removed
    }

    /// Relocate a pending entry; fails when either index is out of range
    pub fn move_item(&self, from: usize, to: usize) -> bool {
        let moved = self.inner.queue.move_entry(from, to);
        if moved {
            self.inner.signal(Signal::Advance("entry moved"));
        }
        moved
    }

    /// Abort the active transfer. Its interruption advances the queue as usual.
    ///
    /// Returns false when nothing is active or cancellation was already requested.
    pub fn cancel_current_download(&self) -> bool {
        match self.inner.active_handle() {
            Some(handle) => handle.abort(),
            None => {
                tracing::warn!("No active download to cancel");
                false
            }
        }
    }

    pub fn status(&self, episode_id: &EpisodeId) -> DownloadStatus {
        let downloading = self
            .inner
            .lock_active()
            .as_ref()
            .is_some_and(|a| &a.entry.episode_id == episode_id);
        if downloading {
            return DownloadStatus::Downloading;
        }
        if self.inner.queue.is_queued(episode_id) {
            return DownloadStatus::Pending;
        }

        match self.inner.library.get_by_id(episode_id) {
            Some(episode) if episode.downloaded => DownloadStatus::Done,
            Some(episode) if episode.has_partial() => DownloadStatus::Interrupted,
            _ => DownloadStatus::Nothing,
        }
    }

    /// Pending entries; the active transfer is not counted
    pub fn queue_size(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn queue_item(&self, index: usize) -> Option<QueueEntry> {
        self.inner.queue.get(index)
    }

    pub fn queue_snapshot(&self) -> Vec<QueueEntry> {
        self.inner.queue.snapshot()
    }

    /// The active entry with its current progress
    pub fn downloading_item(&self) -> Option<QueueEntry> {
        self.inner.lock_active().as_ref().map(|active| {
            let mut entry = active.entry.clone();
            entry.progress = active.handle.progress();
            entry
        })
    }

    pub fn downloading_episode(&self) -> Option<EpisodeRecord> {
        self.inner.active_handle().map(|h| h.episode().clone())
    }

    pub fn network_state(&self) -> NetworkState {
        self.inner.network_state()
    }

    pub fn can_perform(&self, action: Action, subscription: Option<&SubscriptionPolicy>) -> bool {
        network::can_perform(
            action,
            self.inner.network_state(),
            &self.inner.preferences.preferences(),
            subscription,
        )
    }

    /// Like [`can_perform`](Self::can_perform) for an action given by name;
    /// unknown names are denied and reported.
    pub fn can_perform_named(&self, action: &str, subscription: Option<&SubscriptionPolicy>) -> bool {
        network::can_perform_named(
            action,
            self.inner.network_state(),
            &self.inner.preferences.preferences(),
            subscription,
            self.inner.telemetry.as_ref(),
        )
    }

    /// Re-run advancement, e.g. when the device switched networks
    pub fn notify_connectivity_changed(&self) {
        tracing::debug!(state = ?self.inner.network_state(), "Connectivity changed");
        self.inner.signal(Signal::Advance("connectivity changed"));
    }

    /// Run a reclaim sweep on the worker
    pub async fn reclaim_now(&self) -> Option<ReclaimReport> {
        let (tx, rx) = oneshot::channel();
        if self.inner.internal.send(Internal::Reclaim(tx)).is_err() {
            return None;
        }
        rx.await.ok().flatten()
    }

    /// Queue freshly published episodes of a subscription for automatic download.
    ///
    /// At most `new_episode_count` episodes updated within the last ten
    /// minutes are considered. Returns how many were actually queued.
    pub fn enqueue_new_episodes(
        &self,
        subscription: &SubscriptionPolicy,
        episodes: &[EpisodeRecord],
        new_episode_count: usize,
        now: DateTime<Utc>,
    ) -> usize {
        if !self.can_perform(Action::DownloadAutomatically, Some(subscription)) {
            tracing::debug!("Automatic download not permitted, skipping new episodes");
            return 0;
        }

        let cutoff = now - TimeDelta::minutes(NEW_EPISODE_WINDOW_MINUTES);
        let mut remaining = new_episode_count;
        let mut queued = 0;

        for episode in episodes {
            if remaining == 0 {
                break;
            }
            if episode.last_update > cutoff {
                remaining -= 1;
                if self.add_item_to_queue(&episode.id, QueuePosition::Anywhere) {
                    queued += 1;
                }
            }
        }
        queued
    }

    /// Wait until nothing is active and the queue is empty or blocked.
    ///
    /// Returns the number of entries still pending.
    pub async fn wait_until_settled(&self) -> usize {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.is_settled() || self.inner.shutdown.is_cancelled() {
                return self.inner.queue.len();
            }

            tokio::select! {
                () = &mut notified => {}
                () = self.inner.shutdown.cancelled() => {}
            }
        }
    }

    /// Abort the active transfer and stop the worker
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.active_handle() {
            handle.abort();
        }
        self.inner.shutdown.cancel();
    }
}
