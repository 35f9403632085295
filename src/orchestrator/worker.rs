use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use url::Url;

use super::{ActiveDownload, Failure, Inner, Internal, Outcome, Signal, WorkerChannels};
use crate::engine::{DownloadHandle, HandleId, TransferCallback, TransferJob, TransferReport};
use crate::error::DownloadError;
use crate::library::{EpisodeRecord, MediaKind, media_kind, mime_from_path};
use crate::network::NetworkState;
use crate::progress::ProgressEvent;
use crate::queue::{PopOutcome, QueueEntry};

/// Posts terminal transfer callbacks back to the worker
struct CompletionForwarder {
    internal: mpsc::UnboundedSender<Internal>,
}

impl CompletionForwarder {
    fn post(&self, handle: HandleId, episode: &EpisodeRecord, outcome: Outcome) {
        let message = Internal::Finished {
            handle,
            episode: episode.clone(),
            outcome,
        };
        if self.internal.send(message).is_err() {
            tracing::debug!(handle = %handle, "Worker gone, dropping transfer outcome");
        }
    }
}

impl TransferCallback for CompletionForwarder {
    fn download_completed(&self, handle: HandleId, episode: &EpisodeRecord, report: &TransferReport) {
        self.post(handle, episode, Outcome::Completed(report.clone()));
    }

    fn download_interrupted(&self, handle: HandleId, episode: &EpisodeRecord, error: &DownloadError) {
        let failure = Failure {
            message: error.to_string(),
            resumable: error.is_resumable(),
            crashed: matches!(error, DownloadError::EngineCrashed { .. }),
        };
        self.post(handle, episode, Outcome::Interrupted(failure));
    }
}

/// Manual entries may use a restricted link; automatic ones need an unrestricted one
fn admits(entry: &QueueEntry, state: NetworkState) -> bool {
    if entry.started_manually {
        state.is_usable()
    } else {
        state == NetworkState::Ok
    }
}

/// Strip parameters such as `; charset=` from a Content-Type value
fn bare_mime(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    (!mime.is_empty()).then(|| mime.to_ascii_lowercase())
}

enum Event {
    Internal(Internal),
    Signal(Signal),
}

pub(super) async fn run(inner: Arc<Inner>, mut channels: WorkerChannels) {
    tracing::debug!("Download worker started");

    inner.advance().await;
    inner.busy.store(false, Ordering::SeqCst);
    inner.settled.notify_waiters();

    loop {
        let event = tokio::select! {
            biased;
            () = inner.shutdown.cancelled() => break,
            Some(message) = channels.internal.recv() => Event::Internal(message),
            Some(signal) = channels.signals.recv() => Event::Signal(signal),
            else => break,
        };

        inner.busy.store(true, Ordering::SeqCst);
        match event {
            Event::Internal(message) => inner.handle_internal(message).await,
            Event::Signal(signal) => {
                inner.signals_in_flight.fetch_sub(1, Ordering::SeqCst);
                inner.handle_signal(signal).await;
            }
        }
        inner.busy.store(false, Ordering::SeqCst);
        inner.settled.notify_waiters();
    }

    if let Some(handle) = inner.active_handle() {
        handle.abort();
    }
    inner.settled.notify_waiters();
    tracing::debug!("Download worker stopped");
}

impl Inner {
    async fn handle_signal(&self, signal: Signal) {
        match signal {
            Signal::Enqueued(episode_id) => {
                tracing::debug!(episode = %episode_id, "Enqueue signal");
            }
            Signal::Advance(reason) => {
                tracing::debug!(reason, "Advance signal");
            }
        }
        self.advance().await;
    }

    async fn handle_internal(&self, message: Internal) {
        match message {
            Internal::Finished {
                handle,
                episode,
                outcome,
            } => self.finish_transfer(handle, episode, outcome).await,
            Internal::Reclaim(reply) => {
                let active = self.active_handle().map(|h| h.episode().clone());
                let report = self.reclaimer.run(active).await;
                let _ = reply.send(report);
            }
        }
    }

    /// Start the next admissible entry if the active slot is free
    async fn advance(&self) {
        loop {
            if self.lock_active().is_some() {
                return;
            }

            self.clean_tmp_cruft().await;

            if self.queue.is_empty() {
                self.stalled.store(false, Ordering::SeqCst);
                return;
            }

            if !self.storage.is_available() {
                tracing::warn!(pending = self.queue.len(), "No writable storage, queue kept");
                self.stalled.store(true, Ordering::SeqCst);
                return;
            }

            let state = self.network_state();
            let entry = match self.queue.pop_first_if(|head| admits(head, state)) {
                PopOutcome::Empty => {
                    self.stalled.store(false, Ordering::SeqCst);
                    return;
                }
                PopOutcome::Deferred => {
                    tracing::debug!(?state, "Queue head deferred by network policy");
                    self.stalled.store(true, Ordering::SeqCst);
                    return;
                }
                PopOutcome::Popped(entry) => entry,
            };

            let Some(episode) = self.library.get_by_id(&entry.episode_id) else {
                self.drop_entry(&entry, "episode not found");
                continue;
            };

            let Some(url) = episode.download_url() else {
                self.drop_entry(&entry, "invalid download URL");
                continue;
            };

            self.stalled.store(false, Ordering::SeqCst);
            if self.begin(entry, episode, url) {
                return;
            }
        }
    }

    fn drop_entry(&self, entry: &QueueEntry, reason: &str) {
        tracing::warn!(episode = %entry.episode_id, reason, "Dropping queue entry");
        self.queue.release(&entry.episode_id);
        self.reporter.report(ProgressEvent::EntryDropped {
            episode_id: entry.episode_id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Build a handle for `entry` and launch it. Returns false if the entry was dropped.
    fn begin(&self, entry: QueueEntry, episode: EpisodeRecord, url: Url) -> bool {
        let resume_from = if episode.has_partial() {
            episode.offset
        } else {
            0
        };

        let job = TransferJob {
            url,
            partial_path: self.storage.partial_path(&episode),
            destination: self.storage.destination_path(&episode),
            resume_from,
            episode: episode.clone(),
        };

        let id = HandleId(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let handle = DownloadHandle::new(
            id,
            job,
            self.engines.new_engine(&episode),
            Arc::clone(&self.reporter),
            self.settings.handle,
        );
        self.launch(entry, handle)
    }

    /// Make `handle` the active transfer and start it
    pub(super) fn launch(&self, entry: QueueEntry, handle: Arc<DownloadHandle>) -> bool {
        handle.add_callback(Arc::new(CompletionForwarder {
            internal: self.internal.clone(),
        }));

        let episode = handle.episode().clone();
        let resume_from = handle.progress().bytes_downloaded;
        *self.lock_active() = Some(ActiveDownload {
            entry,
            handle: Arc::clone(&handle),
        });
        self.queue.publish();

        tracing::info!(episode = %episode.id, handle = %handle.id(), resume_from, "Download starting");
        self.reporter.report(ProgressEvent::DownloadStarting {
            episode_id: episode.id.clone(),
            episode_title: episode.title.clone(),
            resume_from,
        });

        if let Err(e) = handle.start() {
            tracing::error!(episode = %episode.id, error = %e, "Failed to start transfer");
            if let Some(active) = self.lock_active().take() {
                self.drop_entry(&active.entry, "transfer failed to start");
            }
            return false;
        }
        true
    }

    async fn finish_transfer(&self, handle: HandleId, episode: EpisodeRecord, outcome: Outcome) {
        let finished = {
            let mut active = self.lock_active();
            if active.as_ref().is_some_and(|a| a.handle.id() == handle) {
                active.take()
            } else {
                None
            }
        };
        if finished.is_none() {
            tracing::debug!(handle = %handle, "Ignoring outcome of a stale transfer");
            return;
        }

        let completed = match outcome {
            Outcome::Completed(report) => {
                self.record_completion(&episode, &report);
                true
            }
            Outcome::Interrupted(failure) => {
                self.record_interruption(&episode, &failure).await;
                false
            }
        };

        self.queue.release(&episode.id);
        self.tmp_dirty.store(true, Ordering::SeqCst);

        if completed {
            self.reclaimer.run(None).await;
        }
        self.advance().await;
    }

    fn record_completion(&self, episode: &EpisodeRecord, report: &TransferReport) {
        let mut record = self
            .library
            .get_by_id(&episode.id)
            .unwrap_or_else(|| episode.clone());

        let mime = mime_from_path(&record.stored_file_name())
            .map(String::from)
            .or_else(|| report.content_type.as_deref().and_then(bare_mime))
            .or_else(|| record.mime_type.clone());

        record.is_video = media_kind(mime.as_deref()) == MediaKind::Video;
        record.mime_type = mime;
        record.downloaded = true;
        record.offset = 0;
        record.filesize = report.file_size;

        if let Err(e) = self.library.update_episode(&record) {
            tracing::warn!(episode = %record.id, error = %e, "Failed to record completed download");
        }

        let path = self.storage.destination_path(&record);
        tracing::info!(
            episode = %record.id,
            bytes = report.file_size,
            path = %path.display(),
            "Download completed"
        );

        self.reporter.report(ProgressEvent::DownloadCompleted {
            episode_id: record.id.clone(),
            episode_title: record.title.clone(),
            bytes_downloaded: report.bytes_downloaded,
        });
        self.reporter.report(ProgressEvent::MediaAvailable {
            episode_id: record.id.clone(),
            path,
        });
    }

    async fn record_interruption(&self, episode: &EpisodeRecord, failure: &Failure) {
        let partial = self.storage.partial_path(episode);
        let offset = if failure.resumable {
            tokio::fs::metadata(&partial)
                .await
                .map(|m| m.len())
                .unwrap_or(0)
        } else {
            let _ = tokio::fs::remove_file(&partial).await;
            0
        };

        if let Some(mut record) = self.library.get_by_id(&episode.id) {
            record.downloaded = false;
            record.offset = offset;
            if let Err(e) = self.library.update_episode(&record) {
                tracing::warn!(episode = %record.id, error = %e, "Failed to record interrupted download");
            }
        }

        if failure.crashed {
            self.telemetry.report(
                "download_engine",
                &format!("transfer of {} crashed: {}", episode.id, failure.message),
            );
        }

        tracing::warn!(
            episode = %episode.id,
            offset,
            error = %failure.message,
            "Download interrupted"
        );
        self.reporter.report(ProgressEvent::DownloadInterrupted {
            episode_id: episode.id.clone(),
            episode_title: episode.title.clone(),
            resumable_offset: offset,
            error: failure.message.clone(),
        });
    }

    /// Clear the scratch directory while idle, sparing resumable partials
    async fn clean_tmp_cruft(&self) {
        if !self.tmp_dirty.swap(false, Ordering::SeqCst) {
            return;
        }

        let keep: HashSet<String> = self
            .library
            .episodes()
            .iter()
            .filter(|e| e.has_partial())
            .map(EpisodeRecord::partial_file_name)
            .collect();

        let storage = self.storage.clone();
        match tokio::task::spawn_blocking(move || storage.clean_tmp(&keep)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(count)) => {
                tracing::debug!(count, "Removed tmp leftovers");
                self.reporter.report(ProgressEvent::TmpCleanedUp { count });
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to clean tmp directory"),
            Err(e) => tracing::warn!(error = %e, "Tmp cleanup task failed"),
        }
    }
}
