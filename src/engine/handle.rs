use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{DownloadEngine, ProgressSink, TransferJob, TransferProgress, TransferReport};
use crate::error::DownloadError;
use crate::library::EpisodeRecord;
use crate::progress::SharedProgressReporter;

/// How long a cancelled engine may take to wind down before its task is aborted
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Identifies one download attempt; completions carrying a stale id are ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Started,
    Completed,
    Interrupted,
}

impl HandleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandleState::Completed | HandleState::Interrupted)
    }
}

/// Receives the single terminal callback of a handle.
///
/// Called from the handle's task; implementations must not block.
pub trait TransferCallback: Send + Sync {
    fn download_completed(&self, handle: HandleId, episode: &EpisodeRecord, report: &TransferReport);
    fn download_interrupted(&self, handle: HandleId, episode: &EpisodeRecord, error: &DownloadError);
}

#[derive(Debug, Clone, Copy)]
pub struct HandleSettings {
    /// Interrupt the transfer when no progress arrives for this long
    pub stall_timeout: Duration,
    /// Minimum spacing of progress events
    pub progress_interval: Duration,
}

impl Default for HandleSettings {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(120),
            progress_interval: Duration::from_secs(1),
        }
    }
}

/// One run of a [`DownloadEngine`] for one episode.
///
/// Transitions `Created -> Started -> Completed | Interrupted` exactly once;
/// whichever terminal state is reached first wins and callbacks fire once.
pub struct DownloadHandle {
    id: HandleId,
    episode: EpisodeRecord,
    engine: Arc<dyn DownloadEngine>,
    reporter: SharedProgressReporter,
    settings: HandleSettings,
    state: Mutex<HandleState>,
    job: Mutex<Option<TransferJob>>,
    progress_tx: Mutex<Option<watch::Sender<TransferProgress>>>,
    progress_rx: watch::Receiver<TransferProgress>,
    callbacks: Mutex<Vec<Arc<dyn TransferCallback>>>,
    cancel: CancellationToken,
}

impl DownloadHandle {
    pub fn new(
        id: HandleId,
        job: TransferJob,
        engine: Arc<dyn DownloadEngine>,
        reporter: SharedProgressReporter,
        settings: HandleSettings,
    ) -> Arc<Self> {
        let (progress_tx, progress_rx) = watch::channel(TransferProgress {
            bytes_downloaded: job.resume_from,
            total_bytes: None,
        });

        Arc::new(Self {
            id,
            episode: job.episode.clone(),
            engine,
            reporter,
            settings,
            state: Mutex::new(HandleState::Created),
            job: Mutex::new(Some(job)),
            progress_tx: Mutex::new(Some(progress_tx)),
            progress_rx,
            callbacks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn episode(&self) -> &EpisodeRecord {
        &self.episode
    }

    pub fn state(&self) -> HandleState {
        *lock(&self.state)
    }

    /// Latest progress reported by the engine
    pub fn progress(&self) -> TransferProgress {
        *self.progress_rx.borrow()
    }

    pub fn add_callback(&self, callback: Arc<dyn TransferCallback>) {
        lock(&self.callbacks).push(callback);
    }

    /// Launch the transfer on the runtime. Fails if already started.
    pub fn start(self: &Arc<Self>) -> Result<(), DownloadError> {
        {
            let mut state = lock(&self.state);
            if *state != HandleState::Created {
                return Err(DownloadError::AlreadyStarted);
            }
            *state = HandleState::Started;
        }

        let job = lock(&self.job).take();
        let tx = lock(&self.progress_tx).take();
        let (Some(job), Some(tx)) = (job, tx) else {
            return Err(DownloadError::AlreadyStarted);
        };

        tracing::info!(handle = %self.id, episode = %self.episode.id, "Starting transfer");

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = this.drive(job, tx).await;
            this.finish(outcome);
        });
        Ok(())
    }

    /// Request cancellation. Idempotent; returns true only for the call that
    /// actually requested it.
    pub fn abort(&self) -> bool {
        let state = lock(&self.state);
        if state.is_terminal() || self.cancel.is_cancelled() {
            return false;
        }
        self.cancel.cancel();
        tracing::info!(handle = %self.id, episode = %self.episode.id, "Transfer cancel requested");
        true
    }

    async fn drive(
        &self,
        job: TransferJob,
        tx: watch::Sender<TransferProgress>,
    ) -> Result<TransferReport, DownloadError> {
        let sink = ProgressSink::new(
            self.episode.id.clone(),
            tx,
            self.reporter.clone(),
            self.settings.progress_interval,
        );

        let engine = Arc::clone(&self.engine);
        let cancel = self.cancel.clone();
        let mut task = tokio::spawn(async move { engine.transfer(job, sink, cancel).await });

        let stall = self.settings.stall_timeout;
        tokio::select! {
            joined = &mut task => flatten(joined),
            () = stall_watchdog(self.progress_rx.clone(), stall) => {
                tracing::warn!(handle = %self.id, episode = %self.episode.id, "Transfer stalled");
                self.cancel.cancel();
                wind_down(task).await;
                Err(DownloadError::Stalled { seconds: stall.as_secs() })
            }
            () = self.cancel.cancelled() => {
                match tokio::time::timeout(CANCEL_GRACE, &mut task).await {
                    Ok(joined) => flatten(joined),
                    Err(_) => {
                        wind_down(task).await;
                        Err(DownloadError::Cancelled)
                    }
                }
            }
        }
    }

    fn finish(&self, outcome: Result<TransferReport, DownloadError>) {
        {
            let mut state = lock(&self.state);
            if state.is_terminal() {
                return;
            }
            *state = match outcome {
                Ok(_) => HandleState::Completed,
                Err(_) => HandleState::Interrupted,
            };
        }

        let callbacks = lock(&self.callbacks).clone();
        match &outcome {
            Ok(report) => {
                tracing::info!(
                    handle = %self.id,
                    episode = %self.episode.id,
                    bytes = report.bytes_downloaded,
                    "Transfer completed"
                );
                for callback in &callbacks {
                    callback.download_completed(self.id, &self.episode, report);
                }
            }
            Err(error) => {
                tracing::info!(
                    handle = %self.id,
                    episode = %self.episode.id,
                    error = %error,
                    "Transfer interrupted"
                );
                for callback in &callbacks {
                    callback.download_interrupted(self.id, &self.episode, error);
                }
            }
        }
    }
}

impl fmt::Debug for DownloadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadHandle")
            .field("id", &self.id)
            .field("episode", &self.episode.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Resolves once the progress channel stays quiet for `limit`.
/// Never resolves after the engine dropped its sink.
async fn stall_watchdog(mut rx: watch::Receiver<TransferProgress>, limit: Duration) {
    loop {
        match tokio::time::timeout(limit, rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => std::future::pending::<()>().await,
            Err(_) => return,
        }
    }
}

async fn wind_down(task: JoinHandle<Result<TransferReport, DownloadError>>) {
    task.abort();
    let _ = task.await;
}

fn flatten(
    joined: Result<Result<TransferReport, DownloadError>, JoinError>,
) -> Result<TransferReport, DownloadError> {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => Err(DownloadError::EngineCrashed {
            message: panic_message(e),
        }),
        Err(_) => Err(DownloadError::Cancelled),
    }
}

fn panic_message(error: JoinError) -> String {
    let payload = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "engine panicked".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopReporter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::sync::mpsc;
    use url::Url;

    #[derive(Debug)]
    enum Fired {
        Completed(u64),
        Interrupted(String),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Fired>,
        calls: AtomicUsize,
    }

    impl TransferCallback for Recorder {
        fn download_completed(&self, _h: HandleId, _e: &EpisodeRecord, report: &TransferReport) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.send(Fired::Completed(report.bytes_downloaded));
        }

        fn download_interrupted(&self, _h: HandleId, _e: &EpisodeRecord, error: &DownloadError) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.tx.send(Fired::Interrupted(error.to_string()));
        }
    }

    enum Behaviour {
        Succeed,
        WaitForCancel,
        Silent,
        Panic,
    }

    struct FakeEngine(Behaviour);

    #[async_trait]
    impl DownloadEngine for FakeEngine {
        async fn transfer(
            &self,
            job: TransferJob,
            mut progress: ProgressSink,
            cancel: CancellationToken,
        ) -> Result<TransferReport, DownloadError> {
            match self.0 {
                Behaviour::Succeed => {
                    progress.update(3, Some(3));
                    std::fs::write(&job.destination, b"abc").unwrap();
                    Ok(TransferReport {
                        bytes_downloaded: 3,
                        file_size: 3,
                        resumed_from: 0,
                        content_type: None,
                    })
                }
                Behaviour::WaitForCancel => {
                    progress.update(1, None);
                    cancel.cancelled().await;
                    Err(DownloadError::Cancelled)
                }
                Behaviour::Silent => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Behaviour::Panic => panic!("decoder exploded"),
            }
        }
    }

    fn make_handle(
        dir: &tempfile::TempDir,
        behaviour: Behaviour,
        settings: HandleSettings,
    ) -> (Arc<DownloadHandle>, Arc<Recorder>, mpsc::UnboundedReceiver<Fired>) {
        let episode = EpisodeRecord::new("ep", "Episode", "https://example.com/a.mp3");
        let job = TransferJob {
            url: Url::parse(&episode.url).unwrap(),
            partial_path: dir.path().join("a.mp3.partial"),
            destination: dir.path().join("a.mp3"),
            resume_from: 0,
            episode,
        };
        let handle = DownloadHandle::new(
            HandleId(1),
            job,
            Arc::new(FakeEngine(behaviour)),
            NoopReporter::shared(),
            settings,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = Arc::new(Recorder {
            tx,
            calls: AtomicUsize::new(0),
        });
        handle.add_callback(recorder.clone());
        (handle, recorder, rx)
    }

    #[tokio::test]
    async fn completion_fires_once() {
        let dir = tempdir().unwrap();
        let (handle, recorder, mut rx) = make_handle(&dir, Behaviour::Succeed, HandleSettings::default());

        handle.start().unwrap();
        assert!(matches!(rx.recv().await, Some(Fired::Completed(3))));
        assert_eq!(handle.state(), HandleState::Completed);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.progress().bytes_downloaded, 3);

        // Aborting a finished handle is a no-op
        assert!(!handle.abort());
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let dir = tempdir().unwrap();
        let (handle, _recorder, _rx) = make_handle(&dir, Behaviour::WaitForCancel, HandleSettings::default());

        handle.start().unwrap();
        assert!(matches!(handle.start(), Err(DownloadError::AlreadyStarted)));
        handle.abort();
    }

    #[tokio::test]
    async fn abort_is_idempotent() {
        let dir = tempdir().unwrap();
        let (handle, recorder, mut rx) = make_handle(&dir, Behaviour::WaitForCancel, HandleSettings::default());

        handle.start().unwrap();
        assert!(handle.abort());
        assert!(!handle.abort());

        match rx.recv().await {
            Some(Fired::Interrupted(message)) => assert!(message.contains("cancelled")),
            other => panic!("Expected interruption, got {other:?}"),
        }
        assert_eq!(handle.state(), HandleState::Interrupted);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn silent_engine_is_interrupted_by_watchdog() {
        let dir = tempdir().unwrap();
        let settings = HandleSettings {
            stall_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (handle, _recorder, mut rx) = make_handle(&dir, Behaviour::Silent, settings);

        handle.start().unwrap();
        match rx.recv().await {
            Some(Fired::Interrupted(message)) => assert!(message.contains("stalled")),
            other => panic!("Expected stall, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_engine_reports_crash() {
        let dir = tempdir().unwrap();
        let (handle, _recorder, mut rx) = make_handle(&dir, Behaviour::Panic, HandleSettings::default());

        handle.start().unwrap();
        match rx.recv().await {
            Some(Fired::Interrupted(message)) => assert!(message.contains("decoder exploded")),
            other => panic!("Expected crash, got {other:?}"),
        }
    }
}
