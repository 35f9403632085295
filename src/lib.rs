pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod library;
pub mod network;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod reclaim;
pub mod storage;
pub mod telemetry;

// Re-export main types for convenience
pub use config::{DownloaderConfig, HttpConfig, Preferences, PreferencesProvider, SharedPreferences};
pub use engine::{
    DownloadEngine, DownloadHandle, EngineFactory, HandleState, HttpEngine, TransferJob,
    TransferProgress, TransferReport,
};
pub use error::{ConfigError, DownloadError, LibraryError, StorageError};
pub use http::{HttpClient, HttpResponse, ReqwestClient};
pub use library::{EpisodeId, EpisodeLibrary, EpisodeRecord, FileLibrary, MediaKind};
pub use network::{
    Action, ConnectionType, Connectivity, ConnectivityProvider, NetworkState, StaticConnectivity,
    SubscriptionPolicy,
};
pub use orchestrator::{DownloadOrchestrator, DownloadStatus, OrchestratorDeps, OrchestratorSettings};
pub use progress::{
    NoopReporter, ProgressEvent, ProgressReporter, QueueChangedEvent, SharedProgressReporter,
};
pub use queue::{QueueEntry, QueuePosition};
pub use reclaim::{ReclaimReport, StorageReclaimer};
pub use storage::Storage;
pub use telemetry::{ErrorReporter, LogErrorReporter, NoopErrorReporter, SharedErrorReporter};
