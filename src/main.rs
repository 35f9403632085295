use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use console::Emoji;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;
use url::Url;

use podqueue::{
    ConnectionType, Connectivity, DownloadOrchestrator, DownloaderConfig, EpisodeLibrary,
    EpisodeRecord, FileLibrary, HttpEngine, LogErrorReporter, NoopReporter, OrchestratorDeps,
    OrchestratorSettings, ProgressEvent, ProgressReporter, QueuePosition, ReqwestClient,
    SharedPreferences, SharedProgressReporter, StaticConnectivity, Storage, StorageReclaimer,
};

// Emoji with fallback for terminals without Unicode support
static HEADPHONES: Emoji<'_, '_> = Emoji("🎧 ", "");
static QUEUE: Emoji<'_, '_> = Emoji("📋 ", "[=] ");
static DOWNLOAD: Emoji<'_, '_> = Emoji("📥 ", "[v] ");
static SUCCESS: Emoji<'_, '_> = Emoji("✅ ", "[+] ");
static FAILURE: Emoji<'_, '_> = Emoji("❌ ", "[!] ");
static PAUSED: Emoji<'_, '_> = Emoji("⏸️  ", "[-] ");
static BROOM: Emoji<'_, '_> = Emoji("🧹 ", "[~] ");
static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");

/// Policy-gated podcast download queue
#[derive(Parser, Debug)]
#[command(name = "podqueue")]
#[command(about = "Queue podcast episodes and download them one at a time")]
#[command(version)]
struct Args {
    /// Episode library file
    #[arg(short, long, global = true, default_value = "podqueue.json")]
    library: PathBuf,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory for downloaded episodes (overrides the config)
    #[arg(short, long, global = true)]
    download_dir: Option<PathBuf>,

    /// Storage budget in megabytes (overrides the config)
    #[arg(long, global = true)]
    keep_mb: Option<u64>,

    /// Treat the current connection as cellular
    #[arg(long, global = true)]
    metered: bool,

    /// Restrict automatic downloads to unmetered connections
    #[arg(long, global = true)]
    wifi_only: bool,

    /// Quiet mode - suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register episodes by media URL
    Add {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Episode title (only with a single URL)
        #[arg(short, long)]
        title: Option<String>,
    },
    /// Download every episode that is not on disk yet
    Run,
    /// Show the download status of every episode
    Status,
    /// Enforce the storage budget once
    Reclaim,
}

/// Progress reporter using indicatif for terminal output
struct IndicatifReporter {
    multi: MultiProgress,
    main_bar: ProgressBar,
    bar: Mutex<Option<ProgressBar>>,
}

impl IndicatifReporter {
    fn new() -> Self {
        let multi = MultiProgress::new();

        let main_style = ProgressStyle::default_bar()
            .template("{spinner:.green} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());

        let main_bar = multi.add(ProgressBar::new_spinner());
        main_bar.set_style(main_style);
        main_bar.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            multi,
            main_bar,
            bar: Mutex::new(None),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        self.bar.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn new_bar(&self, title: &str, position: u64) -> ProgressBar {
        let style = ProgressStyle::default_bar()
            .template(&format!(
                "  {DOWNLOAD}[{{bar:30.cyan/blue}}] {{bytes}}/{{total_bytes}} {{wide_msg}}"
            ))
            .map(|style| style.progress_chars("█▓░"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bar.set_position(position);
        bar.set_message(truncate_title(title, 40));
        bar
    }

    fn take_bar(&self) -> Option<ProgressBar> {
        self.slot().take()
    }

    fn println(&self, line: String) {
        let _ = self.multi.println(line);
    }

    fn finish(&self) {
        self.main_bar.finish_and_clear();
    }
}

impl ProgressReporter for IndicatifReporter {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::QueueChanged(changed) => {
                self.main_bar.set_message(format!(
                    "{QUEUE}{} waiting",
                    changed.queue_size.to_string().cyan()
                ));
            }

            ProgressEvent::DownloadStarting {
                episode_title,
                resume_from,
                ..
            } => {
                let bar = self.new_bar(&episode_title, resume_from);
                if let Some(previous) = self.slot().replace(bar) {
                    previous.finish_and_clear();
                }
            }

            ProgressEvent::DownloadProgress {
                bytes_downloaded,
                total_bytes,
                ..
            } => {
                if let Some(bar) = self.slot().as_ref() {
                    if let Some(total) = total_bytes {
                        bar.set_length(total);
                    }
                    bar.set_position(bytes_downloaded);
                }
            }

            ProgressEvent::DownloadCompleted { episode_title, .. } => {
                if let Some(bar) = self.take_bar() {
                    bar.finish_and_clear();
                }
                self.println(format!(
                    "{SUCCESS}{}",
                    truncate_title(&episode_title, 60).green()
                ));
            }

            ProgressEvent::DownloadInterrupted {
                episode_title,
                resumable_offset,
                error,
                ..
            } => {
                let message = if resumable_offset > 0 {
                    format!(
                        "{FAILURE}{} - {} (resumable at {} bytes)",
                        truncate_title(&episode_title, 30).red(),
                        error.red(),
                        resumable_offset
                    )
                } else {
                    format!(
                        "{FAILURE}{} - {}",
                        truncate_title(&episode_title, 30).red(),
                        error.red()
                    )
                };
                match self.take_bar() {
                    Some(bar) => bar.abandon_with_message(message),
                    None => self.println(message),
                }
            }

            ProgressEvent::EntryDropped { episode_id, reason } => {
                self.println(format!(
                    "{FAILURE}{} skipped: {}",
                    episode_id.to_string().yellow(),
                    reason.dimmed()
                ));
            }

            ProgressEvent::StorageReclaimed {
                deleted_episodes,
                orphans_removed,
                ..
            } if deleted_episodes + orphans_removed > 0 => {
                self.println(format!(
                    "{BROOM}Reclaimed space: {} episodes, {} stray files",
                    deleted_episodes.to_string().yellow(),
                    orphans_removed.to_string().yellow()
                ));
            }

            ProgressEvent::StorageReclaimed { .. }
            | ProgressEvent::MediaAvailable { .. }
            | ProgressEvent::TmpCleanedUp { .. } => {}
        }
    }
}

fn truncate_title(title: &str, max_len: usize) -> String {
    if title.chars().count() <= max_len {
        title.to_string()
    } else {
        let cut: String = title.chars().take(max_len.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(args: &Args) -> Result<DownloaderConfig> {
    let mut config = match &args.config {
        Some(path) => DownloaderConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => DownloaderConfig::default(),
    };

    if let Some(dir) = &args.download_dir {
        config.download_dir = dir.clone();
    }
    if let Some(megabytes) = args.keep_mb {
        config.preferences.megabytes_to_keep = megabytes;
    }
    if args.wifi_only {
        config.preferences.wifi_only = true;
    }
    Ok(config)
}

/// Storage for `config` that never sweeps away the library or config file
fn storage_for(args: &Args, config: &DownloaderConfig) -> Storage {
    Storage::from_config(config)
        .with_protected(std::iter::once(args.library.clone()).chain(args.config.clone()))
}

fn open_library(path: &Path) -> Result<Arc<FileLibrary>> {
    let library = FileLibrary::open(path)
        .with_context(|| format!("Failed to open library {}", path.display()))?;
    Ok(Arc::new(library))
}

/// Last path segment of the URL without its extension
fn title_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.last())
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            segment
                .rsplit_once('.')
                .map_or(segment, |(stem, _)| stem)
                .to_string()
        })
        .unwrap_or_else(|| url.host_str().unwrap_or("episode").to_string())
}

fn add_episodes(args: &Args, urls: &[String], title: Option<&str>) -> Result<()> {
    if title.is_some() && urls.len() > 1 {
        bail!("--title can only be used with a single URL");
    }

    let library = open_library(&args.library)?;
    for raw in urls {
        let url = Url::parse(raw).with_context(|| format!("Invalid URL '{raw}'"))?;
        let title = title.map_or_else(|| title_from_url(&url), String::from);
        let record = EpisodeRecord::new(url.as_str(), title, url.as_str());

        if library.get_by_id(&record.id).is_some() {
            if !args.quiet {
                println!("  {} already in library", record.title.yellow());
            }
            continue;
        }

        let stored = library.insert(record).context("Failed to save library")?;
        if !args.quiet {
            println!(
                "{SUCCESS}{} {}",
                stored.title.green(),
                format!("-> {}", stored.file_name).dimmed()
            );
        }
    }
    Ok(())
}

async fn run_queue(args: &Args, config: DownloaderConfig) -> Result<()> {
    let library = open_library(&args.library)?;
    let storage = storage_for(args, &config);
    storage
        .ensure()
        .with_context(|| format!("Download directory {} is not writable", config.download_dir.display()))?;

    let client = ReqwestClient::from_config(&config.http).context("Failed to build HTTP client")?;
    let connection = if args.metered {
        ConnectionType::Mobile
    } else {
        ConnectionType::Ethernet
    };

    let indicatif = (!args.quiet).then(|| Arc::new(IndicatifReporter::new()));
    let reporter: SharedProgressReporter = match &indicatif {
        Some(reporter) => reporter.clone(),
        None => NoopReporter::shared(),
    };

    let orchestrator = DownloadOrchestrator::spawn(OrchestratorDeps {
        library: library.clone(),
        connectivity: Arc::new(StaticConnectivity::new(Connectivity::connected(connection))),
        preferences: Arc::new(SharedPreferences::new(config.preferences.clone())),
        engines: Arc::new(HttpEngine::new(client)),
        reporter,
        telemetry: LogErrorReporter::shared(),
        storage,
        settings: OrchestratorSettings::from_config(&config),
    });

    let wanted: Vec<EpisodeRecord> = library.episodes().into_iter().filter(|e| !e.downloaded).collect();
    if wanted.is_empty() {
        if !args.quiet {
            println!("{SUCCESS}Nothing to download");
        }
        return Ok(());
    }

    // Manual entries go to the front, so queue in reverse to keep library order
    for episode in wanted.iter().rev() {
        orchestrator.add_item_to_queue(&episode.id, QueuePosition::StartedManually);
    }

    let pending = tokio::select! {
        pending = orchestrator.wait_until_settled() => pending,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.shutdown();
            orchestrator.queue_size()
        }
    };

    if let Some(reporter) = &indicatif {
        reporter.finish();
    }

    let mut downloaded = 0;
    let mut interrupted = 0;
    for episode in &wanted {
        match library.get_by_id(&episode.id) {
            Some(e) if e.downloaded => downloaded += 1,
            _ => interrupted += 1,
        }
    }
    interrupted -= pending.min(interrupted);

    if !args.quiet {
        println!(
            "\n{HEADPHONES}{} {} downloaded, {} interrupted, {} waiting",
            "Queue settled:".bold().green(),
            downloaded.to_string().green().bold(),
            if interrupted > 0 {
                interrupted.to_string().red().bold()
            } else {
                interrupted.to_string().green()
            },
            pending.to_string().yellow()
        );
        println!(
            "\n{FOLDER}Output: {}\n",
            config.download_dir.display().to_string().cyan()
        );
    }

    if downloaded == 0 && interrupted > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn show_status(args: &Args, config: &DownloaderConfig) -> Result<()> {
    let library = open_library(&args.library)?;
    let storage = storage_for(args, config);
    let episodes = library.episodes();

    if episodes.is_empty() {
        println!("{QUEUE}Library is empty");
        return Ok(());
    }

    for episode in &episodes {
        let marker = if episode.downloaded {
            format!("{SUCCESS}")
        } else if episode.has_partial() {
            format!("{PAUSED}")
        } else {
            format!("{DOWNLOAD}")
        };

        let detail = if episode.downloaded {
            storage.destination_path(episode).display().to_string()
        } else if episode.has_partial() {
            format!("{} bytes so far", episode.offset)
        } else {
            "not downloaded".to_string()
        };

        println!("{marker}{}  {}", truncate_title(&episode.title, 50).bold(), detail.dimmed());
    }
    Ok(())
}

async fn reclaim_once(args: &Args, config: &DownloaderConfig) -> Result<()> {
    let library = open_library(&args.library)?;
    let reclaimer = StorageReclaimer::new(
        storage_for(args, config),
        library,
        Arc::new(SharedPreferences::new(config.preferences.clone())),
        NoopReporter::shared(),
    );

    match reclaimer.run(None).await {
        Some(report) => {
            if !args.quiet {
                println!(
                    "{BROOM}Kept {} files ({} bytes), evicted {} episodes, removed {} stray files",
                    report.kept.len().to_string().green(),
                    report.bytes_kept,
                    report.deleted_episodes.to_string().yellow(),
                    report.orphans_removed.to_string().yellow()
                );
            }
            Ok(())
        }
        None => bail!(
            "Reclaim skipped: {} is not available",
            config.download_dir.display()
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = load_config(&args)?;

    match &args.command {
        Command::Add { urls, title } => add_episodes(&args, urls, title.as_deref()),
        Command::Run => run_queue(&args, config).await,
        Command::Status => show_status(&args, &config),
        Command::Reclaim => reclaim_once(&args, &config).await,
    }
}
