mod pipeline;
mod timer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use flowpack_admission::Admission;
use flowpack_cache::opener::{IncrementalOpener, RepositoryOpener};
use flowpack_cache::{Cache, Opener};
use flowpack_config::{log_pack_info, logging::LogLevel, Config, InputMode, OutputMode};
use flowpack_dispose::DisposeConfig;
use flowpack_ingest::network::{NetworkIpfixSource, NetworkPduSource};
use flowpack_ingest::polldir::PollDirRespoolSource;
use flowpack_ingest::singlefile::SingleFilePduSource;
use flowpack_model::{ProbeKind, SourceBinding};
use flowpack_registry::Registry;

#[derive(Parser)]
#[command(name = "flowpackd")]
#[command(version, about = "Flow-record packing daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start {
        #[arg(long, env = "FLOWPACK_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Parse and validate configuration, then exit
    CheckConfig {
        #[arg(long, env = "FLOWPACK_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    flowpack_config::logging::init_logging(LogLevel::Info);

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Start { config: None }) {
        Commands::CheckConfig { config } => check_config(config.as_deref()),
        Commands::Start { config } => start(config.as_deref()).await,
    }
}

fn check_config(path: Option<&std::path::Path>) -> Result<()> {
    let config = Config::load(path)?;
    config.validate()?;
    println!("configuration OK");
    Ok(())
}

fn dispose_config(config: &Config) -> DisposeConfig {
    DisposeConfig {
        archive_dir: config.archive_directory.clone(),
        flat_archive: config.flat_archive,
        post_archive_command: config.post_archive_command.clone(),
        error_dir: config.error_directory.clone(),
    }
}

fn build_opener(config: &Config) -> Result<Arc<dyn Opener>> {
    const FILE_FORMAT_ID: u16 = 1;
    match config.output_mode {
        OutputMode::LocalStorage => {
            let root = config
                .root_directory
                .clone()
                .context("root-directory is required in local-storage output mode")?;
            Ok(Arc::new(RepositoryOpener::new(
                root,
                FILE_FORMAT_ID,
                !config.no_file_locking,
            )))
        }
        OutputMode::IncrementalFiles => {
            let dir = config
                .incremental_directory
                .clone()
                .context("incremental-directory is required in incremental-files output mode")?;
            Ok(Arc::new(IncrementalOpener::new(dir, FILE_FORMAT_ID)))
        }
        OutputMode::Sending => {
            // Sending mode stages the same placeholder+working pair as
            // incremental-files; only the Flush/Move Timer's resolution
            // step differs (move to sender-directory instead of rename).
            let dir = config
                .incremental_directory
                .clone()
                .context("incremental-directory is required in sending output mode")?;
            Ok(Arc::new(IncrementalOpener::new(dir, FILE_FORMAT_ID)))
        }
    }
}

/// Derive what the Flush/Move Timer (and the startup recovery sweep)
/// should do with closed files, from output mode. Mirrors `build_opener`'s
/// mode match so the two stay consistent.
fn flush_action(config: &Config) -> timer::FlushAction {
    match config.output_mode {
        OutputMode::LocalStorage => timer::FlushAction::Direct,
        OutputMode::IncrementalFiles => timer::FlushAction::IncrementalFiles,
        OutputMode::Sending => timer::FlushAction::Sending {
            sender_directory: config
                .sender_directory
                .clone()
                .expect("validated: sender-directory required in sending output mode"),
        },
    }
}

async fn start(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    config.validate()?;

    let registry = match &config.sensor_configuration {
        Some(path) => Arc::new(Registry::from_file(path)?),
        None => Arc::new(Registry::empty()),
    };

    let action = flush_action(&config);
    if matches!(
        config.output_mode,
        OutputMode::IncrementalFiles | OutputMode::Sending
    ) {
        if let Some(dir) = &config.incremental_directory {
            let recovered = timer::recover_incremental_directory(dir, &action)?;
            log_pack_info!("startup recovery complete", recovered = recovered);
        }
    }

    let strategy: Arc<dyn flowpack_classify::PackingLogic> =
        Arc::from(flowpack_classify::build_strategy(&config.packing_logic)?);
    let opener = build_opener(&config)?;
    let cache = Arc::new(Cache::new(
        config.file_cache_size,
        Duration::from_secs(config.flush_timeout_secs),
    ));
    let admission = Arc::new(Admission::new(config.file_cache_size));
    let dispose = dispose_config(&config);
    let shutdown = Arc::new(AtomicBool::new(false));
    let runtime = tokio::runtime::Handle::current();
    let polling_interval = Duration::from_secs(config.polling_interval_secs);

    let mut workers = Vec::new();
    match config.input_mode {
        InputMode::Respool => {
            let dir = config
                .respool_directory
                .clone()
                .context("respool-directory is required in respool input mode")?;
            let source = Box::new(PollDirRespoolSource::new(
                dir,
                polling_interval,
                dispose.clone(),
            ));
            workers.push(spawn_worker(
                "respool".to_string(),
                source,
                registry.clone(),
                cache.clone(),
                opener.clone(),
                strategy.clone(),
                admission.clone(),
                runtime.clone(),
                shutdown.clone(),
            ));
        }
        InputMode::FcFiles => {
            let dir = config
                .fcfiles_directory
                .clone()
                .context("fcfiles-directory is required in fcfiles input mode")?;
            let source = Box::new(flowpack_ingest::polldir::PollDirFcfilesSource::new(
                dir,
                polling_interval,
                dispose.clone(),
            ));
            workers.push(spawn_worker(
                "fcfiles".to_string(),
                source,
                registry.clone(),
                cache.clone(),
                opener.clone(),
                strategy.clone(),
                admission.clone(),
                runtime.clone(),
                shutdown.clone(),
            ));
        }
        InputMode::Stream | InputMode::PduFile => {
            for probe in registry.iter_probes() {
                let source: Box<dyn flowpack_ingest::IngestSource> = match (&probe.source, probe.kind) {
                    (SourceBinding::ListenAddr(addr), ProbeKind::NetflowV5) => {
                        let socket_addr = addr
                            .parse()
                            .with_context(|| format!("invalid listen-addr for probe {}", probe.name))?;
                        Box::new(NetworkPduSource::bind(socket_addr, probe.accept_from.clone())?)
                    }
                    (
                        SourceBinding::ListenAddr(addr),
                        ProbeKind::Ipfix | ProbeKind::NetflowV9 | ProbeKind::Sflow,
                    ) => {
                        let socket_addr = addr
                            .parse()
                            .with_context(|| format!("invalid listen-addr for probe {}", probe.name))?;
                        Box::new(NetworkIpfixSource::bind(socket_addr, probe.accept_from.clone())?)
                    }
                    (SourceBinding::SingleFile(path), _) => {
                        Box::new(SingleFilePduSource::new(path.clone()))
                    }
                    (SourceBinding::PollDirectory(dir), _) => {
                        // Per-probe polled directories (stream/pdufile
                        // modes) are always poll-dir-mixed; fcfiles is a
                        // single shared directory handled above, outside
                        // the per-probe loop.
                        Box::new(flowpack_ingest::polldir::PollDirMixedSource::new(
                            dir.clone(),
                            polling_interval,
                            dispose.clone(),
                        ))
                    }
                    _ => {
                        tracing::warn!(probe = %probe.name, "unsupported probe source/kind combination, skipping");
                        continue;
                    }
                };
                workers.push(spawn_worker(
                    probe.name.clone(),
                    source,
                    registry.clone(),
                    cache.clone(),
                    opener.clone(),
                    strategy.clone(),
                    admission.clone(),
                    runtime.clone(),
                    shutdown.clone(),
                ));
            }
        }
    }

    let timer_handle = {
        let cache = cache.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_secs(config.flush_timeout_secs.max(1));
        let action = action.clone();
        std::thread::spawn(move || timer::run_flush_timer(cache, interval, shutdown, action))
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("flowpackd: shutdown signal received");
    shutdown.store(true, Ordering::SeqCst);
    admission.shutdown();

    for worker in workers {
        if let Ok(outcome) = worker.await {
            log_pack_info!(
                "probe worker stopped",
                probe = %outcome.probe_name,
                total = outcome.stats.total,
                bad = outcome.stats.bad
            );
        }
    }
    let _ = timer_handle.join();

    let closed = cache.close_all();
    for file in &closed {
        if let Err(e) = timer::finalize_closed(&action, &file.filename) {
            tracing::warn!(
                file = %file.filename.display(),
                error = %e.to_string(),
                "failed to finalize closed file on shutdown"
            );
        }
    }
    log_pack_info!("flowpackd: shutdown complete", files_closed = closed.len());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn spawn_worker(
    probe_name: String,
    source: Box<dyn flowpack_ingest::IngestSource>,
    registry: Arc<Registry>,
    cache: Arc<Cache>,
    opener: Arc<dyn Opener>,
    strategy: Arc<dyn flowpack_classify::PackingLogic>,
    admission: Arc<Admission>,
    runtime: tokio::runtime::Handle,
    shutdown: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<pipeline::WorkerOutcome> {
    tokio::task::spawn_blocking(move || {
        pipeline::run_worker(
            probe_name, source, registry, cache, opener, strategy, admission, runtime, shutdown,
        )
    })
}
