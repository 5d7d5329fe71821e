mod lockset;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use flowpack_config::{logging::LogLevel, Config};
use flowpack_dispose::DisposeConfig;
use flowpack_ingest::poll::DirPoller;

use lockset::HourlyLockSet;
use worker::{byte_order_override, run_appender_worker, AppenderWorker};

#[derive(Parser)]
#[command(name = "flowappendd")]
#[command(version, about = "Hourly-file appender service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the appender service (default)
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

fn main() -> Result<()> {
    flowpack_config::logging::init_logging(LogLevel::Info);

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Start { config: None }) {
        Commands::CheckConfig { config } => check_config(config.as_deref()),
        Commands::Start { config } => start(config.as_deref()),
    }
}

fn check_config(path: Option<&std::path::Path>) -> Result<()> {
    let config = Config::load(path)?;
    config.validate()?;
    if config.root_directory.is_none() {
        anyhow::bail!("root-directory is required for the appender");
    }
    if config.incremental_directory.is_none() {
        anyhow::bail!("incremental-directory is required for the appender");
    }
    println!("configuration OK");
    Ok(())
}

fn start(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = Config::load(config_path)?;
    config.validate()?;

    let root_directory = config
        .root_directory
        .clone()
        .context("root-directory is required for the appender")?;
    let incremental_directory = config
        .incremental_directory
        .clone()
        .context("incremental-directory is required for the appender")?;

    let dispose = DisposeConfig {
        archive_dir: config.archive_directory.clone(),
        flat_archive: config.flat_archive,
        post_archive_command: config.post_archive_command.clone(),
        error_dir: config.error_directory.clone(),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    let poller = Arc::new(DirPoller::start(
        incremental_directory,
        Duration::from_secs(config.polling_interval_secs),
    ));
    let locks = Arc::new(HourlyLockSet::new());
    let byte_order_override = byte_order_override(config.byte_order);

    let mut handles = Vec::new();
    for n in 0..config.appender.threads.max(1) {
        let worker = AppenderWorker {
            poller: poller.clone(),
            locks: locks.clone(),
            root_directory: root_directory.clone(),
            dispose: dispose.clone(),
            appender: config.appender.clone(),
            byte_order_override,
            locking: !config.no_file_locking,
            shutdown: shutdown.clone(),
        };
        handles.push(std::thread::spawn(move || {
            let stats = run_appender_worker(&worker);
            tracing::info!(
                thread = n,
                merged = stats.merged,
                skipped = stats.skipped,
                errored = stats.errored,
                "appender worker stopped"
            );
        }));
    }

    wait_for_signal()?;
    tracing::info!("flowappendd: shutdown signal received");
    shutdown.store(true, Ordering::SeqCst);
    poller.request_stop();

    for handle in handles {
        let _ = handle.join();
    }
    tracing::info!("flowappendd: shutdown complete");
    Ok(())
}

/// Block the calling thread until SIGINT/SIGTERM. The appender's workers
/// are plain OS threads (§5), so shutdown waits on a signal flag rather
/// than pulling in an async runtime the rest of this binary has no use
/// for.
fn wait_for_signal() -> Result<()> {
    let triggered = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, triggered.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, triggered.clone())?;
    while !triggered.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}
