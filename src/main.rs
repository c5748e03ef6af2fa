//! gonk-netd - Network command orchestrator
//!
//! Drives the orchestrator against the simulated controller: replay a script of
//! command dictionaries, list the supported commands or show the configuration.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gonk_netd::{NetworkCommand, NetworkConfig, NetworkResultOptions, NetworkWorker, Platform, SimulatedNetd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gonk-netd")]
#[command(about = "Network command orchestrator - tethering, routing and network ids over netd", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Dump request parameters
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a JSON array of command dictionaries and print every result
    Run {
        /// Script file
        #[arg(short, long, value_name = "FILE")]
        script: PathBuf,

        /// Interfaces present on the simulated device
        #[arg(short, long, value_delimiter = ',', default_value = "wlan0,rmnet0,rmnet1,rndis0")]
        interfaces: Vec<String>,

        /// Give up waiting for a result after this long (ms)
        #[arg(short, long, default_value = "5000")]
        timeout_ms: u64,
    },

    /// List supported command names
    Commands,

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = cli.config {
        log::info!("Loading config from: {}", config_path.display());
        NetworkConfig::from_file(&config_path)?
    } else {
        NetworkConfig::default()
    };

    // Override with CLI options
    if cli.debug {
        config.debug = true;
    }

    match cli.command {
        Commands::Run { script, interfaces, timeout_ms } => {
            run_script(config, &script, &interfaces, Duration::from_millis(timeout_ms))?;
        }

        Commands::Commands => {
            for cmd in NetworkCommand::ALL {
                println!("{}", cmd);
            }
        }

        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn run_script(config: NetworkConfig, script: &Path, interfaces: &[String], timeout: Duration) -> Result<()> {
    let content = std::fs::read_to_string(script)
        .with_context(|| format!("reading script {}", script.display()))?;
    let requests: Vec<serde_json::Value> =
        serde_json::from_str(&content).with_context(|| format!("parsing script {}", script.display()))?;

    let names: Vec<&str> = interfaces.iter().map(String::as_str).collect();
    let backend = Arc::new(SimulatedNetd::new().with_interfaces(&names));
    let worker = NetworkWorker::new(Platform::from_backend(backend.clone()), config)?;
    backend.attach_events(worker.event_sink());

    let answered = Arc::new(AtomicUsize::new(0));
    let counter = answered.clone();
    worker.start(Arc::new(move |result: &NetworkResultOptions| {
        if !result.broadcast {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        match serde_json::to_string(result) {
            Ok(line) => println!("{}", line),
            Err(e) => log::error!("Cannot encode result {}: {}", result.id, e),
        }
    }));

    let mut posted = 0;
    for request in requests {
        match worker.post_message(request) {
            Ok(()) => posted += 1,
            Err(e) => eprintln!("rejected: {}", e),
        }
    }

    while answered.load(Ordering::Relaxed) < posted {
        if !worker.dispatch_next(timeout) {
            log::warn!(
                "Timed out with {} of {} results",
                answered.load(Ordering::Relaxed),
                posted
            );
            break;
        }
    }
    worker.dispatch_pending();

    let stats = worker.get_stats();
    log::info!(
        "Chains: {} queued, {} completed, {} failed, {} rollbacks, {} ignored step failures",
        stats.orchestrator.chains_queued,
        stats.orchestrator.chains_completed,
        stats.orchestrator.chains_failed,
        stats.orchestrator.rollbacks,
        stats.orchestrator.ignored_failures
    );
    Ok(())
}
