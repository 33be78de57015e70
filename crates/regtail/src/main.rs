//! regtail command-line interface.
//!
//! ```bash
//! # Catch up with the registry, then follow it until Ctrl+C
//! regtail sync
//!
//! # Stop as soon as the backlog is drained
//! regtail sync --until-synchronized
//!
//! # Inspect the checkpoint without touching the network
//! regtail status --json
//! regtail packages
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use regtail_core::config::Config;
use regtail_core::events::SyncEvent;
use regtail_core::logging::{LogFormat, init_logging};
use regtail_core::registry::HttpRegistryClient;
use regtail_core::store::{ProgressSnapshot, ProgressStore, SqliteBackend};
use regtail_core::{SyncState, Synchronizer};

/// Replicate the npm registry change feed and track Koishi plugins.
#[derive(Parser, Debug)]
#[command(name = "regtail")]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to ./regtail.toml, then the user config dir)
    #[arg(long, global = true, env = "REGTAIL_CONFIG")]
    config: Option<PathBuf>,

    /// Progress database path
    #[arg(long, global = true, env = "REGTAIL_DB")]
    db: Option<PathBuf>,

    /// Replication endpoint base URL
    #[arg(long, global = true, env = "REGTAIL_ENDPOINT")]
    endpoint: Option<String>,

    /// Log level filter (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Catch up with the registry and follow new changes
    Sync {
        /// Exit once the backlog is drained instead of tailing
        #[arg(long)]
        until_synchronized: bool,

        /// Catch-up worker count
        #[arg(long)]
        concurrency: Option<usize>,

        /// Request ceiling per endpoint
        #[arg(long)]
        queries_per_second: Option<u32>,
    },

    /// Show the persisted checkpoint
    Status {
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },

    /// List plugin packages seen so far
    Packages {
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct StatusReport<'a> {
    db: &'a std::path::Path,
    #[serde(flatten)]
    snapshot: ProgressSnapshot,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

fn report(err: &anyhow::Error) {
    eprintln!("error: {err:#}");
    let remediation = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<regtail_core::Error>())
        .and_then(regtail_core::Error::remediation);
    if let Some(remediation) = remediation {
        eprint!("{}", remediation.render_plain());
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    if let Some(db) = &cli.db {
        config.storage.path.clone_from(db);
    }
    if let Some(endpoint) = &cli.endpoint {
        config.registry.endpoint.clone_from(endpoint);
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Command::Sync {
        concurrency,
        queries_per_second,
        ..
    } = &cli.command
    {
        if let Some(concurrency) = concurrency {
            config.registry.concurrency = *concurrency;
        }
        if let Some(qps) = queries_per_second {
            config.registry.queries_per_second = *qps;
        }
    }
    config.validate().map_err(regtail_core::Error::from)?;
    Ok(config)
}

fn open_store(config: &Config) -> Result<ProgressStore> {
    let backend = SqliteBackend::open(&config.storage.path)
        .map_err(regtail_core::Error::from)
        .with_context(|| format!("opening {}", config.storage.path.display()))?;
    let store = ProgressStore::open(backend, config.registry.completion_boundary)?;
    Ok(store)
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    init_logging(&config.logging).context("initializing logging")?;

    match cli.command {
        Command::Sync {
            until_synchronized, ..
        } => sync(&config, until_synchronized).await,
        Command::Status { json } => status(&config, json).await,
        Command::Packages { json } => packages(&config, json).await,
    }
}

async fn sync(config: &Config, until_synchronized: bool) -> Result<()> {
    let store = open_store(config)?;
    let client = HttpRegistryClient::new(config.http_client_config())
        .map_err(regtail_core::Error::from)?;
    info!(
        endpoint = client.endpoint(),
        db = %config.storage.path.display(),
        "starting sync"
    );

    let sync = Synchronizer::new(config.sync_config(), Arc::new(client), store);
    let mut events = sync.events().subscribe();
    let mut handle = sync.start();
    let mut state = handle.watch_state();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for Ctrl+C");
                }
                info!("interrupt received, stopping");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = state.borrow_and_update().clone();
                if current.is_terminal() {
                    break;
                }
                if until_synchronized && current == SyncState::Synchronized {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(SyncEvent::RelevantPackagesFetched { records }) => {
                    for record in records.iter() {
                        println!("{}\t{}", record.sequence, record.package_id);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event printer fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let final_state = handle.stop().await?;
    let status = handle.status().await?;
    info!(
        state = %final_state,
        low_water_mark = status.low_water_mark,
        known_packages = status.known_packages,
        "sync ended"
    );
    match final_state {
        SyncState::Failed { reason } => Err(anyhow::anyhow!(reason)).context("sync failed"),
        _ => Ok(()),
    }
}

async fn status(config: &Config, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let snapshot = store.snapshot().await?;
    if json {
        let report = StatusReport {
            db: &config.storage.path,
            snapshot,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("db:             {}", config.storage.path.display());
        println!("low_water_mark: {}", snapshot.low_water_mark);
        println!("known_packages: {}", snapshot.known_packages);
        println!(
            "blocks:         {} pending of {}",
            snapshot.blocks_pending, snapshot.blocks_total
        );
    }
    Ok(())
}

async fn packages(config: &Config, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let known = store.known_packages().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&known)?);
    } else {
        for (package, seq) in &known {
            println!("{seq}\t{package}");
        }
    }
    Ok(())
}
