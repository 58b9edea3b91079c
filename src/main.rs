//! # driftwatch CLI
//!
//! Operator interface for the fleet inventory engine.
//!
//! ## Usage
//!
//! ```bash
//! driftwatch --config ./config/driftwatch.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `driftwatch init` | Clone, pull or create the data directory |
//! | `driftwatch run` | Run the duty cycle until Ctrl-C |
//! | `driftwatch discover <kind>` | One discovery pass (`all`, `apps`, `sites`, `services`), then commit |
//! | `driftwatch commit` | Commit and push pending changes |
//! | `driftwatch status` | Duty state and pending changes |
//! | `driftwatch paths` | Configured search paths and share reachability |
//! | `driftwatch identity <file>` | Print a binary's identity as JSON |
//!
//! Logs are written to stderr; `RUST_LOG` overrides `[logging].filter`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use driftwatch::catalog::Catalog;
use driftwatch::config::{self, Config};
use driftwatch::discovery::Discovery;
use driftwatch::identity;
use driftwatch::logging;
use driftwatch::schedule::Schedule;
use driftwatch::scheduler::Scheduler;
use driftwatch::store::{ChangeKind, PushOutcome, SnapshotStore};

/// driftwatch: fleet inventory and configuration-drift engine.
///
/// All commands except `identity` read a TOML configuration file. A missing
/// file means built-in defaults.
#[derive(Parser)]
#[command(
    name = "driftwatch",
    about = "Fleet inventory and configuration-drift engine",
    version,
    long_about = "driftwatch scans application shares on a fleet of hosts, links each \
    application to the site or service hosting it and the connections it uses, and records \
    the result in a git repository so that its history is the deployment history of the fleet."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/driftwatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the data directory.
    ///
    /// Clones the configured remote, pulls an existing working copy, or
    /// creates a local repository when no remote is configured. The default
    /// data directory is written back to the configuration file.
    Init,

    /// Run the scheduler until interrupted.
    Run,

    /// Run one discovery pass and commit the result.
    Discover {
        /// What to discover.
        #[arg(value_enum, default_value = "all")]
        kind: DiscoverKind,

        /// Leave changes uncommitted in the data directory.
        #[arg(long)]
        no_commit: bool,
    },

    /// Commit pending changes one path at a time, then push.
    Commit,

    /// Show the duty state and pending changes.
    Status,

    /// List configured search paths and whether their shares are reachable.
    Paths,

    /// Print the identity of a binary as JSON.
    Identity {
        /// Path to a `.dll` or `.exe`.
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DiscoverKind {
    All,
    Apps,
    Sites,
    Services,
}

/// Load the configuration file, or defaults when it does not exist.
fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        config::load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Needs no configuration
        Commands::Identity { file } => {
            logging::init(&Config::minimal().logging);
            let identity = identity::read_identity(&file)?;
            println!("{}", serde_json::to_string_pretty(&identity)?);
            Ok(())
        }
        command => run_command(&cli.config, command).await,
    }
}

async fn run_command(config_path: &Path, command: Commands) -> Result<()> {
    let config_existed = config_path.exists();
    let mut cfg = load_or_default(config_path)?;
    logging::init(&cfg.logging);
    if !config_existed {
        warn!(config = %config_path.display(), "Configuration file not found, using defaults");
    }
    let data_dir = config::resolve_data_dir(config_path, &mut cfg)?;

    match command {
        Commands::Init => {
            let store = SnapshotStore::from_config(&cfg.store, &data_dir);
            tokio::task::spawn_blocking(move || store.ensure_initialized())
                .await
                .context("init task failed")??;
            println!("Data directory ready: {}", data_dir.display());
        }
        Commands::Run => {
            let scheduler = Arc::new(Scheduler::from_config(&cfg, &data_dir)?);
            scheduler.init().await?;

            let runner = tokio::spawn({
                let scheduler = scheduler.clone();
                async move { scheduler.run().await }
            });
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            info!("Interrupt received, stopping");
            scheduler.stop().await;
            runner.await.context("scheduler task failed")??;
        }
        Commands::Discover { kind, no_commit } => {
            let store = Arc::new(SnapshotStore::from_config(&cfg.store, &data_dir));
            if !no_commit {
                let store = store.clone();
                tokio::task::spawn_blocking(move || store.ensure_initialized())
                    .await
                    .context("init task failed")??;
            }

            let discovery = Discovery::from_config(&cfg.discovery, &data_dir);
            let report = match kind {
                DiscoverKind::All => discovery.discover_all().await?,
                DiscoverKind::Apps => discovery.discover_apps().await?,
                DiscoverKind::Sites => discovery.discover_sites().await?,
                DiscoverKind::Services => discovery.discover_services().await?,
            };
            println!("Discovery: {}", report);

            if !no_commit {
                commit(store).await?;
            }
        }
        Commands::Commit => {
            commit(Arc::new(SnapshotStore::from_config(&cfg.store, &data_dir))).await?;
        }
        Commands::Status => {
            let schedule = Schedule::from_config(&cfg.schedule);
            let now = Utc::now();
            println!("Duty state: {:?}", schedule.state_at(now));
            println!("Next pause: {}m", schedule.pause_at(now).as_secs() / 60);
            println!("Data directory: {}", data_dir.display());
            println!("Remote: {}", cfg.store.remote.as_deref().unwrap_or("none"));

            if !data_dir.join(".git").exists() {
                println!("Pending changes: data directory not initialised (run `driftwatch init`)");
                return Ok(());
            }
            let store = SnapshotStore::from_config(&cfg.store, &data_dir);
            let pending = tokio::task::spawn_blocking(move || store.pending_changes())
                .await
                .context("status task failed")??;
            println!("Pending changes: {}", pending.len());
            for (kind, path) in pending.ordered() {
                let mark = match kind {
                    ChangeKind::Untracked => '+',
                    ChangeKind::Modified => '~',
                    ChangeKind::Missing => '-',
                };
                println!("  {} {}", mark, path);
            }
        }
        Commands::Paths => {
            let catalog = Catalog::new(&data_dir);
            let search_paths = catalog.search_paths()?;
            if search_paths.is_empty() {
                println!("No search paths configured.");
                return Ok(());
            }
            for sp in search_paths {
                let state = if Path::new(&sp.share).is_dir() {
                    "ok"
                } else {
                    "unreachable"
                };
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    sp.host, sp.environment, sp.role, sp.share, state
                );
            }
        }
        Commands::Identity { .. } => {}
    }

    Ok(())
}

async fn commit(store: Arc<SnapshotStore>) -> Result<()> {
    let summary = tokio::task::spawn_blocking(move || store.commit_pending_changes())
        .await
        .context("commit task failed")??;
    if summary.messages.is_empty() {
        println!("No changes to commit.");
    }
    for message in &summary.messages {
        println!("Committed: {}", message);
    }
    match summary.push {
        PushOutcome::NoRemote | PushOutcome::NothingToPush => {}
        PushOutcome::Pushed => println!("Pushed."),
        PushOutcome::Rejected => {
            println!("Push rejected: remote has diverged; commits kept until the next pull.")
        }
    }
    Ok(())
}
