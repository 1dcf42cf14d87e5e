//! tracker-sync: operator CLI for the local sync state
//!
//! Inspects and maintains the on-device store for one scope:
//! - `show <collection>`: print what the store holds
//! - `sync`: pull every collection from the backend and persist it
//! - `reset`: run any due daily/weekly reset now
//! - `clear`: wipe the local store

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::info;

use tracker_sync::cache::QueryKey;
use tracker_sync::model::{Collection, Scope};
use tracker_sync::store;
use tracker_sync::{Config, SyncContext, SyncEngine};

#[derive(Parser)]
#[command(name = "tracker-sync")]
#[command(about = "Offline-first sync engine for the tracker app")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "tracker-sync.toml")]
    config: String,

    /// Data directory (overrides config file)
    #[arg(short, long, env = "TRACKER_DATA_DIR")]
    data_dir: Option<String>,

    /// Scope to operate on
    #[arg(short, long, env = "TRACKER_SCOPE")]
    scope: String,

    /// Backend base URL (overrides config file)
    #[arg(long, env = "TRACKER_REMOTE_URL")]
    remote_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a collection as stored locally
    Show {
        /// tasks, rules, rewards, punishments, history or points
        collection: String,
    },
    /// Pull every collection from the backend and persist it
    Sync,
    /// Run any due daily/weekly reset
    Reset,
    /// Wipe the local store
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tracker_sync=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = if std::path::Path::new(&cli.config).exists() {
        Config::load(std::path::Path::new(&cli.config))?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    if let Some(data_dir) = cli.data_dir {
        config.store.data_dir = PathBuf::from(data_dir);
    }
    if let Some(url) = cli.remote_url {
        config.remote.base_url = Some(url);
    }
    info!("Data dir: {}", config.store.data_dir.display());

    let engine = SyncEngine::new(SyncContext::open(config)?);
    let scope = Scope::new(cli.scope);

    match cli.command {
        Command::Show { collection } => {
            let collection: Collection = collection.parse()?;
            let key = QueryKey::new(collection, scope);
            match store::load_value(engine.context().store.as_ref(), &key.store_key()) {
                Some(value) => {
                    let records = value.to_records()?;
                    println!("{}", serde_json::to_string_pretty(&records)?);
                }
                None => println!("{} has never been stored", key),
            }
        }
        Command::Sync => {
            engine.sign_in(scope).await?;
            let report = engine.sync().await?;
            println!(
                "synced: {} applied, {} deferred, {} failed",
                report.applied, report.deferred, report.failed
            );
        }
        Command::Reset => {
            let reports = engine.sign_in(scope).await?;
            if reports.is_empty() {
                println!("no reset due");
            }
            for report in reports {
                println!(
                    "{} reset for {}: {} entities, remote {}",
                    report.kind,
                    report.period,
                    report.entities_reset,
                    if report.remote_confirmed { "confirmed" } else { "pending" }
                );
            }
        }
        Command::Clear => {
            engine.sign_out().await?;
            println!("local store cleared");
        }
    }

    Ok(())
}
