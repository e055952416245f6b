// ABOUTME: Entry point for the strata binary.
// ABOUTME: Inspects a persisted strata store: entry counts, byte totals, and raw keys.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use strata_engine::BridgeConfig;
use strata_store::{SqliteHost, StoreRegistry};

#[derive(Parser, Debug)]
#[command(name = "strata", version, about = "Inspect strata persistent stores")]
struct Args {
    /// Data directory holding the store databases (overrides STRATA_HOME)
    #[arg(long, value_name = "DIR")]
    home: Option<PathBuf>,

    /// Store database name (overrides STRATA_STORE_NAME)
    #[arg(long)]
    store_name: Option<String>,

    /// Object store id inside the database (overrides STRATA_STORE_ID)
    #[arg(long)]
    store_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the number of entries and their byte totals
    Stats,
    /// List every key, hex encoded
    Keys,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("strata=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = BridgeConfig::from_env().context("invalid STRATA_* configuration")?;
    if let Some(home) = args.home {
        config.home = home;
    }
    if let Some(name) = args.store_name {
        config.store_name = name;
    }
    if let Some(id) = args.store_id {
        config.store_id = id;
    }

    tracing::debug!("inspecting store with {:?}", config);
    let host = SqliteHost::new(config.home.clone());
    let path = host.database_path(&config.store_name);
    if !path.exists() {
        bail!("no store database at {}", path.display());
    }

    let registry = StoreRegistry::new(Arc::new(host), config.write_ordering);
    let store = registry
        .open(&config.store_name, &config.store_id)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let (keys, values) = store.load_all().await.context("failed to read entries")?;

    match args.command {
        Command::Stats => {
            let key_bytes: usize = keys.iter().map(Vec::len).sum();
            let value_bytes: usize = values.iter().map(Vec::len).sum();
            println!("store:       {}/{}", config.store_name, config.store_id);
            println!("path:        {}", path.display());
            println!("entries:     {}", keys.len());
            println!("key bytes:   {}", key_bytes);
            println!("value bytes: {}", value_bytes);
        }
        Command::Keys => {
            for key in &keys {
                println!("{}", hex(key));
            }
        }
    }

    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{:02x}", b);
        out
    })
}
