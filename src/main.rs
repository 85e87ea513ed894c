mod blossom;
mod config;
mod error;
mod event;
mod filter;
mod policy;
mod relay;
mod server;
mod storage;
mod subs;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use rand::{seq::SliceRandom, thread_rng};

use blossom::BlobStore;
use config::Settings;
use policy::Policy;
use relay::Relay;
use storage::Store;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "castr",
    author,
    version,
    about = "SQLite-backed Nostr relay with a Blossom blob store"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the database schema and the blob directory.
    Init,
    /// Ingest one or more event files through the write path.
    Ingest {
        /// Paths to JSON event files to ingest.
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Launch the WebSocket and HTTP services.
    Serve,
    /// Verify signatures for a random sample of stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
}

fn build_relay(store: Store, cfg: &Settings, blobs: &BlobStore) -> Relay {
    let relay = Relay::new(
        store,
        Policy::new(cfg.verify_sig, cfg.allow_list.clone()),
        cfg.allowed_kinds.clone(),
    );
    if cfg.fetch_blobs {
        relay.with_blob_fetch(blobs.clone())
    } else {
        relay
    }
}

/// Verify signatures for a random sample of stored events.
fn verify_sample(store: &Store, sample: usize) -> anyhow::Result<usize> {
    let mut ids = store.all_ids()?;
    ids.shuffle(&mut thread_rng());
    let take = sample.min(ids.len());
    for id in ids.iter().take(take) {
        let ev = store
            .get(id)?
            .ok_or_else(|| anyhow!("missing event {id}"))?;
        policy::verify_event(&ev)?;
    }
    Ok(take)
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::open(&cfg.db_path)?;
    let blobs = BlobStore::new(cfg.blossom_dir.clone());
    match cli.command {
        Commands::Init => {
            store.init()?;
            blobs.init()?;
        }
        Commands::Ingest { files } => {
            store.init()?;
            let relay = build_relay(store, &cfg, &blobs);
            for f in files {
                let data = std::fs::read_to_string(&f)?;
                let val: serde_json::Value = serde_json::from_str(&data)?;
                let ev = event::Event::from_value(&val)?;
                relay.publish(&ev).await?;
            }
        }
        Commands::Serve => {
            store.init()?;
            blobs.init()?;
            let http_addr: SocketAddr = cfg.bind_http.parse()?;
            let ws_addr: SocketAddr = cfg.bind_ws.parse()?;
            let relay = Arc::new(build_relay(store, &cfg, &blobs));
            tokio::try_join!(
                server::serve_http(
                    http_addr,
                    relay.clone(),
                    blobs.clone(),
                    std::future::pending()
                ),
                ws::serve_ws(ws_addr, relay, std::future::pending())
            )?;
        }
        Commands::Verify { sample } => {
            verify_sample(&store, sample)?;
        }
    }
    Ok(())
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
    let cli = Cli::parse();
    run(cli).await
}
