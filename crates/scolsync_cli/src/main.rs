//! scolsync site runner.
//!
//! One process per device: opens the local store, serves the LAN hub and
//! mDNS discovery, and syncs with the cloud on a timer. Secrets and the
//! cloud URL come from the environment, never from code.
//!
//! # Commands
//!
//! - `activate` - Link this device to a tenant via a license key
//! - `sync` - Run one push/pull cycle
//! - `serve` - Run the LAN hub, discovery, and periodic sync
//! - `history` - Show recent sync cycles

mod http;

use clap::{Parser, Subcommand};
use http::HttpTransport;
use scolsync_engine::{EngineConfig, SyncEngine};
use scolsync_hub::{ChangeEvent, Discovery, DiscoveryConfig, Hub, HubConfig};
use scolsync_store::LocalStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// scolsync device runner.
#[derive(Parser)]
#[command(name = "scolsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the device database
    #[arg(global = true, long, default_value = "scolsync.db")]
    db: PathBuf,

    /// Cloud base URL
    #[arg(global = true, long, env = "SCOLSYNC_CLOUD_URL")]
    cloud_url: Option<String>,

    /// Device fingerprint; defaults to the host name
    #[arg(global = true, long, env = "SCOLSYNC_HWID")]
    hwid: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Link this device to a tenant via a license key
    Activate {
        /// The license key
        key: String,

        /// Tenant setup password (set on first activation)
        #[arg(long)]
        password: Option<String>,
    },

    /// Run one push/pull cycle
    Sync,

    /// Run the LAN hub, discovery, and periodic sync
    Serve {
        /// Instance name advertised on the LAN
        #[arg(long)]
        name: Option<String>,

        /// Directory holding the bundled browser UI
        #[arg(long)]
        web_dir: Option<PathBuf>,

        /// Staging directory for incoming transfers
        #[arg(long, default_value = "transfers")]
        staging_dir: PathBuf,

        /// Seconds between automatic sync cycles (0 disables)
        #[arg(long, default_value_t = 300)]
        sync_interval: u64,
    },

    /// Show recent sync cycles
    History {
        /// Number of entries
        #[arg(short, long, default_value_t = 10)]
        limit: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = Arc::new(LocalStore::open(&cli.db)?);
    let hwid = cli.hwid.clone().unwrap_or_else(default_hwid);
    let cloud_url = cli.cloud_url.clone();

    match cli.command {
        Commands::Activate { key, password } => {
            let engine = build_engine(cloud_url, hwid, Arc::clone(&store))?;
            engine.activate(&key, password.as_deref())?;
            println!("Device activated.");
        }
        Commands::Sync => {
            let engine = build_engine(cloud_url, hwid, Arc::clone(&store))?;
            let result = engine.sync_cycle()?;
            println!(
                "Cycle done: {} pushed, {} pulled, {} rejected in {:?}",
                result.pushed, result.pulled, result.rejected, result.duration
            );
        }
        Commands::Serve {
            name,
            web_dir,
            staging_dir,
            sync_interval,
        } => {
            let engine = cloud_url
                .map(|url| build_engine(Some(url), hwid.clone(), Arc::clone(&store)))
                .transpose()?;
            serve(store, engine, name, web_dir, staging_dir, sync_interval)?;
        }
        Commands::History { limit } => {
            for entry in store.recent_sync_history(limit)? {
                let detail = entry.error_message.unwrap_or(entry.records_synced);
                println!(
                    "{}  {:<10} {:<8} {:>6}ms  {}",
                    entry.created_at, entry.kind, entry.status, entry.duration_ms, detail
                );
            }
        }
    }

    Ok(())
}

fn build_engine(
    cloud_url: Option<String>,
    hwid: String,
    store: Arc<LocalStore>,
) -> Result<Arc<SyncEngine<HttpTransport>>, Box<dyn std::error::Error>> {
    let cloud_url = cloud_url.ok_or("SCOLSYNC_CLOUD_URL is not set")?;
    let transport = HttpTransport::new(cloud_url.clone())?;
    let config = EngineConfig::new(hwid, cloud_url);
    Ok(Arc::new(SyncEngine::new(config, store, transport)))
}

fn default_hwid() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-device".to_string())
}

fn serve(
    store: Arc<LocalStore>,
    engine: Option<Arc<SyncEngine<HttpTransport>>>,
    name: Option<String>,
    web_dir: Option<PathBuf>,
    staging_dir: PathBuf,
    sync_interval: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let mut hub_config = HubConfig::new(staging_dir);
        if let Some(dir) = web_dir {
            hub_config = hub_config.with_web_dir(dir);
        }

        let handle = Hub::new(hub_config).start(Arc::clone(&store)).await?;
        println!("Hub listening on port {}", handle.port());

        let instance = name.unwrap_or_else(default_hwid);
        let discovery = Discovery::start(DiscoveryConfig::new(instance, handle.port()))?;

        // Forward peer-set changes to browser subscribers.
        let mut peers_rx = discovery.peers();
        let events = Arc::clone(handle.events());
        let peer_task = tokio::spawn(async move {
            while peers_rx.changed().await.is_ok() {
                let peers = peers_rx.borrow_and_update().clone();
                events.broadcast(&ChangeEvent {
                    event: "peers:updated".into(),
                    sender_id: None,
                    data: serde_json::json!(peers),
                });
            }
        });

        // Periodic cloud sync, when a cloud is configured.
        let sync_task = engine.filter(|_| sync_interval > 0).map(|engine| {
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(sync_interval));
                ticker.tick().await; // immediate first cycle
                loop {
                    let engine = Arc::clone(&engine);
                    let outcome =
                        tokio::task::spawn_blocking(move || engine.sync_cycle()).await;
                    if let Ok(Err(e)) = outcome {
                        tracing::warn!(error = %e, "periodic sync failed");
                    }
                    ticker.tick().await;
                }
            })
        });

        tokio::signal::ctrl_c().await?;
        println!("Shutting down...");

        if let Some(task) = sync_task {
            task.abort();
        }
        peer_task.abort();
        discovery.stop();
        handle.stop().await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}
