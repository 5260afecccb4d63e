use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use seedswarm::downloader::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_QUERIES, DownloadConfig, DownloadHandle, DownloadOutcome,
    Downloader,
};
use seedswarm::progress::ProgressTracker;
use seedswarm::server::{AppState, LocalCatalog, Server, ServerConfig};

const TRACING_ENV: &str = "SEEDSWARM_LOG";
const DEFAULT_PORTS: [u16; 5] = [8999, 9000, 9002, 9003, 9004];

#[derive(Parser)]
#[command(name = "seedswarm")]
#[command(about = "Share files with a fixed swarm of peers and download them from many at once")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StorageArgs {
    /// Storage root, laid out as <root>/<id>/<name>
    #[arg(long, default_value = "./files")]
    root: PathBuf,
}

#[derive(Args)]
struct FetchArgs {
    /// Bytes per chunk
    #[arg(long, default_value_t = NonZeroU64::new(DEFAULT_CHUNK_SIZE).unwrap_or(NonZeroU64::MIN))]
    chunk_size: NonZeroU64,
    /// Pause after every chunk, in milliseconds
    #[arg(long, default_value_t = 0)]
    chunk_delay_ms: u64,
    /// Seconds between status reports
    #[arg(long, default_value_t = 1)]
    status_interval: u64,
    /// Catalog queries in flight at once
    #[arg(long, default_value_t = DEFAULT_MAX_QUERIES)]
    max_queries: usize,
}

impl FetchArgs {
    fn config(&self) -> DownloadConfig {
        DownloadConfig {
            chunk_size: self.chunk_size,
            chunk_delay: Duration::from_millis(self.chunk_delay_ms),
            max_queries: self.max_queries,
        }
    }

    fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval.max(1))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the local catalog until interrupted
    Serve {
        #[command(flatten)]
        storage: StorageArgs,
        #[arg(long, default_value = "127.0.0.1", help = "Address to bind to")]
        address: String,
        #[arg(short, long, help = "Candidate ports, the first free one is used", default_values_t = DEFAULT_PORTS)]
        port: Vec<u16>,
        #[arg(long, default_value_t = ServerConfig::default().max_transfers, help = "Responses written at once")]
        max_transfers: usize,
    },
    /// List the files the swarm offers that are not stored locally
    List {
        #[command(flatten)]
        storage: StorageArgs,
        #[arg(short, long, required = true, help = "Peer address, host:port")]
        peer: Vec<String>,
        #[arg(long, help = "Print JSON instead of text")]
        json: bool,
    },
    /// Download one file from every peer that holds it
    Download {
        #[command(flatten)]
        storage: StorageArgs,
        #[command(flatten)]
        fetch: FetchArgs,
        #[arg(short, long, required = true, help = "Peer address, host:port")]
        peer: Vec<String>,
        #[arg(long, help = "File id")]
        id: u64,
    },
    /// Serve on the first free candidate port and download from the others
    Seed {
        #[command(flatten)]
        storage: StorageArgs,
        #[command(flatten)]
        fetch: FetchArgs,
        #[arg(long, default_value = "127.0.0.1", help = "Address of every swarm member")]
        address: String,
        #[arg(short, long, help = "Candidate ports of the swarm", default_values_t = DEFAULT_PORTS)]
        port: Vec<u16>,
        #[arg(short, long, help = "File ids to download while serving")]
        want: Vec<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logger();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            storage,
            address,
            port,
            max_transfers,
        } => {
            let tracker = Arc::new(ProgressTracker::new());
            let server = bind_server(&storage.root, &address, &port, tracker, max_transfers).await?;
            let shutdown = CancellationToken::new();
            let server_task = tokio::spawn(server.serve(shutdown.clone()));

            tokio::signal::ctrl_c().await?;
            shutdown.cancel();
            server_task.await.context("server task")??;
        }
        Commands::List {
            storage,
            peer,
            json,
        } => {
            let downloader = Downloader::new(
                peer,
                LocalCatalog::new(storage.root),
                Arc::new(ProgressTracker::new()),
                DownloadConfig::default(),
            );
            let available = downloader.discover().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&available)?);
            } else if available.is_empty() {
                println!("No files available.");
            } else {
                println!("Files available:");
                for entry in available.iter() {
                    println!(
                        "[{}] {} ({} bytes) from {} seeder/s",
                        entry.file.id,
                        entry.file.name,
                        entry.file.size,
                        entry.peers.len()
                    );
                }
            }
        }
        Commands::Download {
            storage,
            fetch,
            peer,
            id,
        } => {
            let tracker = Arc::new(ProgressTracker::new());
            let downloader = Downloader::new(
                peer,
                LocalCatalog::new(storage.root),
                Arc::clone(&tracker),
                fetch.config(),
            );

            let handle = start(&downloader, id).await?;
            let outcome = watch(vec![handle], &tracker, fetch.status_interval()).await?;
            if outcome.iter().any(|o| matches!(o, DownloadOutcome::Stalled { .. })) {
                anyhow::bail!("download of file {} stalled", id);
            }
        }
        Commands::Seed {
            storage,
            fetch,
            address,
            port,
            want,
        } => {
            let tracker = Arc::new(ProgressTracker::new());
            let server = bind_server(
                &storage.root,
                &address,
                &port,
                Arc::clone(&tracker),
                ServerConfig::default().max_transfers,
            )
            .await?;
            let own_port = server.local_addr()?.port();
            let shutdown = CancellationToken::new();
            let server_task = tokio::spawn(server.serve(shutdown.clone()));

            let swarm = port
                .iter()
                .filter(|p| **p != own_port)
                .map(|p| format!("{}:{}", address, p))
                .collect::<Vec<_>>();
            let downloader = Downloader::new(
                swarm,
                LocalCatalog::new(storage.root),
                Arc::clone(&tracker),
                fetch.config(),
            );

            let mut handles = Vec::new();
            for id in want {
                match start(&downloader, id).await {
                    Ok(handle) => handles.push(handle),
                    Err(err) => tracing::error!(id, "{:#}", err),
                }
            }
            if !handles.is_empty() {
                watch(handles, &tracker, fetch.status_interval()).await?;
            }

            println!("Seeding, press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await?;
            shutdown.cancel();
            server_task.await.context("server task")??;
        }
    }

    Ok(())
}

async fn bind_server(
    root: &Path,
    address: &str,
    ports: &[u16],
    tracker: Arc<ProgressTracker>,
    max_transfers: usize,
) -> anyhow::Result<Server> {
    let catalog = LocalCatalog::new(root);
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("error while creating the storage root {:?}", root))?;
    catalog
        .dump(std::io::stderr())
        .context("error while scanning the storage root")?;

    let state = Arc::new(AppState::new(catalog, tracker));
    let server = Server::bind_first_available(address, ports, state, ServerConfig { max_transfers })
        .await
        .context("error while binding the server")?;
    println!("Listening at {}", server.local_addr()?);
    Ok(server)
}

async fn start(downloader: &Downloader, id: u64) -> anyhow::Result<DownloadHandle> {
    let available = downloader.discover().await?;
    let Some(entry) = available.into_iter().find(|a| a.file.id == id) else {
        anyhow::bail!("no seeders for file ID {}", id);
    };

    let handle = downloader
        .start_download_from(&entry.file, &entry.peers)
        .await
        .with_context(|| format!("error while starting the download of {}", entry.file))?;
    println!(
        "Download started. File: [{}] {} ({} bytes) using {} peer/s",
        entry.file.id,
        entry.file.name,
        entry.file.size,
        handle.peers()
    );
    Ok(handle)
}

/// Prints status lines until every download has finished its tasks.
async fn watch(
    handles: Vec<DownloadHandle>,
    tracker: &ProgressTracker,
    every: Duration,
) -> anyhow::Result<Vec<DownloadOutcome>> {
    let waits = futures::future::join_all(handles.into_iter().map(|h| h.wait()));
    tokio::pin!(waits);

    let mut ticker = tokio::time::interval(every);
    let outcomes = loop {
        tokio::select! {
            outcomes = &mut waits => break outcomes,
            _ = ticker.tick() => {
                for (id, state) in tracker.snapshot() {
                    println!("{}", state.report(id));
                }
            }
        }
    };

    for (id, state) in tracker.remove_completed() {
        println!("Download completed: [{}] {}", id, state.name);
    }
    for (id, state) in tracker.snapshot() {
        println!("{}", state.report(id));
    }
    outcomes
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .context("error while finishing a download")
}

fn setup_logger() {
    let env_filter = EnvFilter::builder()
        .with_env_var(TRACING_ENV)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt().compact().with_env_filter(env_filter).finish();

    tracing::subscriber::set_global_default(subscriber).expect("Error setting a global tracing::subscriber");
}
