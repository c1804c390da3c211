use std::{net::SocketAddr, path::Path, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use chunkline_bridge::HttpTransport;
use chunkline_contract::DEFAULT_CHUNK_SIZE;
use chunkline_control_plane::{
    build_router, spawn_orphan_sweeper, AppState, SizeValidator, SweeperConfig, UploadCoordinator,
};
use chunkline_storage::{ChunkWriter, ChunklineStorage, StorageConfig};
use chunkline_transfer::{
    ChunkState, RetryPolicy, SchedulerConfig, TransferScheduler, TransferState,
    DEFAULT_CONCURRENCY,
};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Resumable chunked file uploads")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the upload server.
    Serve {
        #[arg(long, default_value = "config/chunkline.toml")]
        config: PathBuf,
    },
    /// Upload a file to a running server, resuming if it was interrupted.
    Push {
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        endpoint: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
        concurrency: usize,
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: u64,
        #[arg(long, default_value_t = 10)]
        max_retries: u32,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
    /// Reclaim abandoned sessions once and exit.
    Sweep {
        #[arg(long, default_value = "config/chunkline.toml")]
        config: PathBuf,
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
struct RuntimeConfig {
    http: HttpSection,
    storage: StorageSection,
    #[serde(default)]
    upload: UploadSection,
}

#[derive(Debug, Clone, Deserialize)]
struct HttpSection {
    bind: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StorageSection {
    sqlite_path: String,
    data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct UploadSection {
    chunk_size: u64,
    orphan_max_age_secs: u64,
    sweep_interval_secs: u64,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            orphan_max_age_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
        }
    }
}

impl RuntimeConfig {
    fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&source).with_context(|| format!("invalid config TOML at {}", path.display()))
    }

    fn parse(source: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(source)?;
        if config.upload.chunk_size == 0 {
            bail!("upload.chunk_size must be greater than zero");
        }
        if config.upload.sweep_interval_secs == 0 {
            bail!("upload.sweep_interval_secs must be greater than zero");
        }
        Ok(config)
    }

    fn orphan_max_age(&self) -> Duration {
        Duration::from_secs(self.upload.orphan_max_age_secs)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
        Command::Push {
            endpoint,
            file,
            concurrency,
            chunk_size,
            max_retries,
            timeout_secs,
        } => {
            let config = SchedulerConfig {
                chunk_size,
                concurrency,
                retry: RetryPolicy {
                    max_retries,
                    ..RetryPolicy::default()
                },
            };
            push(&endpoint, file, config, Duration::from_secs(timeout_secs)).await
        }
        Command::Sweep {
            config,
            max_age_secs,
        } => sweep(config, max_age_secs).await,
    }
}

async fn build_coordinator(config: &RuntimeConfig) -> Result<Arc<UploadCoordinator>> {
    if let Some(parent) = Path::new(&config.storage.sqlite_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let storage = ChunklineStorage::connect(&StorageConfig {
        sqlite_path: config.storage.sqlite_path.clone(),
    })
    .await?;
    let writer = ChunkWriter::create(&config.storage.data_dir).await?;

    Ok(Arc::new(UploadCoordinator::new(
        Arc::new(storage),
        writer,
        Arc::new(SizeValidator),
        config.upload.chunk_size,
    )))
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config = RuntimeConfig::load(&config_path)?;
    let coordinator = build_coordinator(&config).await?;

    let sweeper = spawn_orphan_sweeper(
        Arc::clone(&coordinator),
        SweeperConfig {
            interval: Duration::from_secs(config.upload.sweep_interval_secs),
            max_age: config.orphan_max_age(),
        },
    );

    let app = build_router(AppState::new(coordinator, config.orphan_max_age()));

    let socket: SocketAddr = config
        .http
        .bind
        .parse()
        .with_context(|| format!("invalid socket address {}", config.http.bind))?;
    if !socket.ip().is_loopback() {
        warn!(bind = %socket, "listening on a non-loopback address without authentication");
    }

    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {}", config.http.bind))?;

    info!(
        bind = %config.http.bind,
        chunk_size = config.upload.chunk_size,
        data_dir = %config.storage.data_dir.display(),
        "chunkline server listening"
    );
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("axum server failed");
    sweeper.abort();
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn push(
    endpoint: &str,
    file: PathBuf,
    config: SchedulerConfig,
    timeout: Duration,
) -> Result<()> {
    let transport = HttpTransport::new(endpoint, timeout)?;
    let scheduler = TransferScheduler::new(Arc::new(transport), &file, config)?;

    let mut progress = scheduler.subscribe();
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let snapshot = progress.borrow_and_update().clone();
            if snapshot.state != TransferState::Uploading {
                continue;
            }
            info!(
                percent = snapshot.percent(),
                uploaded = snapshot.uploaded_bytes,
                total = snapshot.total_bytes,
                in_flight = snapshot.count(ChunkState::Uploading),
                throughput_bps = snapshot.throughput_bps as u64,
                eta_secs = snapshot.eta.map(|eta| eta.as_secs()),
                "upload progress"
            );
        }
    });

    let outcome = scheduler.start().await;
    reporter.abort();

    let report = outcome.with_context(|| format!("upload of {} failed", file.display()))?;
    info!(
        session_id = %report.session_id,
        status = %report.finalize.status,
        resumed_chunks = report.resumed_chunks,
        sent_chunks = report.sent_chunks,
        hash = report.finalize.hash.as_deref().unwrap_or("-"),
        elapsed_ms = report.snapshot.elapsed.as_millis() as u64,
        "upload complete"
    );
    Ok(())
}

async fn sweep(config_path: PathBuf, max_age_secs: Option<u64>) -> Result<()> {
    let config = RuntimeConfig::load(&config_path)?;
    let max_age = max_age_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.orphan_max_age());
    let coordinator = build_coordinator(&config).await?;

    let reclaimed = coordinator.cleanup_orphans(max_age).await?;
    info!(reclaimed, max_age_secs = max_age.as_secs(), "orphan sweep finished");
    Ok(())
}
