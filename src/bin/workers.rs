//! workers CLI: demo host for the worker framework.
//!
//! `serve` wires a two-stage pipeline: the `Scan` pull worker lists a
//! directory every session and offers each file to the `checksum` stateful
//! queue; the `Checksum` resumable worker drains that queue and logs a
//! SHA-256 digest per file. Files whose size and modification time did not change
//! since the last scan are not checksummed again.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use futures::stream::{self, BoxStream, StreamExt};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::info;
use workers::config::secrets::redact_url;
use workers::config::{Config, WorkersConfig};
use workers::db::{Db, PgStateStore};
use workers::telemetry::{TelemetryConfig, init_telemetry};
use workers::{
    MemoryStateStore, PullJob, PullWorker, ResumableJob, ResumableWorker, StateStore,
    StatefulQueue, Throttle, WorkItem, WorkerHost,
};

#[derive(Parser)]
#[command(name = "workers", about = "Background worker host")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scan → checksum pipeline until Ctrl-C
    Serve {
        /// Directory the Scan worker lists every session
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Validate the workers file and print effective settings
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Serve { dir } => {
            let code = cmd_serve(config, dir).await?;
            std::process::exit(code);
        }
        Command::CheckConfig => cmd_check_config(&config),
    }
}

async fn cmd_serve(config: Config, dir: PathBuf) -> anyhow::Result<i32> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "workers".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let workers = WorkersConfig::load_or_default(&config.workers_file)?;

    let store: Arc<dyn StateStore<SourceFile>> = match config.database_url {
        Some(ref url) => {
            info!(database = %redact_url(url), "using Postgres state store");
            let db = Db::connect(url.expose_secret()).await?;
            db.migrate().await?;
            Arc::new(PgStateStore::new(db, "checksum"))
        }
        None => {
            info!("DATABASE_URL not set, state is kept in memory");
            Arc::new(MemoryStateStore::new())
        }
    };
    let queue = Arc::new(StatefulQueue::new("checksum", store));
    let throttle = Arc::new(Throttle::new());

    let mut host = WorkerHost::new(config.shutdown_timeout);
    host.register(PullWorker::new(
        "Scan",
        workers.settings_for("Scan")?,
        ScanJob {
            dir,
            queue: Arc::clone(&queue),
        },
        Arc::clone(&throttle),
    ));
    host.register(ResumableWorker::new(
        "Checksum",
        workers.settings_for("Checksum")?,
        ChecksumJob,
        queue,
    ));

    Ok(host
        .run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await)
}

fn cmd_check_config(config: &Config) -> anyhow::Result<()> {
    let workers = WorkersConfig::load(&config.workers_file)?;
    println!("{}: ok", config.workers_file.display());

    for name in workers.worker_names() {
        let settings = workers.settings_for(name)?;
        println!(
            "  {:<16} enabled={:<5} tasks={:<3} idle={}s group={}",
            name,
            settings.enabled,
            settings.concurrent_task_count,
            settings.idle_time_secs,
            settings.resource_group
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Source files
// ---------------------------------------------------------------------------

/// A file seen by the scan. Size and mtime decide whether it changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceFile {
    path: String,
    modified: DateTime<Utc>,
    len: u64,
}

impl SourceFile {
    /// `None` for anything that is not a regular file.
    async fn stat(path: &Path) -> std::io::Result<Option<Self>> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Ok(None);
        }
        Ok(Some(Self {
            path: path.display().to_string(),
            modified: DateTime::from(meta.modified()?),
            len: meta.len(),
        }))
    }
}

impl fmt::Display for SourceFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

impl WorkItem for SourceFile {
    type Key = String;

    fn key(&self) -> String {
        self.path.clone()
    }

    fn equals_by_value(&self, other: &Self) -> bool {
        self.path == other.path && self.modified == other.modified && self.len == other.len
    }

    /// No real file is `u64::MAX` bytes long.
    fn with_minimal_value(&self) -> Self {
        Self {
            path: self.path.clone(),
            modified: DateTime::<Utc>::UNIX_EPOCH,
            len: u64::MAX,
        }
    }
}

// ---------------------------------------------------------------------------
// Scan
// ---------------------------------------------------------------------------

struct ScanJob {
    dir: PathBuf,
    queue: Arc<StatefulQueue<SourceFile>>,
}

#[async_trait]
impl PullJob for ScanJob {
    type Item = SourceFile;

    fn discover(&self, _cancel: CancellationToken) -> BoxStream<'_, anyhow::Result<SourceFile>> {
        stream::once(tokio::fs::read_dir(self.dir.clone()))
            .flat_map(|read_dir| match read_dir {
                Ok(entries) => stream::unfold(entries, |mut entries| async move {
                    match entries.next_entry().await {
                        Ok(Some(entry)) => Some((Ok(entry.path()), entries)),
                        Ok(None) => None,
                        Err(e) => Some((Err(e), entries)),
                    }
                })
                .boxed(),
                Err(e) => stream::once(async move { Err(e) }).boxed(),
            })
            .filter_map(|entry| async move {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => return Some(Err(anyhow::Error::from(e))),
                };
                SourceFile::stat(&path)
                    .await
                    .map_err(anyhow::Error::from)
                    .transpose()
            })
            .boxed()
    }

    async fn process(&self, item: SourceFile, _cancel: &CancellationToken) -> anyhow::Result<()> {
        self.queue.enqueue(item).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Checksum
// ---------------------------------------------------------------------------

const CHUNK_SIZE: usize = 64 * 1024;

struct ChecksumJob;

#[async_trait]
impl ResumableJob for ChecksumJob {
    type Item = SourceFile;

    async fn process(&self, item: SourceFile, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut file = tokio::fs::File::open(&item.path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut len = 0u64;

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                read = file.read(&mut buf) => read?,
            };
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
            len += read as u64;
        }

        let digest = hex::encode(hasher.finalize());
        info!(path = %item.path, len, sha256 = %digest, "checksummed");
        Ok(())
    }
}
