//! rendergridd — the RenderGrid daemon.
//!
//! Assembles the state store and the dispatch pipeline, then replays
//! recorded agent traffic through it:
//! - Farm snapshot (JSON) seeds the database of record
//! - Host, boot and frame-complete reports (JSON lines) feed the queues
//! - Kill commands go to a logging transport
//!
//! # Usage
//!
//! ```text
//! rendergridd replay --seed demos/replay/farm.json --reports demos/replay/reports.jsonl
//! rendergridd config --config demos/replay/rendergrid.toml
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rendergrid_dispatch::{DispatchConfig, DispatchPipeline, LoggingKillTransport, SubmitError};
use rendergrid_state::{FarmSnapshot, FrameCompleteReport, HostReport, StateStore};
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rendergridd", about = "RenderGrid scheduling daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Replay recorded reports against a seeded farm.
    Replay {
        /// Dispatcher configuration (TOML). Defaults apply when absent.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Database file. An in-memory store is used when absent.
        #[arg(long)]
        db: Option<PathBuf>,

        /// Farm snapshot (JSON) imported before the replay.
        #[arg(long)]
        seed: Option<PathBuf>,

        /// Recorded reports, one JSON record per line.
        #[arg(long)]
        reports: PathBuf,
    },

    /// Print the effective configuration.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// One line of a replay file.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Report(HostReport),
    Boot(HostReport),
    Complete(FrameCompleteReport),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Replay {
            config,
            db,
            seed,
            reports,
        } => run_replay(config.as_deref(), db.as_deref(), seed.as_deref(), &reports).await,
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rendergrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<DispatchConfig> {
    match path {
        Some(path) => DispatchConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(DispatchConfig::default()),
    }
}

fn open_store(db: Option<&Path>, seed: Option<&Path>) -> anyhow::Result<StateStore> {
    let store = match db {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            let store = StateStore::open(path)?;
            info!(path = ?path, "state store opened");
            store
        }
        None => StateStore::open_in_memory()?,
    };

    if let Some(seed) = seed {
        let file = File::open(seed).with_context(|| format!("opening seed {}", seed.display()))?;
        let snapshot: FarmSnapshot = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing seed {}", seed.display()))?;
        store.import(&snapshot)?;
        info!(
            hosts = snapshot.hosts.len(),
            jobs = snapshot.jobs.len(),
            frames = snapshot.frames.len(),
            "farm seeded"
        );
    }
    Ok(store)
}

async fn run_replay(
    config: Option<&Path>,
    db: Option<&Path>,
    seed: Option<&Path>,
    reports: &Path,
) -> anyhow::Result<()> {
    info!("RenderGrid daemon starting replay");

    let config = load_config(config)?;
    let store = open_store(db, seed)?;
    let pipeline = DispatchPipeline::new(store, config, Arc::new(LoggingKillTransport));
    pipeline.start();

    let file = File::open(reports).with_context(|| format!("opening {}", reports.display()))?;
    let mut replayed = 0usize;
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = index + 1, error = %e, "skipping unreadable record");
                continue;
            }
        };
        submit(&pipeline, record).await?;
        // Records are replayed in order; each settles before the next.
        pipeline.wait_idle().await;
        replayed += 1;
    }

    pipeline.shutdown().await;
    let stats = pipeline.stats();
    info!(replayed, "replay finished");
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Hand one record to the pipeline, backing off once if its queue is full.
async fn submit(pipeline: &DispatchPipeline, record: Record) -> anyhow::Result<()> {
    let mut retried = false;
    loop {
        let result = match &record {
            Record::Report(report) => pipeline.queue_host_report(report.clone()),
            Record::Boot(report) => pipeline.queue_boot_report(report.clone()),
            Record::Complete(report) => pipeline.queue_frame_complete(report.clone()),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(SubmitError::QueueFull(queue)) if !retried => {
                warn!(queue, "queue full, waiting before resend");
                pipeline.wait_idle().await;
                retried = true;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
