//! Command-line front end for the batch download manager

use anyhow::{Context, Result};
use batchdm::downloader::{
    BatchScheduler, DownloadConfig, DownloadDescriptor, HashAlgorithm, HashVerifier, HttpProbeMonitor,
    ManualReachability, ReachabilitySource, TaskSnapshot, TaskState, UiObserver,
};
use batchdm::logging::{init_logging_stderr, DEFAULT_DIRECTIVE};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

#[derive(Parser)]
#[command(name = "batchdm", version, about = "Download batches of files with resume and verification")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download every entry of one or more JSON manifests, one batch per manifest
    Download {
        /// JSON array of {"url", "destination", "expected_size"?, "expected_hash"?, "hash_algorithm"?}
        #[arg(short, long = "manifest", required = true)]
        manifests: Vec<PathBuf>,

        /// JSON configuration file; BATCHDM_* environment variables apply otherwise
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long)]
        concurrency: Option<usize>,

        /// Default digest algorithm for entries that do not name one
        #[arg(long)]
        hash: Option<HashAlgorithm>,

        /// URL probed to detect connectivity; downloads pause while it is unreachable
        #[arg(long)]
        probe_url: Option<Url>,

        #[arg(long, default_value_t = 10)]
        probe_interval_secs: u64,
    },
    /// Print the digest of a local file
    Hash {
        file: PathBuf,

        #[arg(long, default_value = "md5")]
        algorithm: HashAlgorithm,
    },
}

struct ConsoleObserver;

impl UiObserver for ConsoleObserver {
    fn did_finish_all(&self) {
        println!("All downloads finished");
    }

    fn did_reach_progress(&self, percent: f32) {
        println!("Progress: {:.0}%", percent);
    }

    fn did_hit_download_error(&self, task: &TaskSnapshot) {
        match &task.last_error {
            Some(error) => {
                eprintln!("Failed {}: {}", task.url, error);
                if let Some(hint) = error.suggestion() {
                    eprintln!("  hint: {}", hint);
                }
            }
            None => eprintln!("Failed {}", task.url),
        }
    }

    fn did_finish_task(&self, task: &TaskSnapshot) {
        println!("Done {} -> {}", task.url, task.destination.display());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging_stderr(DEFAULT_DIRECTIVE)?;
    let cli = Cli::parse();

    match cli.command {
        Command::Download {
            manifests,
            config,
            concurrency,
            hash,
            probe_url,
            probe_interval_secs,
        } => download(manifests, config, concurrency, hash, probe_url, probe_interval_secs).await,
        Command::Hash { file, algorithm } => {
            let digest = HashVerifier::hash_file(algorithm, &file).await?;
            println!("{}  {} ({})", digest.hex, file.display(), digest.base64());
            Ok(())
        }
    }
}

async fn download(
    manifests: Vec<PathBuf>,
    config_path: Option<PathBuf>,
    concurrency: Option<usize>,
    hash: Option<HashAlgorithm>,
    probe_url: Option<Url>,
    probe_interval_secs: u64,
) -> Result<()> {
    let mut config = match config_path {
        Some(path) => DownloadConfig::from_json_file(&path)?,
        None => DownloadConfig::from_env()?,
    };
    if let Some(n) = concurrency {
        config.max_concurrent_downloads = n;
    }
    if let Some(algorithm) = hash {
        config.hash_algorithm = algorithm;
    }

    // The probe must outlive the scheduler's subscription
    let manual;
    let probe;
    let reachability: &dyn ReachabilitySource = match probe_url {
        Some(url) => {
            info!("Probing {} every {}s for connectivity", url, probe_interval_secs);
            probe = HttpProbeMonitor::spawn(url, Duration::from_secs(probe_interval_secs), Duration::from_secs(5))?;
            &probe
        }
        None => {
            manual = ManualReachability::new(true);
            &manual
        }
    };

    let scheduler = BatchScheduler::with_http(config, reachability)?;
    scheduler.set_ui_observer(Some(Arc::new(ConsoleObserver)));

    let mut handles = Vec::new();
    for path in &manifests {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let descriptors: Vec<DownloadDescriptor> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        info!("Queued {} entries from {}", descriptors.len(), path.display());
        handles.extend(scheduler.download_batch(descriptors)?);
    }

    tokio::select! {
        _ = scheduler.wait_until_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; cancelling outstanding downloads");
            scheduler.cancel_all_outstanding_tasks();
            scheduler.wait_until_idle().await;
        }
    }

    let failed = handles
        .iter()
        .filter(|h| h.state() == Some(TaskState::Failed))
        .count();
    let metrics = scheduler.metrics();
    println!(
        "{} tasks, {} failed, {} bytes received, {} retries",
        handles.len(),
        failed,
        metrics.bytes_received,
        metrics.retries_attempted
    );
    scheduler.shutdown().await;

    if failed > 0 {
        anyhow::bail!("{} downloads failed", failed);
    }
    Ok(())
}
