//! Transfer engine
//!
//! Runs one spawned worker per launched task. A worker streams the response
//! body into the task's `.part` file, feeds every chunk to the hash verifier,
//! and reports upward over an unbounded channel:
//!
//! - `Progress` after every chunk has been written
//! - `Finished` once the file verified and was promoted to its destination
//! - `Failed` for non-retriable errors or when retries ran out
//! - `Suspended` / `Cancelled` when the scheduler stopped it
//!
//! Transient errors are retried inside the worker with Fibonacci backoff,
//! resuming from whatever the partial file already holds.

use futures::StreamExt;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, info_span, warn, Instrument};
use url::Url;

use crate::downloader::config::DownloadConfig;
use crate::downloader::core::files;
use crate::downloader::core::{
    DownloadError, DownloadMetrics, FileOperation, HashAlgorithm, HashVerifier, TransferOutcome, Transport,
};
use crate::downloader::task::TaskId;

/// Everything a worker needs to fetch one file
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub task_id: TaskId,
    pub url: Url,
    pub destination: PathBuf,
    pub expected_size: Option<u64>,
    pub expected_hash: Option<String>,
    pub algorithm: HashAlgorithm,
}

/// How a stopped transfer should leave its partial file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopIntent {
    /// Keep the partial file and report its length as the resumable offset
    Suspend,
    /// Remove the partial file
    Cancel,
}

/// Caller side of a running transfer
#[derive(Debug, Clone)]
pub struct TransferControl {
    token: CancellationToken,
    intent: Arc<Mutex<Option<StopIntent>>>,
}

impl TransferControl {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            intent: Arc::new(Mutex::new(None)),
        }
    }

    /// Stop at the next chunk boundary, keeping the partial file
    ///
    /// Does not downgrade an earlier cancel.
    pub fn suspend(&self) {
        self.intent.lock().get_or_insert(StopIntent::Suspend);
        self.token.cancel();
    }

    /// Stop at the next chunk boundary and discard the partial file
    pub fn cancel(&self) {
        *self.intent.lock() = Some(StopIntent::Cancel);
        self.token.cancel();
    }

    pub fn is_stopping(&self) -> bool {
        self.token.is_cancelled()
    }

    fn intent(&self) -> StopIntent {
        self.intent.lock().unwrap_or(StopIntent::Cancel)
    }
}

/// Report from a worker to the scheduler
#[derive(Debug)]
pub struct EngineEvent {
    pub task_id: TaskId,
    pub kind: EngineEventKind,
}

#[derive(Debug)]
pub enum EngineEventKind {
    /// Response head arrived; the body continues from `offset`
    Started {
        offset: u64,
        total_size: Option<u64>,
        restarted: bool,
    },
    /// Bytes written to the partial file
    Progress { delta: u64 },
    /// A transient error will be retried after a backoff
    Retrying {
        attempt: usize,
        error: Arc<DownloadError>,
    },
    Finished(TransferOutcome),
    Failed(DownloadError),
    Suspended { offset: u64 },
    Cancelled,
    /// Cleanup requested through [`TransferEngine::discard`] is done
    Discarded,
}

struct EngineShared {
    config: DownloadConfig,
    transport: Arc<dyn Transport>,
    events: mpsc::UnboundedSender<EngineEvent>,
    metrics: Arc<DownloadMetrics>,
    runtime: Handle,
}

/// Launches and supervises transfers
#[derive(Clone)]
pub struct TransferEngine {
    shared: Arc<EngineShared>,
}

impl TransferEngine {
    pub fn new(
        config: DownloadConfig,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedSender<EngineEvent>,
        metrics: Arc<DownloadMetrics>,
        runtime: Handle,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                config,
                transport,
                events,
                metrics,
                runtime,
            }),
        }
    }

    pub fn metrics(&self) -> &DownloadMetrics {
        &self.shared.metrics
    }

    /// Spawn a worker for `job` and return its control
    pub fn launch(&self, job: TransferJob) -> TransferControl {
        let control = TransferControl::new();
        let span = info_span!("transfer", task = %job.task_id, url = %job.url);
        let worker = Worker {
            shared: self.shared.clone(),
            temp_path: files::create_temp_path(&job.destination),
            job,
            control: control.clone(),
        };
        self.shared.runtime.spawn(worker.run().instrument(span));
        control
    }

    /// Remove `paths` in the background and report `Discarded` for `task_id`
    pub fn discard(&self, task_id: TaskId, paths: Vec<PathBuf>) {
        let shared = self.shared.clone();
        let span = debug_span!("discard", task = %task_id);
        self.shared.runtime.spawn(
            async move {
                for path in &paths {
                    files::discard(path).await;
                }
                let _ = shared.events.send(EngineEvent {
                    task_id,
                    kind: EngineEventKind::Discarded,
                });
            }
            .instrument(span),
        );
    }
}

enum Halt {
    /// The scheduler asked the worker to stop
    Stopped,
    Failed(DownloadError),
}

impl From<DownloadError> for Halt {
    fn from(error: DownloadError) -> Self {
        Halt::Failed(error)
    }
}

type Step<T> = std::result::Result<T, Halt>;

struct Worker {
    shared: Arc<EngineShared>,
    job: TransferJob,
    temp_path: PathBuf,
    control: TransferControl,
}

impl Worker {
    async fn run(self) {
        self.shared.metrics.record_started();

        let kind = match self.execute().await {
            Ok(outcome) => {
                let metrics = &self.shared.metrics;
                metrics.record_completed();
                match outcome {
                    TransferOutcome::Resumed { .. } => metrics.record_resumed(),
                    TransferOutcome::Restarted { .. } => metrics.record_restarted(),
                    TransferOutcome::AlreadyExists { .. } => metrics.record_already_present(),
                    TransferOutcome::Downloaded { .. } => {}
                }
                info!("Finished {}: {:?}", self.job.destination.display(), outcome);
                EngineEventKind::Finished(outcome)
            }
            Err(Halt::Stopped) => self.stop().await,
            Err(Halt::Failed(error)) => {
                self.shared.metrics.record_failed();
                // A partial left by transient failures stays for a later resume
                if !matches!(error, DownloadError::MaxRetriesExceeded { .. }) {
                    files::discard(&self.temp_path).await;
                }
                // Content that failed verification must not be mistaken for a good copy
                if matches!(
                    error,
                    DownloadError::HashMismatch { .. } | DownloadError::SizeMismatch { .. }
                ) {
                    files::discard(&self.job.destination).await;
                }
                warn!(
                    category = error.category(),
                    severity = ?error.severity(),
                    "Transfer failed: {}",
                    error
                );
                debug!("{}", error.detailed_report());
                EngineEventKind::Failed(error)
            }
        };

        self.emit(kind);
    }

    async fn stop(&self) -> EngineEventKind {
        match self.control.intent() {
            StopIntent::Suspend => {
                let offset = if self.shared.config.allow_resume {
                    files::partial_len(&self.temp_path).await.unwrap_or(0)
                } else {
                    0
                };
                debug!("Suspended at byte {}", offset);
                EngineEventKind::Suspended { offset }
            }
            StopIntent::Cancel => {
                files::discard(&self.temp_path).await;
                self.shared.metrics.record_cancelled();
                debug!("Cancelled, partial file removed");
                EngineEventKind::Cancelled
            }
        }
    }

    fn emit(&self, kind: EngineEventKind) {
        let _ = self.shared.events.send(EngineEvent {
            task_id: self.job.task_id,
            kind,
        });
    }

    async fn execute(&self) -> Step<TransferOutcome> {
        let job = &self.job;
        let config = &self.shared.config;

        if config.skip_existing {
            let existing = files::check_existing_file(
                &job.destination,
                job.expected_size,
                job.expected_hash.as_deref(),
                job.algorithm,
            )
            .await?;
            if let Some(size) = existing {
                debug!("Destination already present ({} bytes)", size);
                return Ok(TransferOutcome::AlreadyExists { size });
            }
        }

        files::ensure_parent_dir(&job.destination).await?;

        let mut delays = config.retry_delays();
        let mut attempt = 0;
        loop {
            match self.attempt().await {
                Err(Halt::Failed(error)) if error.is_recoverable() => {
                    if attempt >= config.max_retries {
                        return Err(Halt::Failed(DownloadError::MaxRetriesExceeded {
                            url: job.url.to_string(),
                            max_retries: config.max_retries,
                            last_error: Box::new(error),
                        }));
                    }
                    attempt += 1;
                    let delay = delays.next().unwrap_or(config.max_retry_delay);
                    warn!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, config.max_retries, error, delay
                    );
                    self.shared.metrics.record_retry();
                    self.emit(EngineEventKind::Retrying {
                        attempt,
                        error: Arc::new(error),
                    });

                    tokio::select! {
                        _ = self.control.token.cancelled() => return Err(Halt::Stopped),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// One GET from the current resumable offset to the end of the body
    async fn attempt(&self) -> Step<TransferOutcome> {
        let job = &self.job;
        let config = &self.shared.config;

        let mut offset = if config.allow_resume {
            files::partial_len(&self.temp_path).await?
        } else {
            files::remove_if_exists(&self.temp_path).await?;
            0
        };
        let mut discarded = 0;

        if let Some(expected) = job.expected_size {
            if offset > expected {
                warn!("Partial file holds {} bytes but {} are expected; restarting", offset, expected);
                files::remove_if_exists(&self.temp_path).await?;
                discarded = offset;
                offset = 0;
            } else if offset > 0 && offset == expected {
                debug!("Partial file is already complete, verifying");
                self.emit(EngineEventKind::Started {
                    offset,
                    total_size: Some(expected),
                    restarted: false,
                });
                let verifier = self.verifier(offset).await?;
                return self.finish(offset, verifier, offset, 0).await;
            }
        }

        let idle = config.idle_timeout;
        let response = loop {
            // A server that accepts the connection but never answers counts as idle too
            let fetched = tokio::select! {
                biased;
                _ = self.control.token.cancelled() => return Err(Halt::Stopped),
                fetched = tokio::time::timeout(idle, self.shared.transport.fetch(&job.url, offset)) => fetched,
            };
            let fetched = fetched.unwrap_or_else(|_| {
                Err(DownloadError::NetworkTimeout {
                    url: job.url.to_string(),
                    duration_secs: idle.as_secs(),
                })
            });
            match fetched {
                Ok(response) => break response,
                Err(DownloadError::ServerError { status: 416, .. }) if offset > 0 => {
                    info!("Server rejected range from byte {}, restarting from zero", offset);
                    files::remove_if_exists(&self.temp_path).await?;
                    discarded = offset;
                    offset = 0;
                }
                Err(error) => return Err(error.into()),
            }
        };

        if offset > 0 && !response.partial {
            info!("Server ignored range request at byte {}, restarting from zero", offset);
            discarded = offset;
            offset = 0;
        }

        let total = match (job.expected_size, response.total_size) {
            (Some(expected), Some(reported)) if expected != reported => {
                return Err(DownloadError::SizeMismatch {
                    file: job.destination.clone(),
                    expected,
                    actual: reported,
                    diff: reported as i64 - expected as i64,
                }
                .into());
            }
            (expected, reported) => expected.or(reported),
        };

        let mut verifier = self.verifier(offset).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(offset > 0)
            .truncate(offset == 0)
            .open(&self.temp_path)
            .await
            .map_err(|e| DownloadError::fs(&self.temp_path, FileOperation::Create, e))?;

        debug!("Streaming from byte {} (total {:?})", offset, total);
        self.emit(EngineEventKind::Started {
            offset,
            total_size: total,
            restarted: discarded > 0,
        });

        let mut body = response.body;
        let mut written = offset;

        let streamed: Step<()> = loop {
            let next = tokio::select! {
                biased;
                _ = self.control.token.cancelled() => break Err(Halt::Stopped),
                next = tokio::time::timeout(idle, body.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    break Err(Halt::Failed(DownloadError::NetworkTimeout {
                        url: job.url.to_string(),
                        duration_secs: idle.as_secs(),
                    }));
                }
                Ok(None) => break Ok(()),
                Ok(Some(Err(error))) => break Err(Halt::Failed(error)),
                Ok(Some(Ok(chunk))) => chunk,
            };
            if chunk.is_empty() {
                continue;
            }

            let len = chunk.len() as u64;
            if let Some(total) = total {
                if written + len > total {
                    break Err(Halt::Failed(DownloadError::SizeMismatch {
                        file: job.destination.clone(),
                        expected: total,
                        actual: written + len,
                        diff: (written + len - total) as i64,
                    }));
                }
            }

            if let Err(e) = file.write_all(&chunk).await {
                break Err(Halt::Failed(DownloadError::fs(&self.temp_path, FileOperation::Write, e)));
            }
            if let Some(verifier) = verifier.as_mut() {
                verifier.update(&chunk);
            }
            written += len;
            self.shared.metrics.record_bytes(len);
            self.emit(EngineEventKind::Progress { delta: len });
        };

        // The partial file must hold every counted byte before anyone reads its length
        let flushed = self.flush(&mut file).await;
        drop(file);
        streamed?;
        flushed?;

        if let Some(total) = total {
            if written < total {
                return Err(DownloadError::ConnectionLost {
                    url: job.url.to_string(),
                    reason: format!("body ended at {} of {} bytes", written, total),
                }
                .into());
            }
        }

        self.finish(written, verifier, offset, discarded).await
    }

    /// Verifier primed with the first `offset` bytes, when a digest is expected
    async fn verifier(&self, offset: u64) -> Step<Option<HashVerifier>> {
        if self.job.expected_hash.is_none() {
            return Ok(None);
        }
        let verifier = if offset > 0 {
            HashVerifier::primed_from_file(self.job.algorithm, &self.temp_path, offset).await?
        } else {
            HashVerifier::new(self.job.algorithm)
        };
        Ok(Some(verifier))
    }

    async fn flush(&self, file: &mut File) -> Step<()> {
        file.flush()
            .await
            .map_err(|e| DownloadError::fs(&self.temp_path, FileOperation::Write, e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::fs(&self.temp_path, FileOperation::Write, e))?;
        Ok(())
    }

    /// Verify the digest and promote the partial file
    async fn finish(
        &self,
        size: u64,
        verifier: Option<HashVerifier>,
        resumed_from: u64,
        discarded: u64,
    ) -> Step<TransferOutcome> {
        let job = &self.job;

        if let (Some(expected), Some(verifier)) = (job.expected_hash.as_deref(), verifier) {
            let digest = verifier.finalize();
            if !digest.matches(expected) {
                self.shared.metrics.record_hash_mismatch();
                return Err(DownloadError::HashMismatch {
                    file: job.destination.clone(),
                    algorithm: job.algorithm,
                    expected: expected.to_string(),
                    actual: digest.hex,
                }
                .into());
            }
            debug!("{} digest verified: {}", job.algorithm, digest);
        }

        // Last checkpoint before the destination appears
        if self.control.is_stopping() && self.control.intent() == StopIntent::Cancel {
            return Err(Halt::Stopped);
        }

        files::atomic_rename(&self.temp_path, &job.destination).await?;

        Ok(if discarded > 0 {
            TransferOutcome::Restarted { size, discarded }
        } else if resumed_from > 0 {
            TransferOutcome::Resumed {
                size,
                offset: resumed_from,
            }
        } else {
            TransferOutcome::Downloaded { size }
        })
    }
}
