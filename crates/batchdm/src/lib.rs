//! Batch Download Manager
//!
//! This library downloads groups of remote files into local destinations.
//! Batches run one after another in submission order; the tasks of the
//! current batch run concurrently up to a configured limit. Interrupted
//! transfers resume from their partial file, finished files are checked
//! against an expected digest, and downloads pause and resume automatically
//! with network reachability.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use batchdm::{
//!     BatchScheduler, DownloadConfig, DownloadDescriptor, HashAlgorithm,
//!     ManualReachability, TaskSnapshot, UiObserver,
//! };
//! use std::sync::Arc;
//!
//! struct Console;
//!
//! impl UiObserver for Console {
//!     fn did_finish_all(&self) {
//!         println!("All downloads finished");
//!     }
//!
//!     fn did_reach_progress(&self, percent: f32) {
//!         println!("Progress: {:.0}%", percent);
//!     }
//!
//!     fn did_hit_download_error(&self, task: &TaskSnapshot) {
//!         println!("{} failed: {:?}", task.url, task.last_error);
//!     }
//! }
//!
//! # async fn example() -> batchdm::Result<()> {
//! let config = DownloadConfig::builder()
//!     .max_concurrent_downloads(4)
//!     .hash_algorithm(HashAlgorithm::Sha256)
//!     .build()?;
//!
//! // The host updates reachability from its own network notifications
//! let reachability = ManualReachability::new(true);
//! let scheduler = BatchScheduler::with_http(config, &reachability)?;
//! scheduler.set_ui_observer(Some(Arc::new(Console)));
//!
//! scheduler.download_batch(vec![
//!     DownloadDescriptor::new("https://example.com/a.bin", "downloads/a.bin")
//!         .with_expected_size(1024)
//!         .with_expected_hash("2f5e..."),
//!     DownloadDescriptor::new("https://example.com/b.bin", "downloads/b.bin"),
//! ])?;
//! scheduler.wait_until_idle().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Ordered batches**: one current batch at a time, queued batches promoted in order
//! - **Resume**: `.part` files continue with HTTP range requests, restarting cleanly when a server ignores them
//! - **Verification**: MD5, SHA-1, SHA-256, SHA-512 and xxHash64, hex or base64 digests
//! - **Retry logic**: transient failures retried with Fibonacci backoff
//! - **Reachability**: connectivity loss suspends transfers, its return resumes them
//! - **Observers**: callback traits plus a broadcast stream of every scheduler event

pub mod downloader;
pub mod logging;

// Re-export commonly used types for convenience
pub use downloader::{
    BatchScheduler, DataObserver, DownloadConfig, DownloadDescriptor, DownloadError, HashAlgorithm,
    HttpProbeMonitor, ManagerPhase, ManualReachability, ReachabilitySource, Result, SchedulerEvent, TaskHandle,
    TaskSnapshot, TaskState, UiObserver,
};
