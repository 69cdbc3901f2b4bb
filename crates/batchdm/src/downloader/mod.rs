//! Downloader module
//!
//! Batch scheduling, resumable transfers, hash verification and
//! reachability tracking.

pub mod batch;
pub mod config;
pub mod core;
pub mod engine;
pub mod reachability;
pub mod scheduler;
pub mod task;

// Re-export main types for convenience
pub use batch::{BatchId, BatchSnapshot, BatchStatus, DownloadBatch};
pub use config::{DownloadConfig, DownloadConfigBuilder};
pub use core::{
    ComputedDigest, DataObserver, DownloadDescriptor, DownloadError, DownloadMetrics, DownloadMetricsSnapshot,
    ErrorKind, ErrorSeverity, FileOperation, HashAlgorithm, HashVerifier, HttpTransport, RateSampler, Result,
    SchedulerEvent, TaskRate, TransferOutcome, TransferResponse, Transport, UiObserver,
};
pub use engine::{EngineEvent, EngineEventKind, TransferControl, TransferEngine, TransferJob};
pub use reachability::{HttpProbeMonitor, ManualReachability, ReachabilitySource};
pub use scheduler::{BatchScheduler, ManagerPhase, TaskHandle};
pub use task::{DownloadTask, SuspendReason, TaskId, TaskSnapshot, TaskState};

#[cfg(test)]
mod tests;
