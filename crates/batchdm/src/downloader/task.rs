//! Download tasks
//!
//! A [`DownloadTask`] is the scheduler-owned record of one file transfer. The
//! caller never touches it directly: it holds a [`TaskHandle`](crate::downloader::TaskHandle) that routes
//! start, suspend and cancel through the scheduler's serialization point, and
//! reads state back as [`TaskSnapshot`] copies.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::downloader::batch::BatchId;
use crate::downloader::core::progress::ProgressGate;
use crate::downloader::core::{DownloadDescriptor, DownloadError, TransferOutcome};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Lifecycle of a task
///
/// Transitions only move forward, except `Suspended` and `Active` which may
/// alternate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Active,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }
}

/// Why a task or the whole manager was suspended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuspendReason {
    /// Requested by the caller; only an explicit resume lifts it
    Manual,
    /// Connectivity was lost; lifted when it returns
    Connectivity,
}

/// One file transfer owned by a batch
#[derive(Debug)]
pub struct DownloadTask {
    id: TaskId,
    batch_id: BatchId,
    descriptor: DownloadDescriptor,
    pub(crate) state: TaskState,
    /// Set while suspended; a held task is not relaunched
    pub(crate) hold: Option<SuspendReason>,
    /// A transfer or cleanup job is still running for this task
    pub(crate) attached: bool,
    /// Highest byte count ever committed for this task
    pub(crate) bytes_received: u64,
    /// Byte position of the running transfer, may fall back on a restart
    pub(crate) position: u64,
    pub(crate) total_size: Option<u64>,
    pub(crate) resumable_offset: u64,
    pub(crate) outcome: Option<TransferOutcome>,
    pub(crate) last_error: Option<Arc<DownloadError>>,
    pub(crate) progress_gate: ProgressGate,
}

impl DownloadTask {
    pub(crate) fn new(batch_id: BatchId, descriptor: DownloadDescriptor, progress_step: f32) -> Self {
        Self {
            id: TaskId::next(),
            batch_id,
            total_size: descriptor.expected_size,
            descriptor,
            state: TaskState::Pending,
            hold: None,
            attached: false,
            bytes_received: 0,
            position: 0,
            resumable_offset: 0,
            outcome: None,
            last_error: None,
            progress_gate: ProgressGate::new(progress_step),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn descriptor(&self) -> &DownloadDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Bytes received so far and the total, once known
    pub fn current_progress(&self) -> (u64, Option<u64>) {
        (self.bytes_received, self.total_size)
    }

    /// Eligible for a transfer slot
    pub(crate) fn is_runnable(&self) -> bool {
        !self.attached
            && match self.state {
                TaskState::Pending => true,
                TaskState::Suspended => self.hold.is_none(),
                _ => false,
            }
    }

    /// Advance the committed position by `delta`, returning newly counted bytes
    ///
    /// Bytes below the high-water mark were already counted by an earlier
    /// attempt and are not counted again.
    pub(crate) fn advance(&mut self, delta: u64) -> u64 {
        self.position += delta;
        self.raise_to(self.position)
    }

    /// Move the high-water mark up to `position`, returning newly counted bytes
    pub(crate) fn raise_to(&mut self, position: u64) -> u64 {
        if position > self.bytes_received {
            let fresh = position - self.bytes_received;
            self.bytes_received = position;
            fresh
        } else {
            0
        }
    }

    /// Fraction complete in percent, when the size is known
    pub(crate) fn percent(&self) -> Option<f32> {
        percent_of(self.bytes_received, self.total_size)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            batch_id: self.batch_id,
            url: self.descriptor.url.clone(),
            destination: self.descriptor.destination.clone(),
            state: self.state,
            suspend_reason: if self.state == TaskState::Suspended {
                self.hold
            } else {
                None
            },
            bytes_received: self.bytes_received,
            total_size: self.total_size,
            resumable_offset: self.resumable_offset,
            outcome: self.outcome,
            last_error: self.last_error.clone(),
        }
    }
}

/// Point-in-time copy of a task, handed to observers and pollers
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub batch_id: BatchId,
    pub url: String,
    pub destination: PathBuf,
    pub state: TaskState,
    pub suspend_reason: Option<SuspendReason>,
    pub bytes_received: u64,
    pub total_size: Option<u64>,
    pub resumable_offset: u64,
    pub outcome: Option<TransferOutcome>,
    pub last_error: Option<Arc<DownloadError>>,
}

impl TaskSnapshot {
    /// Percent complete, when the size is known
    pub fn progress(&self) -> Option<f32> {
        percent_of(self.bytes_received, self.total_size)
    }
}

pub(crate) fn percent_of(received: u64, total: Option<u64>) -> Option<f32> {
    match total {
        Some(0) => Some(100.0),
        Some(total) => Some((received as f64 / total as f64 * 100.0).min(100.0) as f32),
        None => None,
    }
}
