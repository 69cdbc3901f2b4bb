//! Download batches
//!
//! A batch is an insertion-ordered group of tasks submitted together. It owns
//! its tasks and keeps the aggregate byte counter that progress reporting
//! reads. The counter only ever grows by deltas applied under the scheduler
//! lock, so it is monotonic even while transfers restart or run concurrently.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::downloader::core::DownloadDescriptor;
use crate::downloader::task::{DownloadTask, TaskId, TaskSnapshot, TaskState};

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique batch identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

impl BatchId {
    pub(crate) fn next() -> Self {
        BatchId(NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Accepting tasks, some may still be running
    Open,
    /// Every task reached a terminal state
    Completed,
    /// Cancelled as a whole by the caller
    Cancelled,
}

/// Ordered collection of tasks tracked together
#[derive(Debug)]
pub struct DownloadBatch {
    id: BatchId,
    tasks: Vec<DownloadTask>,
    pub(crate) status: BatchStatus,
    received: u64,
    progress_step: f32,
}

impl Default for DownloadBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadBatch {
    pub fn new() -> Self {
        Self::with_progress_step(1.0)
    }

    pub(crate) fn with_progress_step(progress_step: f32) -> Self {
        Self {
            id: BatchId::next(),
            tasks: Vec::new(),
            status: BatchStatus::Open,
            received: 0,
            progress_step,
        }
    }

    pub(crate) fn from_descriptors(descriptors: Vec<DownloadDescriptor>, progress_step: f32) -> Self {
        let mut batch = Self::with_progress_step(progress_step);
        for descriptor in descriptors {
            batch.add_task(descriptor);
        }
        batch
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    /// Append a Pending task for `descriptor`
    pub fn add_task(&mut self, descriptor: DownloadDescriptor) -> &DownloadTask {
        let task = DownloadTask::new(self.id, descriptor, self.progress_step);
        self.tasks.push(task);
        &self.tasks[self.tasks.len() - 1]
    }

    /// Tasks in insertion order
    pub fn tasks(&self) -> &[DownloadTask] {
        &self.tasks
    }

    pub(crate) fn tasks_mut(&mut self) -> impl Iterator<Item = &mut DownloadTask> {
        self.tasks.iter_mut()
    }

    pub fn task(&self, id: TaskId) -> Option<&DownloadTask> {
        self.tasks.iter().find(|t| t.id() == id)
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> Option<&mut DownloadTask> {
        self.tasks.iter_mut().find(|t| t.id() == id)
    }

    /// True when every task is terminal
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.state().is_terminal())
    }

    pub fn terminal_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.state().is_terminal()).count()
    }

    /// Number of tasks in `state`
    pub fn count_in(&self, state: TaskState) -> usize {
        self.tasks.iter().filter(|t| t.state() == state).count()
    }

    /// Bytes received so far and the sum of every known task size
    ///
    /// Tasks whose size is still unknown are left out of the total.
    pub fn aggregate_progress(&self) -> (u64, u64) {
        let total = self.tasks.iter().filter_map(|t| t.total_size).sum();
        (self.received, total)
    }

    /// Advance a task by `delta` written bytes, returning bytes counted for the first time
    pub(crate) fn advance_task(&mut self, id: TaskId, delta: u64) -> u64 {
        let fresh = self.task_mut(id).map_or(0, |t| t.advance(delta));
        self.received += fresh;
        fresh
    }

    /// Move a task's committed position to `position`, returning newly counted bytes
    pub(crate) fn raise_task(&mut self, id: TaskId, position: u64) -> u64 {
        let fresh = self.task_mut(id).map_or(0, |t| {
            t.position = position;
            t.raise_to(position)
        });
        self.received += fresh;
        fresh
    }

    /// Some task still has a transfer or cleanup running
    pub(crate) fn has_attached(&self) -> bool {
        self.tasks.iter().any(|t| t.attached)
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let (bytes_received, total_bytes) = self.aggregate_progress();
        BatchSnapshot {
            id: self.id,
            status: self.status,
            tasks: self.tasks.iter().map(DownloadTask::snapshot).collect(),
            bytes_received,
            total_bytes,
        }
    }
}

/// Point-in-time copy of a batch
#[derive(Debug, Clone)]
pub struct BatchSnapshot {
    pub id: BatchId,
    pub status: BatchStatus,
    pub tasks: Vec<TaskSnapshot>,
    pub bytes_received: u64,
    pub total_bytes: u64,
}
