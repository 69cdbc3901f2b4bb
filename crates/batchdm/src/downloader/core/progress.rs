//! Progress reporting: observers, scheduler events and rate estimation

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::downloader::batch::BatchId;
use crate::downloader::core::DownloadError;
use crate::downloader::task::{SuspendReason, TaskId, TaskSnapshot};

/// Sink for events meant to be rendered
///
/// Only `did_finish_all` is required; the rest default to no-ops.
pub trait UiObserver: Send + Sync {
    /// Every task of the current and queued batches is terminal
    fn did_finish_all(&self);

    /// Aggregate progress crossed a reporting step (0.0 to 100.0)
    fn did_reach_progress(&self, _percent: f32) {}

    fn did_hit_download_error(&self, _task: &TaskSnapshot) {}

    fn did_finish_task(&self, _task: &TaskSnapshot) {}

    /// Per-task progress crossed a reporting step
    fn did_reach_individual_progress(&self, _percent: f32, _task: &TaskSnapshot) {}
}

/// Sink for callers that persist results rather than render them
pub trait DataObserver: Send + Sync {
    fn did_finish_all_for_data(&self);

    fn did_finish_download_task(&self, _task: &TaskSnapshot) {}
}

/// Everything the scheduler reports, in the order it happened
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A batch became the current batch
    BatchPromoted {
        batch_id: BatchId,
        tasks: usize,
    },
    BatchFinished {
        batch_id: BatchId,
    },
    TaskStarted(TaskSnapshot),
    TaskRetrying {
        task_id: TaskId,
        attempt: usize,
        error: Arc<DownloadError>,
    },
    TaskSuspended(TaskSnapshot),
    TaskFinished(TaskSnapshot),
    TaskFailed(TaskSnapshot),
    TaskCancelled(TaskSnapshot),
    /// Aggregate progress crossed a reporting step
    Progress {
        percent: f32,
        bytes_received: u64,
        total_bytes: u64,
    },
    TaskProgress {
        percent: f32,
        task: TaskSnapshot,
    },
    Suspended {
        reason: SuspendReason,
    },
    Resumed,
    AllFinished,
}

/// Transfer rate and ETA for one active task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRate {
    pub task_id: TaskId,
    pub bytes_per_second: f64,
    /// Absent when the size is unknown or nothing arrived within the window
    pub remaining: Option<Duration>,
}

/// Sliding-window rate estimator over cumulative byte counts
#[derive(Debug, Clone)]
pub struct RateSampler {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
}

impl RateSampler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    /// Record the cumulative byte count observed at `at`
    pub fn record(&mut self, at: Instant, total_bytes: u64) {
        self.samples.push_back((at, total_bytes));
        // Keep one sample at or before the window start as the baseline
        while self.samples.len() > 2
            && at.saturating_duration_since(self.samples[1].0) >= self.window
        {
            self.samples.pop_front();
        }
    }

    /// Bytes per second over the window ending at `now`
    pub fn rate(&self, now: Instant) -> f64 {
        let (Some(&(first_at, first_bytes)), Some(&(last_at, last_bytes))) =
            (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };

        if now.saturating_duration_since(last_at) >= self.window {
            return 0.0;
        }

        let elapsed = last_at.saturating_duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        last_bytes.saturating_sub(first_bytes) as f64 / elapsed
    }

    /// Time left to receive `total`, when it is known and data is flowing
    pub fn remaining(&self, now: Instant, received: u64, total: Option<u64>) -> Option<Duration> {
        let total = total?;
        let rate = self.rate(now);
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(total.saturating_sub(received) as f64 / rate))
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Lets a percentage through only when it enters a higher step bucket
#[derive(Debug, Clone)]
pub struct ProgressGate {
    step: f32,
    last_bucket: u32,
}

impl ProgressGate {
    pub fn new(step: f32) -> Self {
        Self { step, last_bucket: 0 }
    }

    /// True when `percent` crossed at least one step since the last report
    pub fn advance(&mut self, percent: f32) -> bool {
        let bucket = (percent.clamp(0.0, 100.0) / self.step).floor() as u32;
        if bucket > self.last_bucket {
            self.last_bucket = bucket;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last_bucket = 0;
    }
}
