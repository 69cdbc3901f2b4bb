//! Scheduler state machine
//!
//! Every mutation of scheduler state happens in this module, under the
//! scheduler mutex. Nothing here awaits or touches the filesystem or the
//! network: transfers and cleanups are handed to the engine, and
//! notifications are queued for the notifier task.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::downloader::batch::{BatchSnapshot, BatchStatus, DownloadBatch};
use crate::downloader::config::DownloadConfig;
use crate::downloader::core::files::create_temp_path;
use crate::downloader::core::progress::ProgressGate;
use crate::downloader::core::{
    DownloadDescriptor, DownloadError, HashAlgorithm, RateSampler, Result, SchedulerEvent, TaskRate,
};
use crate::downloader::engine::{EngineEvent, EngineEventKind, TransferControl, TransferEngine, TransferJob};
use crate::downloader::task::{DownloadTask, SuspendReason, TaskId, TaskSnapshot, TaskState};

/// Lifecycle of the manager itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerPhase {
    Idle,
    Downloading,
    Suspended,
}

pub(crate) struct SchedulerState {
    engine: TransferEngine,
    notices: mpsc::UnboundedSender<SchedulerEvent>,
    max_concurrent: usize,
    progress_step: f32,
    rate_window: Duration,

    phase: ManagerPhase,
    suspend_reason: Option<SuspendReason>,
    reachable: bool,
    hash_algorithm: HashAlgorithm,
    shut_down: bool,

    current: Option<DownloadBatch>,
    pending: VecDeque<DownloadBatch>,
    /// Finished or cancelled batches with cleanup still running
    retiring: Vec<DownloadBatch>,
    finished: Vec<BatchSnapshot>,

    controls: HashMap<TaskId, TransferControl>,
    samplers: HashMap<TaskId, RateSampler>,

    initial_downloaded_bytes: u64,
    total_bytes: Option<u64>,
    /// Bytes first received since the manager last left Idle
    run_received: u64,
    /// Known sizes of batches retired since the manager last left Idle
    run_retired_total: u64,
    progress_gate: ProgressGate,
}

fn emit(notices: &mpsc::UnboundedSender<SchedulerEvent>, event: SchedulerEvent) {
    // The notifier only goes away on shutdown
    let _ = notices.send(event);
}

/// Batch holding `id`, searched across every live batch
fn locate<'a>(
    current: &'a mut Option<DownloadBatch>,
    pending: &'a mut VecDeque<DownloadBatch>,
    retiring: &'a mut [DownloadBatch],
    id: TaskId,
) -> Option<&'a mut DownloadBatch> {
    current
        .iter_mut()
        .chain(pending.iter_mut())
        .chain(retiring.iter_mut())
        .find(|batch| batch.task(id).is_some())
}

impl SchedulerState {
    pub(crate) fn new(
        config: &DownloadConfig,
        engine: TransferEngine,
        notices: mpsc::UnboundedSender<SchedulerEvent>,
        reachable: bool,
    ) -> Self {
        Self {
            engine,
            notices,
            max_concurrent: config.max_concurrent_downloads,
            progress_step: config.progress_step_percent,
            rate_window: config.rate_window,
            phase: ManagerPhase::Idle,
            suspend_reason: None,
            reachable,
            hash_algorithm: config.hash_algorithm,
            shut_down: false,
            current: None,
            pending: VecDeque::new(),
            retiring: Vec::new(),
            finished: Vec::new(),
            controls: HashMap::new(),
            samplers: HashMap::new(),
            initial_downloaded_bytes: 0,
            total_bytes: None,
            run_received: 0,
            run_retired_total: 0,
            progress_gate: ProgressGate::new(config.progress_step_percent),
        }
    }

    // ---- queries ----

    pub(crate) fn phase(&self) -> ManagerPhase {
        self.phase
    }

    pub(crate) fn suspend_reason(&self) -> Option<SuspendReason> {
        self.suspend_reason
    }

    pub(crate) fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    pub(crate) fn set_hash_algorithm(&mut self, algorithm: HashAlgorithm) {
        self.hash_algorithm = algorithm;
    }

    pub(crate) fn set_initial_downloaded_bytes(&mut self, bytes: u64) {
        self.initial_downloaded_bytes = bytes;
    }

    pub(crate) fn set_total_bytes(&mut self, bytes: u64) {
        self.total_bytes = (bytes > 0).then_some(bytes);
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn live_batches(&self) -> impl Iterator<Item = &DownloadBatch> {
        self.current.iter().chain(self.pending.iter()).chain(self.retiring.iter())
    }

    fn find_task(&self, id: TaskId) -> Option<&DownloadTask> {
        self.live_batches().find_map(|batch| batch.task(id))
    }

    /// Snapshot of a live or retired task
    pub(crate) fn task_snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.find_task(id).map(DownloadTask::snapshot).or_else(|| {
            self.finished
                .iter()
                .flat_map(|batch| batch.tasks.iter())
                .find(|task| task.id == id)
                .cloned()
        })
    }

    /// Snapshot once the task is terminal with nothing left running for it
    pub(crate) fn settled_snapshot(&self, id: TaskId) -> Option<Option<TaskSnapshot>> {
        match self.find_task(id) {
            Some(task) if task.state().is_terminal() && !task.attached => Some(Some(task.snapshot())),
            Some(_) => None,
            None => Some(self.task_snapshot(id)),
        }
    }

    /// Active or waiting for a slot in a batch the manager is working through
    pub(crate) fn is_downloading(&self) -> bool {
        self.phase == ManagerPhase::Downloading
            && self
                .current
                .iter()
                .chain(self.pending.iter())
                .flat_map(|batch| batch.tasks())
                .any(|task| task.state() == TaskState::Active || task.is_runnable())
    }

    /// Idle with every cleanup finished
    pub(crate) fn is_idle(&self) -> bool {
        self.phase == ManagerPhase::Idle && self.retiring.is_empty()
    }

    pub(crate) fn downloading_tasks(&self) -> Vec<TaskSnapshot> {
        self.current
            .iter()
            .flat_map(|batch| batch.tasks())
            .map(DownloadTask::snapshot)
            .collect()
    }

    pub(crate) fn rates(&self, now: Instant) -> Vec<TaskRate> {
        self.current
            .iter()
            .flat_map(|batch| batch.tasks())
            .filter(|task| task.state() == TaskState::Active)
            .map(|task| {
                let (received, total) = task.current_progress();
                let (bytes_per_second, remaining) = match self.samplers.get(&task.id()) {
                    Some(sampler) => (sampler.rate(now), sampler.remaining(now, received, total)),
                    None => (0.0, None),
                };
                TaskRate {
                    task_id: task.id(),
                    bytes_per_second,
                    remaining,
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn sampled_tasks(&self) -> usize {
        self.samplers.len()
    }

    /// Seeded baseline plus everything received this run, against the known total
    pub(crate) fn aggregate_progress(&self) -> (u64, u64) {
        let received = self.initial_downloaded_bytes + self.run_received;
        let total = match self.total_bytes {
            Some(total) => total,
            None => {
                self.initial_downloaded_bytes
                    + self.run_retired_total
                    + self.live_batches().map(|b| b.aggregate_progress().1).sum::<u64>()
            }
        };
        (received, total)
    }

    pub(crate) fn drain_finished(&mut self) -> Vec<BatchSnapshot> {
        std::mem::take(&mut self.finished)
    }

    // ---- submission ----

    /// Queue a batch behind any existing ones and return its task ids
    pub(crate) fn enqueue(&mut self, descriptors: Vec<DownloadDescriptor>) -> Result<Vec<TaskId>> {
        self.ensure_open()?;
        let batch = DownloadBatch::from_descriptors(descriptors, self.progress_step);
        let ids = batch.tasks().iter().map(DownloadTask::id).collect();
        debug!("Queued {} with {} tasks", batch.id(), batch.tasks().len());
        self.pending.push_back(batch);
        self.promote();
        Ok(ids)
    }

    /// Append one descriptor to the current batch, creating it if needed
    pub(crate) fn add_task(&mut self, descriptor: DownloadDescriptor) -> Result<TaskId> {
        self.ensure_open()?;
        self.promote();
        let progress_step = self.progress_step;
        let notices = &self.notices;
        let batch = self.current.get_or_insert_with(|| {
            let batch = DownloadBatch::with_progress_step(progress_step);
            info!("{} is now current", batch.id());
            emit(
                notices,
                SchedulerEvent::BatchPromoted {
                    batch_id: batch.id(),
                    tasks: 0,
                },
            );
            batch
        });
        let id = batch.add_task(descriptor).id();
        debug!("Added {} to {}", id, batch.id());
        if self.phase == ManagerPhase::Downloading {
            self.pump();
        }
        Ok(id)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shut_down {
            return Err(DownloadError::Cancelled {
                reason: "scheduler has been shut down".to_string(),
                url: None,
            });
        }
        Ok(())
    }

    // ---- manager commands ----

    pub(crate) fn start(&mut self) {
        if self.shut_down || self.phase != ManagerPhase::Idle {
            return;
        }
        self.promote();
        if self.current.is_none() {
            return;
        }

        self.begin_run();
        if !self.reachable {
            info!("Offline; downloads start when connectivity returns");
            self.phase = ManagerPhase::Suspended;
            self.suspend_reason = Some(SuspendReason::Connectivity);
            emit(
                &self.notices,
                SchedulerEvent::Suspended {
                    reason: SuspendReason::Connectivity,
                },
            );
            return;
        }

        info!("Downloading started");
        self.phase = ManagerPhase::Downloading;
        self.pump();
    }

    pub(crate) fn suspend_all(&mut self) {
        if self.phase == ManagerPhase::Idle {
            return;
        }
        info!("Suspending all downloads");
        self.hold_active(SuspendReason::Manual);
        // Connectivity holds become manual so a reconnect leaves them alone
        self.rehold(Some(SuspendReason::Connectivity), Some(SuspendReason::Manual));
        if self.suspend_reason != Some(SuspendReason::Manual) {
            self.phase = ManagerPhase::Suspended;
            self.suspend_reason = Some(SuspendReason::Manual);
            emit(
                &self.notices,
                SchedulerEvent::Suspended {
                    reason: SuspendReason::Manual,
                },
            );
        }
    }

    pub(crate) fn continue_all(&mut self) {
        match self.phase {
            ManagerPhase::Idle => self.start(),
            ManagerPhase::Downloading => {
                // Lift holds placed on individual tasks
                self.rehold(Some(SuspendReason::Manual), None);
                self.pump();
            }
            ManagerPhase::Suspended => {
                if !self.reachable {
                    info!("Still offline; downloads resume when connectivity returns");
                    self.rehold(Some(SuspendReason::Manual), Some(SuspendReason::Connectivity));
                    self.suspend_reason = Some(SuspendReason::Connectivity);
                    return;
                }
                info!("Resuming downloads");
                self.rehold(Some(SuspendReason::Manual), None);
                self.rehold(Some(SuspendReason::Connectivity), None);
                self.phase = ManagerPhase::Downloading;
                self.suspend_reason = None;
                emit(&self.notices, SchedulerEvent::Resumed);
                self.pump();
            }
        }
    }

    pub(crate) fn on_reachability(&mut self, reachable: bool) {
        if self.reachable == reachable {
            return;
        }
        self.reachable = reachable;

        if !reachable {
            if self.phase == ManagerPhase::Downloading {
                warn!("Connectivity lost; suspending active downloads");
                self.hold_active(SuspendReason::Connectivity);
                self.phase = ManagerPhase::Suspended;
                self.suspend_reason = Some(SuspendReason::Connectivity);
                emit(
                    &self.notices,
                    SchedulerEvent::Suspended {
                        reason: SuspendReason::Connectivity,
                    },
                );
            }
            return;
        }

        if self.phase == ManagerPhase::Suspended && self.suspend_reason == Some(SuspendReason::Connectivity) {
            info!("Connectivity restored; resuming downloads");
            self.rehold(Some(SuspendReason::Connectivity), None);
            self.phase = ManagerPhase::Downloading;
            self.suspend_reason = None;
            emit(&self.notices, SchedulerEvent::Resumed);
            self.pump();
        } else {
            debug!("Connectivity restored; manager stays {:?}", self.phase);
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        let mut batches: Vec<DownloadBatch> = self.current.take().into_iter().collect();
        batches.extend(self.pending.drain(..));
        if !batches.is_empty() {
            info!("Cancelling {} outstanding batches", batches.len());
        }

        for mut batch in batches {
            for task in batch.tasks_mut() {
                cancel_task(task, &self.controls, &self.engine, &self.notices);
            }
            batch.status = BatchStatus::Cancelled;
            self.retiring.push(batch);
        }

        self.phase = ManagerPhase::Idle;
        self.suspend_reason = None;
        self.sweep();
    }

    pub(crate) fn shut_down(&mut self) {
        self.cancel_all();
        self.shut_down = true;
    }

    // ---- task commands ----

    pub(crate) fn start_task(&mut self, id: TaskId) -> Result<()> {
        let in_current = self.current.as_ref().is_some_and(|b| b.task(id).is_some());
        let batch = locate(&mut self.current, &mut self.pending, &mut self.retiring, id)
            .ok_or(DownloadError::TaskNotFound { task_id: id.get() })?;
        let task = batch
            .task_mut(id)
            .ok_or(DownloadError::TaskNotFound { task_id: id.get() })?;

        if let Err(error) = task.descriptor().validate() {
            if !task.state().is_terminal() {
                fail_task(task, error_copy(&error), &self.notices);
                self.pump();
            }
            return Err(error);
        }

        match task.state() {
            TaskState::Suspended => task.hold = None,
            TaskState::Pending => {}
            _ => return Ok(()),
        }

        if in_current && self.phase == ManagerPhase::Idle {
            self.start();
        } else {
            self.pump();
        }
        Ok(())
    }

    pub(crate) fn suspend_task(&mut self, id: TaskId) -> Result<bool> {
        let batch = locate(&mut self.current, &mut self.pending, &mut self.retiring, id)
            .ok_or(DownloadError::TaskNotFound { task_id: id.get() })?;
        let task = batch
            .task_mut(id)
            .ok_or(DownloadError::TaskNotFound { task_id: id.get() })?;

        match task.state() {
            TaskState::Active => {
                task.state = TaskState::Suspended;
                task.hold = Some(SuspendReason::Manual);
                if let Some(control) = self.controls.get(&id) {
                    control.suspend();
                }
                debug!("Suspending {}", id);
                Ok(true)
            }
            TaskState::Pending => {
                task.state = TaskState::Suspended;
                task.hold = Some(SuspendReason::Manual);
                emit(&self.notices, SchedulerEvent::TaskSuspended(task.snapshot()));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn cancel_task(&mut self, id: TaskId) -> Result<bool> {
        let batch = locate(&mut self.current, &mut self.pending, &mut self.retiring, id)
            .ok_or(DownloadError::TaskNotFound { task_id: id.get() })?;
        let task = batch
            .task_mut(id)
            .ok_or(DownloadError::TaskNotFound { task_id: id.get() })?;
        let cancelled = cancel_task(task, &self.controls, &self.engine, &self.notices);
        if cancelled {
            self.pump();
        }
        Ok(cancelled)
    }

    // ---- engine events ----

    pub(crate) fn apply(&mut self, event: EngineEvent) {
        let EngineEvent { task_id, kind } = event;
        let now = Instant::now();
        let Some(batch) = locate(&mut self.current, &mut self.pending, &mut self.retiring, task_id) else {
            debug!("Dropping engine event for unknown {}", task_id);
            return;
        };

        let mut fresh = 0;
        match kind {
            EngineEventKind::Started {
                offset,
                total_size,
                restarted,
            } => {
                if let Some(task) = batch.task_mut(task_id) {
                    if total_size.is_some() {
                        task.total_size = total_size;
                    }
                    task.resumable_offset = offset;
                }
                fresh = batch.raise_task(task_id, offset);
                if let Some(task) = batch.task(task_id) {
                    if restarted {
                        info!("{} restarted from zero", task_id);
                    } else if offset > 0 {
                        info!("{} resuming from byte {}", task_id, offset);
                    }
                    self.samplers
                        .entry(task_id)
                        .or_insert_with(|| RateSampler::new(self.rate_window))
                        .record(now, task.bytes_received);
                    emit(&self.notices, SchedulerEvent::TaskStarted(task.snapshot()));
                }
            }
            EngineEventKind::Progress { delta } => {
                fresh = batch.advance_task(task_id, delta);
                if let Some(task) = batch.task(task_id) {
                    self.samplers
                        .entry(task_id)
                        .or_insert_with(|| RateSampler::new(self.rate_window))
                        .record(now, task.bytes_received);
                }
            }
            EngineEventKind::Retrying { attempt, error } => {
                if let Some(task) = batch.task_mut(task_id) {
                    task.last_error = Some(error.clone());
                }
                emit(
                    &self.notices,
                    SchedulerEvent::TaskRetrying {
                        task_id,
                        attempt,
                        error,
                    },
                );
            }
            EngineEventKind::Finished(outcome) => {
                self.controls.remove(&task_id);
                self.samplers.remove(&task_id);
                let cancelled = batch
                    .task(task_id)
                    .is_some_and(|task| task.state() == TaskState::Cancelled);

                if cancelled {
                    // Cancel raced the final rename; the file must not stay behind
                    if let Some(task) = batch.task(task_id) {
                        warn!("{} completed after cancellation; removing output", task_id);
                        self.engine.discard(task_id, vec![task.descriptor().destination.clone()]);
                    }
                } else {
                    let size = outcome.size();
                    fresh = batch.raise_task(task_id, size);
                    if let Some(task) = batch.task_mut(task_id) {
                        task.attached = false;
                        task.total_size = Some(size);
                        task.outcome = Some(outcome);
                        task.state = TaskState::Completed;
                        task.hold = None;
                        task.last_error = None;
                        emit(&self.notices, SchedulerEvent::TaskFinished(task.snapshot()));
                    }
                }
            }
            EngineEventKind::Failed(error) => {
                self.controls.remove(&task_id);
                self.samplers.remove(&task_id);
                if let Some(task) = batch.task_mut(task_id) {
                    task.attached = false;
                    if task.state() == TaskState::Cancelled {
                        debug!("{} failed after cancellation: {}", task_id, error);
                        discard_partial(task, &self.engine);
                    } else {
                        fail_task(task, error, &self.notices);
                    }
                }
            }
            EngineEventKind::Suspended { offset } => {
                self.controls.remove(&task_id);
                if let Some(sampler) = self.samplers.get_mut(&task_id) {
                    sampler.reset();
                }
                if let Some(task) = batch.task_mut(task_id) {
                    task.attached = false;
                    match task.state() {
                        // Cancelled after the worker had already settled on suspending
                        TaskState::Cancelled => discard_partial(task, &self.engine),
                        _ => {
                            task.state = TaskState::Suspended;
                            task.resumable_offset = offset;
                            task.position = offset;
                            debug!("{} suspended at byte {}", task_id, offset);
                            emit(&self.notices, SchedulerEvent::TaskSuspended(task.snapshot()));
                        }
                    }
                }
            }
            EngineEventKind::Cancelled => {
                self.controls.remove(&task_id);
                self.samplers.remove(&task_id);
                if let Some(task) = batch.task_mut(task_id) {
                    task.attached = false;
                    task.state = TaskState::Cancelled;
                    task.resumable_offset = 0;
                }
            }
            EngineEventKind::Discarded => {
                self.samplers.remove(&task_id);
                if let Some(task) = batch.task_mut(task_id) {
                    task.attached = false;
                    task.resumable_offset = 0;
                }
            }
        }

        if fresh > 0 {
            self.run_received += fresh;
        }
        self.report_task_progress(task_id);
        if fresh > 0 {
            self.report_aggregate_progress();
        }
        self.pump();
    }

    // ---- internals ----

    fn begin_run(&mut self) {
        self.run_received = self.live_batches().map(|b| b.aggregate_progress().0).sum();
        self.run_retired_total = 0;
        self.progress_gate.reset();
    }

    /// Make the next pending batch current once the current one is complete
    fn promote(&mut self) {
        loop {
            if let Some(current) = &self.current {
                if !current.is_complete() {
                    return;
                }
            }
            if let Some(mut done) = self.current.take() {
                if done.status == BatchStatus::Open {
                    done.status = BatchStatus::Completed;
                }
                info!("{} finished", done.id());
                emit(&self.notices, SchedulerEvent::BatchFinished { batch_id: done.id() });
                self.retiring.push(done);
            }
            match self.pending.pop_front() {
                Some(next) => {
                    info!("{} is now current ({} tasks)", next.id(), next.tasks().len());
                    emit(
                        &self.notices,
                        SchedulerEvent::BatchPromoted {
                            batch_id: next.id(),
                            tasks: next.tasks().len(),
                        },
                    );
                    self.current = Some(next);
                }
                None => return,
            }
        }
    }

    /// Launch runnable tasks, promote completed batches, detect the end of the run
    fn pump(&mut self) {
        loop {
            self.promote();
            if self.phase != ManagerPhase::Downloading {
                break;
            }
            self.launch_runnable();
            if !self.current.as_ref().is_some_and(DownloadBatch::is_complete) {
                break;
            }
        }
        self.sweep();
        self.settle();
    }

    fn launch_runnable(&mut self) {
        let Some(batch) = self.current.as_mut() else {
            return;
        };

        for task in batch.tasks_mut() {
            if self.controls.len() >= self.max_concurrent {
                break;
            }
            if !task.is_runnable() {
                continue;
            }

            let url = match task.descriptor().validate() {
                Ok(url) => url,
                Err(error) => {
                    fail_task(task, error, &self.notices);
                    continue;
                }
            };

            let descriptor = task.descriptor();
            let job = TransferJob {
                task_id: task.id(),
                url,
                destination: descriptor.destination.clone(),
                expected_size: descriptor.expected_size,
                expected_hash: descriptor.expected_hash.clone(),
                algorithm: descriptor.effective_algorithm(self.hash_algorithm),
            };
            debug!("Launching {} ({} running)", task.id(), self.controls.len() + 1);
            let control = self.engine.launch(job);
            self.controls.insert(task.id(), control);
            task.state = TaskState::Active;
            task.hold = None;
            task.attached = true;
        }
    }

    /// Move retiring batches with no running cleanup to the finished list
    fn sweep(&mut self) {
        let mut still_running = Vec::new();
        for batch in self.retiring.drain(..) {
            if batch.has_attached() {
                still_running.push(batch);
            } else {
                self.run_retired_total += batch.aggregate_progress().1;
                self.finished.push(batch.snapshot());
            }
        }
        self.retiring = still_running;
    }

    /// Return to Idle once the current and queued batches are all done
    fn settle(&mut self) {
        if self.phase != ManagerPhase::Idle && self.current.is_none() && self.pending.is_empty() {
            info!("All batches finished");
            self.phase = ManagerPhase::Idle;
            self.suspend_reason = None;
            emit(&self.notices, SchedulerEvent::AllFinished);
        }
    }

    /// Suspend every Active task of the current batch with `reason`
    fn hold_active(&mut self, reason: SuspendReason) {
        let Some(batch) = self.current.as_mut() else {
            return;
        };
        for task in batch.tasks_mut() {
            if task.state() == TaskState::Active {
                task.state = TaskState::Suspended;
                task.hold = Some(reason);
                if let Some(control) = self.controls.get(&task.id()) {
                    control.suspend();
                }
            }
        }
    }

    /// Replace the hold of every suspended task currently held for `from`
    fn rehold(&mut self, from: Option<SuspendReason>, to: Option<SuspendReason>) {
        for batch in self.current.iter_mut().chain(self.pending.iter_mut()) {
            for task in batch.tasks_mut() {
                if task.state() == TaskState::Suspended && task.hold == from {
                    task.hold = to;
                }
            }
        }
    }

    fn report_task_progress(&mut self, task_id: TaskId) {
        let Some(batch) = locate(&mut self.current, &mut self.pending, &mut self.retiring, task_id) else {
            return;
        };
        let Some(task) = batch.task_mut(task_id) else {
            return;
        };
        if let Some(percent) = task.percent() {
            if task.progress_gate.advance(percent) {
                emit(
                    &self.notices,
                    SchedulerEvent::TaskProgress {
                        percent,
                        task: task.snapshot(),
                    },
                );
            }
        }
    }

    fn report_aggregate_progress(&mut self) {
        let (received, total) = self.aggregate_progress();
        if total == 0 {
            return;
        }
        let percent = (received as f64 / total as f64 * 100.0).min(100.0) as f32;
        if self.progress_gate.advance(percent) {
            emit(
                &self.notices,
                SchedulerEvent::Progress {
                    percent,
                    bytes_received: received,
                    total_bytes: total,
                },
            );
        }
    }
}

/// Mark a non-terminal task Cancelled and make sure its partial output goes away
fn cancel_task(
    task: &mut DownloadTask,
    controls: &HashMap<TaskId, TransferControl>,
    engine: &TransferEngine,
    notices: &mpsc::UnboundedSender<SchedulerEvent>,
) -> bool {
    if task.state().is_terminal() {
        return false;
    }
    task.state = TaskState::Cancelled;
    task.hold = None;

    match controls.get(&task.id()) {
        Some(control) => control.cancel(),
        None => discard_partial(task, engine),
    }
    debug!("Cancelled {}", task.id());
    emit(notices, SchedulerEvent::TaskCancelled(task.snapshot()));
    true
}

/// Remove the task's `.part` file, keeping the task attached until that is done
fn discard_partial(task: &mut DownloadTask, engine: &TransferEngine) {
    task.attached = true;
    task.resumable_offset = 0;
    engine.discard(task.id(), vec![create_temp_path(&task.descriptor().destination)]);
}

fn fail_task(task: &mut DownloadTask, error: DownloadError, notices: &mpsc::UnboundedSender<SchedulerEvent>) {
    warn!("{} failed: {}", task.id(), error);
    task.state = TaskState::Failed;
    task.hold = None;
    task.last_error = Some(Arc::new(error));
    emit(notices, SchedulerEvent::TaskFailed(task.snapshot()));
}

/// Descriptor errors are re-derived so both the caller and the task get one
fn error_copy(error: &DownloadError) -> DownloadError {
    match error {
        DownloadError::UnsupportedUrl {
            url,
            scheme,
            supported_schemes,
        } => DownloadError::UnsupportedUrl {
            url: url.clone(),
            scheme: scheme.clone(),
            supported_schemes: supported_schemes.clone(),
        },
        other => DownloadError::InvalidDescriptor {
            url: match other {
                DownloadError::InvalidDescriptor { url, .. } | DownloadError::InvalidUrl { url, .. } => url.clone(),
                _ => String::new(),
            },
            reason: other.to_string(),
        },
    }
}
