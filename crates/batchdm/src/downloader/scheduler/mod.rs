//! Batch scheduler
//!
//! [`BatchScheduler`] is the manager callers talk to. It keeps an ordered
//! queue of batches, runs the tasks of the current batch up to the configured
//! concurrency, follows network reachability, and reports to observers.
//!
//! All state lives behind one mutex. Commands, engine reports and
//! reachability changes are applied under it, one at a time, so every
//! transition is serialized. Two background tasks run on the caller's tokio
//! runtime:
//!
//! - the driver, feeding engine reports and reachability changes into the state
//! - the notifier, delivering events to observers outside the lock

mod notify;
mod state;

pub use state::ManagerPhase;

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::downloader::batch::BatchSnapshot;
use crate::downloader::config::DownloadConfig;
use crate::downloader::core::{
    DataObserver, DownloadDescriptor, DownloadError, DownloadMetrics, DownloadMetricsSnapshot, HashAlgorithm,
    HttpTransport, Result, SchedulerEvent, TaskRate, Transport, UiObserver,
};
use crate::downloader::engine::{EngineEvent, TransferEngine};
use crate::downloader::reachability::ReachabilitySource;
use crate::downloader::task::{SuspendReason, TaskId, TaskSnapshot, TaskState};

use notify::{run_notifier, Observers};
use state::SchedulerState;

struct Shared {
    state: Mutex<SchedulerState>,
    observers: Arc<Observers>,
    metrics: Arc<DownloadMetrics>,
    changed: Notify,
    shutdown: CancellationToken,
}

impl Shared {
    /// Mutate the state and wake anyone waiting on it
    fn update<R>(&self, f: impl FnOnce(&mut SchedulerState) -> R) -> R {
        let result = f(&mut *self.state.lock());
        self.changed.notify_waiters();
        result
    }

    fn read<R>(&self, f: impl FnOnce(&SchedulerState) -> R) -> R {
        f(&*self.state.lock())
    }

    /// Resolve once `check` yields a value
    async fn wait_for<R>(&self, mut check: impl FnMut(&SchedulerState) -> Option<R>) -> R {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a change in between is not lost
            notified.as_mut().enable();

            let ready = {
                let state = self.state.lock();
                check(&*state)
            };
            if let Some(value) = ready {
                return value;
            }
            notified.await;
        }
    }
}

/// Batch download manager
///
/// Cheap to clone; clones share the same queue. Must be created inside a
/// tokio runtime.
///
/// ```no_run
/// # async fn demo() -> batchdm::downloader::Result<()> {
/// use batchdm::downloader::{BatchScheduler, DownloadConfig, DownloadDescriptor, ManualReachability};
///
/// let scheduler = BatchScheduler::with_http(DownloadConfig::default(), &ManualReachability::default())?;
/// scheduler.download_batch(vec![DownloadDescriptor::new(
///     "https://example.com/data.bin",
///     "downloads/data.bin",
/// )])?;
/// scheduler.wait_until_idle().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BatchScheduler {
    shared: Arc<Shared>,
}

impl BatchScheduler {
    /// Create a scheduler using `transport` for every transfer
    pub fn new(
        config: DownloadConfig,
        transport: Arc<dyn Transport>,
        reachability: &dyn ReachabilitySource,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| DownloadError::Configuration {
            message: format!("BatchScheduler needs a tokio runtime: {}", e),
            field: None,
            suggestion: Some("Create the scheduler from within an async context".to_string()),
        })?;

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let mut reach_rx = reachability.subscribe();
        let reachable = *reach_rx.borrow_and_update();

        let metrics = Arc::new(DownloadMetrics::default());
        let engine = TransferEngine::new(config.clone(), transport, engine_tx, metrics.clone(), runtime.clone());
        let observers = Arc::new(Observers::new());
        let shutdown = CancellationToken::new();

        let shared = Arc::new(Shared {
            state: Mutex::new(SchedulerState::new(&config, engine, notice_tx, reachable)),
            observers: observers.clone(),
            metrics,
            changed: Notify::new(),
            shutdown: shutdown.clone(),
        });

        runtime.spawn(run_notifier(observers, notice_rx, shutdown.clone()));
        runtime.spawn(drive(Arc::downgrade(&shared), engine_rx, reach_rx, shutdown));

        info!(
            "Batch scheduler ready (max {} concurrent, {} retries, {})",
            config.max_concurrent_downloads,
            config.max_retries,
            if reachable { "online" } else { "offline" }
        );
        Ok(Self { shared })
    }

    /// Create a scheduler backed by [`HttpTransport`]
    pub fn with_http(config: DownloadConfig, reachability: &dyn ReachabilitySource) -> Result<Self> {
        let transport = HttpTransport::from_config(&config)?;
        Self::new(config, Arc::new(transport), reachability)
    }

    // ---- batches and tasks ----

    /// Queue a batch and start downloading
    ///
    /// The batch becomes current when no other batch is, otherwise it runs
    /// after every batch queued before it.
    pub fn download_batch(&self, descriptors: Vec<DownloadDescriptor>) -> Result<Vec<TaskHandle>> {
        let ids = self.shared.update(|state| {
            let ids = state.enqueue(descriptors)?;
            state.start();
            Ok::<_, DownloadError>(ids)
        })?;
        Ok(self.handles(ids))
    }

    /// Queue a batch without starting it
    pub fn add_batch(&self, descriptors: Vec<DownloadDescriptor>) -> Result<Vec<TaskHandle>> {
        let ids = self.shared.update(|state| state.enqueue(descriptors))?;
        Ok(self.handles(ids))
    }

    /// Append one task to the current batch, starting it right away when downloading
    pub fn add_download_task(&self, descriptor: DownloadDescriptor) -> Result<TaskHandle> {
        let id = self.shared.update(|state| state.add_task(descriptor))?;
        Ok(self.handle(id))
    }

    fn handle(&self, id: TaskId) -> TaskHandle {
        TaskHandle {
            id,
            shared: self.shared.clone(),
        }
    }

    fn handles(&self, ids: Vec<TaskId>) -> Vec<TaskHandle> {
        ids.into_iter().map(|id| self.handle(id)).collect()
    }

    // ---- manager commands ----

    /// Start the current batch; no-op unless Idle with something to run
    pub fn start_downloading_current_batch(&self) {
        self.shared.update(SchedulerState::start);
    }

    /// Cancel every non-terminal task of every batch and return to Idle
    ///
    /// Partial files are removed in the background; `did_finish_all` is not
    /// reported for a cancelled run.
    pub fn cancel_all_outstanding_tasks(&self) {
        self.shared.update(SchedulerState::cancel_all);
    }

    /// Suspend active transfers, keeping partial files for a later resume
    pub fn suspend_all_ongoing_downloads(&self) {
        self.shared.update(SchedulerState::suspend_all);
    }

    /// Resume suspended work, or start the current batch when Idle
    pub fn continue_in_completed_downloads(&self) {
        self.shared.update(SchedulerState::continue_all);
    }

    /// Stop everything and refuse further work
    pub async fn shutdown(&self) {
        info!("Shutting down batch scheduler");
        self.shared.update(SchedulerState::shut_down);
        self.wait_until_idle().await;
        self.shared.shutdown.cancel();
    }

    // ---- queries ----

    /// True while transfers run or wait for a slot
    pub fn is_downloading(&self) -> bool {
        self.shared.read(SchedulerState::is_downloading)
    }

    pub fn phase(&self) -> ManagerPhase {
        self.shared.read(SchedulerState::phase)
    }

    pub fn suspend_reason(&self) -> Option<SuspendReason> {
        self.shared.read(SchedulerState::suspend_reason)
    }

    /// Rate and time remaining for each active task of the current batch
    pub fn download_rate_and_remaining_time(&self) -> Vec<TaskRate> {
        let now = Instant::now();
        self.shared.read(|state| state.rates(now))
    }

    #[cfg(test)]
    pub(crate) fn sampled_tasks(&self) -> usize {
        self.shared.read(SchedulerState::sampled_tasks)
    }

    /// Snapshots of every task in the current batch
    pub fn downloading_tasks(&self) -> Vec<TaskSnapshot> {
        self.shared.read(SchedulerState::downloading_tasks)
    }

    /// Bytes received and total bytes, including the seeded baseline
    pub fn aggregate_progress(&self) -> (u64, u64) {
        self.shared.read(SchedulerState::aggregate_progress)
    }

    /// Bytes already present before this scheduler started, counted in aggregate progress
    pub fn set_initial_downloaded_bytes(&self, bytes: u64) {
        self.shared.update(|state| state.set_initial_downloaded_bytes(bytes));
    }

    /// Override the aggregate total; 0 goes back to summing known task sizes
    pub fn set_total_bytes(&self, bytes: u64) {
        self.shared.update(|state| state.set_total_bytes(bytes));
    }

    /// Algorithm for tasks that do not name their own
    pub fn set_hash_algorithm(&self, algorithm: HashAlgorithm) {
        self.shared.update(|state| state.set_hash_algorithm(algorithm));
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.shared.read(SchedulerState::hash_algorithm)
    }

    /// Batches that finished or were cancelled since the last call
    pub fn drain_finished_batches(&self) -> Vec<BatchSnapshot> {
        self.shared.update(SchedulerState::drain_finished)
    }

    pub fn metrics(&self) -> DownloadMetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    // ---- observers ----

    pub fn set_ui_observer(&self, observer: Option<Arc<dyn UiObserver>>) {
        self.shared.observers.set_ui(observer);
    }

    pub fn set_data_observer(&self, observer: Option<Arc<dyn DataObserver>>) {
        self.shared.observers.set_data(observer);
    }

    /// Every scheduler event, in order; slow receivers may observe `Lagged`
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.shared.observers.subscribe()
    }

    /// Resolve once the manager is Idle with no cleanup running
    pub async fn wait_until_idle(&self) {
        self.shared.wait_for(|state| state.is_idle().then_some(())).await
    }
}

/// Handle to one task
#[derive(Clone)]
pub struct TaskHandle {
    id: TaskId,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Start or resume this task
    ///
    /// Fails, and marks the task Failed, when its descriptor is invalid.
    pub fn start(&self) -> Result<()> {
        self.shared.update(|state| state.start_task(self.id))
    }

    /// Suspend this task; false when it was not Pending or Active
    pub fn suspend(&self) -> bool {
        self.shared
            .update(|state| state.suspend_task(self.id))
            .unwrap_or(false)
    }

    /// Cancel this task; false when it was already terminal
    pub fn cancel(&self) -> bool {
        self.shared
            .update(|state| state.cancel_task(self.id))
            .unwrap_or(false)
    }

    /// Bytes received and the expected size, when known
    pub fn current_progress(&self) -> (u64, Option<u64>) {
        self.snapshot()
            .map_or((0, None), |task| (task.bytes_received, task.total_size))
    }

    pub fn state(&self) -> Option<TaskState> {
        self.snapshot().map(|task| task.state)
    }

    pub fn snapshot(&self) -> Option<TaskSnapshot> {
        self.shared.read(|state| state.task_snapshot(self.id))
    }

    /// Resolve once the task is terminal and its cleanup has finished
    pub async fn wait_settled(&self) -> Option<TaskSnapshot> {
        self.shared
            .wait_for(|state| state.settled_snapshot(self.id))
            .await
    }
}

/// Feed engine reports and reachability changes into the state
async fn drive(
    shared: Weak<Shared>,
    mut engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    mut reach_rx: watch::Receiver<bool>,
    shutdown: CancellationToken,
) {
    let mut watching = true;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = engine_rx.recv() => {
                let Some(event) = event else { break };
                let Some(shared) = shared.upgrade() else { break };
                shared.update(|state| state.apply(event));
            }
            changed = reach_rx.changed(), if watching => {
                if changed.is_err() {
                    debug!("Reachability source closed; keeping last known state");
                    watching = false;
                    continue;
                }
                let reachable = *reach_rx.borrow_and_update();
                let Some(shared) = shared.upgrade() else { break };
                shared.update(|state| state.on_reachability(reachable));
            }
            else => break,
        }
    }
    debug!("Scheduler driver stopped");
}
