//! Observer fan-out
//!
//! Scheduler events are queued while the state lock is held and delivered
//! here, on a dedicated task, so observers never run under the lock and may
//! call back into the scheduler.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::downloader::core::{DataObserver, SchedulerEvent, UiObserver};

const BROADCAST_CAPACITY: usize = 1024;

pub(crate) struct Observers {
    ui: RwLock<Option<Arc<dyn UiObserver>>>,
    data: RwLock<Option<Arc<dyn DataObserver>>>,
    broadcast: broadcast::Sender<SchedulerEvent>,
}

impl Observers {
    pub(crate) fn new() -> Self {
        let (broadcast, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            ui: RwLock::new(None),
            data: RwLock::new(None),
            broadcast,
        }
    }

    pub(crate) fn set_ui(&self, observer: Option<Arc<dyn UiObserver>>) {
        *self.ui.write() = observer;
    }

    pub(crate) fn set_data(&self, observer: Option<Arc<dyn DataObserver>>) {
        *self.data.write() = observer;
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.broadcast.subscribe()
    }

    fn dispatch(&self, event: SchedulerEvent) {
        let ui = self.ui.read().clone();
        let data = self.data.read().clone();

        match &event {
            SchedulerEvent::AllFinished => {
                if let Some(ui) = &ui {
                    ui.did_finish_all();
                }
                if let Some(data) = &data {
                    data.did_finish_all_for_data();
                }
            }
            SchedulerEvent::Progress { percent, .. } => {
                if let Some(ui) = &ui {
                    ui.did_reach_progress(*percent);
                }
            }
            SchedulerEvent::TaskProgress { percent, task } => {
                if let Some(ui) = &ui {
                    ui.did_reach_individual_progress(*percent, task);
                }
            }
            SchedulerEvent::TaskFailed(task) => {
                if let Some(ui) = &ui {
                    ui.did_hit_download_error(task);
                }
            }
            SchedulerEvent::TaskFinished(task) => {
                if let Some(ui) = &ui {
                    ui.did_finish_task(task);
                }
                if let Some(data) = &data {
                    data.did_finish_download_task(task);
                }
            }
            _ => {}
        }

        // No subscribers is not an error
        let _ = self.broadcast.send(event);
    }
}

/// Deliver queued events in order until shutdown, then flush what is left
pub(crate) async fn run_notifier(
    observers: Arc<Observers>,
    mut rx: mpsc::UnboundedReceiver<SchedulerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => {
                    trace!("Delivering {:?}", event);
                    observers.dispatch(event);
                }
                None => return,
            },
            _ = shutdown.cancelled() => break,
        }
    }

    while let Ok(event) = rx.try_recv() {
        observers.dispatch(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        finished_all: AtomicUsize,
        progress: AtomicUsize,
        data_finished_all: AtomicUsize,
    }

    impl UiObserver for Counting {
        fn did_finish_all(&self) {
            self.finished_all.fetch_add(1, Ordering::SeqCst);
        }

        fn did_reach_progress(&self, _percent: f32) {
            self.progress.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl DataObserver for Counting {
        fn did_finish_all_for_data(&self) {
            self.data_finished_all.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_events_reach_observers_and_subscribers() {
        let observers = Arc::new(Observers::new());
        let counting = Arc::new(Counting::default());
        observers.set_ui(Some(counting.clone()));
        observers.set_data(Some(counting.clone()));
        let mut events = observers.subscribe();

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let notifier = tokio::spawn(run_notifier(observers.clone(), rx, shutdown.clone()));

        tx.send(SchedulerEvent::Progress {
            percent: 50.0,
            bytes_received: 5,
            total_bytes: 10,
        })
        .unwrap();
        tx.send(SchedulerEvent::AllFinished).unwrap();
        drop(tx);
        notifier.await.unwrap();

        assert_eq!(counting.progress.load(Ordering::SeqCst), 1);
        assert_eq!(counting.finished_all.load(Ordering::SeqCst), 1);
        assert_eq!(counting.data_finished_all.load(Ordering::SeqCst), 1);
        assert!(matches!(events.recv().await.unwrap(), SchedulerEvent::Progress { .. }));
        assert!(matches!(events.recv().await.unwrap(), SchedulerEvent::AllFinished));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_queued_events() {
        let observers = Arc::new(Observers::new());
        let counting = Arc::new(Counting::default());
        observers.set_ui(Some(counting.clone()));

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tx.send(SchedulerEvent::AllFinished).unwrap();
        shutdown.cancel();

        run_notifier(observers, rx, shutdown).await;
        assert_eq!(counting.finished_all.load(Ordering::SeqCst), 1);
    }
}
