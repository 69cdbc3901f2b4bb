//! Scheduler tests driving whole batches through the engine

use super::*;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use tokio::sync::{broadcast, watch};
use url::Url;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::downloader::core::files::create_temp_path;

const WAIT: Duration = Duration::from_secs(10);

/// In-memory transport whose bodies pause after the first chunk until the gate opens
struct ScriptedTransport {
    files: HashMap<String, Vec<u8>>,
    chunk: usize,
    gate: watch::Sender<bool>,
    ignore_range: bool,
    unsized_files: Vec<String>,
    failures_left: AtomicUsize,
    hangs_left: AtomicUsize,
    fetches: Mutex<Vec<(String, u64)>>,
}

impl ScriptedTransport {
    fn new(files: &[(&str, &[u8])], chunk: usize) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            files: files
                .iter()
                .map(|(name, data)| (format!("/{}", name), data.to_vec()))
                .collect(),
            chunk,
            gate,
            ignore_range: false,
            unsized_files: Vec::new(),
            failures_left: AtomicUsize::new(0),
            hangs_left: AtomicUsize::new(0),
            fetches: Mutex::new(Vec::new()),
        }
    }

    fn ignoring_range(mut self) -> Self {
        self.ignore_range = true;
        self
    }

    fn failing_first(self, count: usize) -> Self {
        self.failures_left.store(count, Ordering::SeqCst);
        self
    }

    /// Leave the first `count` fetches without a response head
    fn hanging_first(self, count: usize) -> Self {
        self.hangs_left.store(count, Ordering::SeqCst);
        self
    }

    /// Serve `name` without reporting its size
    fn without_size(mut self, name: &str) -> Self {
        self.unsized_files.push(format!("/{}", name));
        self
    }

    fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    fn fetches(&self) -> Vec<(String, u64)> {
        self.fetches.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, url: &Url, offset: u64) -> Result<TransferResponse> {
        self.fetches.lock().push((url.path().to_string(), offset));

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DownloadError::from_status(url.as_str(), 503));
        }

        let hanging = self
            .hangs_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hanging {
            std::future::pending::<()>().await;
        }

        let Some(data) = self.files.get(url.path()) else {
            return Err(DownloadError::from_status(url.as_str(), 404));
        };

        let start = if self.ignore_range { 0 } else { offset as usize };
        let chunks: Vec<Bytes> = data[start..].chunks(self.chunk).map(Bytes::copy_from_slice).collect();
        let gate = self.gate.subscribe();
        let body = stream::unfold((chunks.into_iter(), true, gate), |(mut rest, first, mut gate)| async move {
            if !first {
                let _ = gate.wait_for(|open| *open).await;
            }
            rest.next().map(|chunk| (Ok(chunk), (rest, false, gate)))
        })
        .boxed();

        Ok(TransferResponse {
            status: if offset > 0 && !self.ignore_range { 206 } else { 200 },
            partial: offset > 0 && !self.ignore_range,
            total_size: if self.unsized_files.iter().any(|name| name == url.path()) {
                None
            } else {
                Some(data.len() as u64)
            },
            body,
        })
    }
}

/// Observer that counts callbacks
#[derive(Default)]
struct Recorder {
    finished_all: AtomicUsize,
    finished_all_for_data: AtomicUsize,
    errors: AtomicUsize,
    finished_tasks: AtomicUsize,
    task_percents: Mutex<Vec<f32>>,
}

impl UiObserver for Recorder {
    fn did_finish_all(&self) {
        self.finished_all.fetch_add(1, Ordering::SeqCst);
    }

    fn did_hit_download_error(&self, _task: &TaskSnapshot) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn did_finish_task(&self, _task: &TaskSnapshot) {
        self.finished_tasks.fetch_add(1, Ordering::SeqCst);
    }

    fn did_reach_individual_progress(&self, percent: f32, _task: &TaskSnapshot) {
        self.task_percents.lock().push(percent);
    }
}

impl DataObserver for Recorder {
    fn did_finish_all_for_data(&self) {
        self.finished_all_for_data.fetch_add(1, Ordering::SeqCst);
    }
}

fn test_config(concurrency: usize) -> DownloadConfig {
    DownloadConfig::builder()
        .max_concurrent_downloads(concurrency)
        .retry_delay(Duration::from_millis(10))
        .max_retry_delay(Duration::from_millis(50))
        .idle_timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

fn scripted_url(name: &str) -> String {
    format!("http://files.test/{}", name)
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn recorded_scheduler(
    config: DownloadConfig,
    transport: Arc<dyn Transport>,
    reachability: &ManualReachability,
) -> (BatchScheduler, Arc<Recorder>) {
    let scheduler = BatchScheduler::new(config, transport, reachability).unwrap();
    let recorder = Arc::new(Recorder::default());
    scheduler.set_ui_observer(Some(recorder.clone()));
    scheduler.set_data_observer(Some(recorder.clone()));
    (scheduler, recorder)
}

async fn wait_idle(scheduler: &BatchScheduler) {
    tokio::time::timeout(WAIT, scheduler.wait_until_idle())
        .await
        .expect("scheduler did not become idle");
}

/// Poll `condition` until it holds
async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn received(handle: &TaskHandle) -> u64 {
    handle.current_progress().0
}

fn dest(dir: &TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}

fn drain_events(rx: &mut broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn test_batch_respects_concurrency_and_finishes_once() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(
        &[("a", b"aaaaaaaa"), ("b", b"bbbbbbbb"), ("c", b"cccccccc")],
        2,
    ));
    transport.close_gate();
    let reachability = ManualReachability::new(true);
    let (scheduler, recorder) = recorded_scheduler(test_config(2), transport.clone(), &reachability);

    let handles = scheduler
        .download_batch(
            ["a", "b", "c"]
                .iter()
                .map(|name| DownloadDescriptor::new(scripted_url(name), dest(&dir, name)))
                .collect(),
        )
        .unwrap();

    eventually("two transfers", || transport.fetches().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.fetches().len(), 2, "third task must wait for a slot");
    assert_eq!(handles[2].state(), Some(TaskState::Pending));
    assert!(scheduler.is_downloading());

    transport.open_gate();
    wait_idle(&scheduler).await;

    for (handle, name) in handles.iter().zip(["a", "b", "c"]) {
        assert_eq!(handle.state(), Some(TaskState::Completed));
        assert_eq!(read(&dest(&dir, name)), name.repeat(8).into_bytes());
        assert!(!create_temp_path(&dest(&dir, name)).exists());
    }
    assert!(!scheduler.is_downloading());
    assert_eq!(scheduler.phase(), ManagerPhase::Idle);

    eventually("finish notification", || recorder.finished_all.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.finished_all.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.finished_all_for_data.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.finished_tasks.load(Ordering::SeqCst), 3);

    let finished = scheduler.drain_finished_batches();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].status, BatchStatus::Completed);
    assert_eq!(finished[0].bytes_received, 24);
    assert!(scheduler.drain_finished_batches().is_empty());
}

#[tokio::test]
async fn test_batches_run_in_submission_order() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(
        &[("one", b"1111"), ("two", b"2222"), ("three", b"3333")],
        4,
    ));
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(4), transport.clone(), &reachability);
    let mut events = scheduler.subscribe();

    let first = scheduler
        .add_batch(vec![
            DownloadDescriptor::new(scripted_url("one"), dest(&dir, "one")),
            DownloadDescriptor::new(scripted_url("two"), dest(&dir, "two")),
        ])
        .unwrap();
    let second = scheduler
        .add_batch(vec![DownloadDescriptor::new(scripted_url("three"), dest(&dir, "three"))])
        .unwrap();
    scheduler.start_downloading_current_batch();
    wait_idle(&scheduler).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = drain_events(&mut events);
    let started_at = |id: TaskId| {
        events
            .iter()
            .position(|e| matches!(e, SchedulerEvent::TaskStarted(t) if t.id == id))
            .unwrap()
    };
    let finished_at = |id: TaskId| {
        events
            .iter()
            .position(|e| matches!(e, SchedulerEvent::TaskFinished(t) if t.id == id))
            .unwrap()
    };

    let third_started = started_at(second[0].id());
    assert!(first.iter().all(|h| finished_at(h.id()) < third_started));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, SchedulerEvent::AllFinished))
            .count(),
        1
    );
    assert_eq!(scheduler.drain_finished_batches().len(), 2);
}

#[tokio::test]
async fn test_task_added_while_downloading_joins_current_batch() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("a", b"aaaaaaaa"), ("b", b"bbbbbbbb")], 2));
    transport.close_gate();
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(2), transport.clone(), &reachability);

    let first = scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("a"), dest(&dir, "a"))])
        .unwrap();
    eventually("first transfer", || transport.fetches().len() == 1).await;

    let added = scheduler
        .add_download_task(DownloadDescriptor::new(scripted_url("b"), dest(&dir, "b")))
        .unwrap();
    eventually("added transfer", || transport.fetches().len() == 2).await;
    assert_eq!(added.snapshot().unwrap().batch_id, first[0].snapshot().unwrap().batch_id);

    transport.open_gate();
    wait_idle(&scheduler).await;
    assert_eq!(added.state(), Some(TaskState::Completed));
    assert_eq!(read(&dest(&dir, "b")), b"bbbbbbbb");
}

#[tokio::test]
async fn test_connectivity_loss_suspends_and_return_resumes() {
    let dir = tempdir().unwrap();
    let data: &[u8] = b"0123456789abcdef";
    let transport = Arc::new(ScriptedTransport::new(&[("file", data)], 4));
    transport.close_gate();
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport.clone(), &reachability);

    let destination = dest(&dir, "file");
    let handles = scheduler
        .download_batch(vec![
            DownloadDescriptor::new(scripted_url("file"), &destination).with_hash(HashAlgorithm::Sha256, {
                use sha2::{Digest, Sha256};
                hex::encode(Sha256::digest(data))
            }),
        ])
        .unwrap();
    let task = &handles[0];
    eventually("first chunk", || received(task) == 4).await;

    reachability.set_reachable(false);
    eventually("suspension", || {
        task.snapshot()
            .is_some_and(|t| t.state == TaskState::Suspended && t.resumable_offset == 4)
    })
    .await;
    assert_eq!(scheduler.phase(), ManagerPhase::Suspended);
    assert_eq!(scheduler.suspend_reason(), Some(SuspendReason::Connectivity));
    assert_eq!(task.snapshot().unwrap().suspend_reason, Some(SuspendReason::Connectivity));
    assert_eq!(read(&create_temp_path(&destination)), b"0123");

    transport.open_gate();
    reachability.set_reachable(true);
    wait_idle(&scheduler).await;

    let snapshot = task.snapshot().unwrap();
    assert_eq!(snapshot.state, TaskState::Completed);
    assert_eq!(snapshot.outcome, Some(TransferOutcome::Resumed { size: 16, offset: 4 }));
    assert_eq!(read(&destination), data);
    assert_eq!(transport.fetches().last().unwrap().1, 4);
}

#[tokio::test]
async fn test_manual_suspend_is_not_lifted_by_reachability() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"0123456789abcdef")], 4));
    transport.close_gate();
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport.clone(), &reachability);

    let handles = scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("file"), dest(&dir, "file"))])
        .unwrap();
    let task = &handles[0];
    eventually("first chunk", || received(task) == 4).await;

    scheduler.suspend_all_ongoing_downloads();
    eventually("suspension", || {
        task.snapshot()
            .is_some_and(|t| t.state == TaskState::Suspended && t.resumable_offset == 4)
    })
    .await;

    reachability.set_reachable(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    reachability.set_reachable(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(task.state(), Some(TaskState::Suspended));
    assert_eq!(scheduler.suspend_reason(), Some(SuspendReason::Manual));
    assert_eq!(transport.fetches().len(), 1);
    assert!(!scheduler.is_downloading());

    transport.open_gate();
    scheduler.continue_in_completed_downloads();
    wait_idle(&scheduler).await;
    assert_eq!(task.state(), Some(TaskState::Completed));
    assert_eq!(read(&dest(&dir, "file")), b"0123456789abcdef");
}

#[tokio::test]
async fn test_offline_start_waits_for_connectivity() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"payload")], 4));
    let reachability = ManualReachability::new(false);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport.clone(), &reachability);

    let handles = scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("file"), dest(&dir, "file"))])
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.phase(), ManagerPhase::Suspended);
    assert!(transport.fetches().is_empty());

    // Continuing while offline keeps waiting for the network
    scheduler.continue_in_completed_downloads();
    assert_eq!(scheduler.suspend_reason(), Some(SuspendReason::Connectivity));

    reachability.set_reachable(true);
    wait_idle(&scheduler).await;
    assert_eq!(handles[0].state(), Some(TaskState::Completed));
}

#[tokio::test]
async fn test_cancel_removes_partial_file() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("a", b"0123456789abcdef"), ("b", b"bbbb")], 4));
    transport.close_gate();
    let reachability = ManualReachability::new(true);
    let (scheduler, recorder) = recorded_scheduler(test_config(1), transport.clone(), &reachability);

    let destination = dest(&dir, "a");
    let handles = scheduler
        .download_batch(vec![
            DownloadDescriptor::new(scripted_url("a"), &destination),
            DownloadDescriptor::new(scripted_url("b"), dest(&dir, "b")),
        ])
        .unwrap();
    eventually("first chunk", || received(&handles[0]) == 4).await;
    assert!(create_temp_path(&destination).exists());

    scheduler.cancel_all_outstanding_tasks();
    wait_idle(&scheduler).await;

    for handle in &handles {
        assert_eq!(handle.state(), Some(TaskState::Cancelled));
    }
    assert!(!create_temp_path(&destination).exists());
    assert!(!destination.exists());
    assert!(!dest(&dir, "b").exists());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.finished_all.load(Ordering::SeqCst), 0);
    let finished = scheduler.drain_finished_batches();
    assert_eq!(finished[0].status, BatchStatus::Cancelled);
}

#[tokio::test]
async fn test_cancelling_one_task_leaves_the_rest_running() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("a", b"aaaaaaaa"), ("b", b"bbbbbbbb")], 4));
    transport.close_gate();
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(2), transport.clone(), &reachability);

    let handles = scheduler
        .download_batch(vec![
            DownloadDescriptor::new(scripted_url("a"), dest(&dir, "a")),
            DownloadDescriptor::new(scripted_url("b"), dest(&dir, "b")),
        ])
        .unwrap();
    eventually("both started", || handles.iter().all(|h| received(h) == 4)).await;

    assert!(handles[0].cancel());
    assert!(!handles[0].cancel());
    let settled = tokio::time::timeout(WAIT, handles[0].wait_settled())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.state, TaskState::Cancelled);
    assert!(!create_temp_path(&dest(&dir, "a")).exists());

    transport.open_gate();
    wait_idle(&scheduler).await;
    assert_eq!(handles[1].state(), Some(TaskState::Completed));
}

#[tokio::test]
async fn test_hash_mismatch_fails_without_output() {
    let dir = tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bad.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"corrupted".to_vec()))
        .mount(&server)
        .await;

    let reachability = ManualReachability::new(true);
    let transport = Arc::new(HttpTransport::from_config(&test_config(1)).unwrap());
    let (scheduler, recorder) = recorded_scheduler(test_config(1), transport, &reachability);

    let destination = dest(&dir, "bad.bin");
    let handles = scheduler
        .download_batch(vec![
            DownloadDescriptor::new(format!("{}/bad.bin", server.uri()), &destination)
                .with_expected_hash(md5_hex(b"original")),
        ])
        .unwrap();
    wait_idle(&scheduler).await;

    let snapshot = handles[0].snapshot().unwrap();
    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.last_error.as_ref().unwrap().kind(), ErrorKind::HashMismatch);
    assert!(!destination.exists());
    assert!(!create_temp_path(&destination).exists());

    eventually("error notification", || recorder.errors.load(Ordering::SeqCst) == 1).await;
    eventually("finish notification", || recorder.finished_all.load(Ordering::SeqCst) == 1).await;
    assert_eq!(scheduler.metrics().hash_mismatches, 1);
}

#[tokio::test]
async fn test_resume_sends_range_request() {
    let dir = tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .and(header("Range", "bytes=4-"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("Content-Range", "bytes 4-9/10")
                .set_body_bytes(b"456789".to_vec()),
        )
        .expect(1)
        .mount(&server)
        .await;

    let destination = dest(&dir, "data.bin");
    std::fs::write(create_temp_path(&destination), b"0123").unwrap();

    let reachability = ManualReachability::new(true);
    let config = test_config(1);
    let transport = Arc::new(HttpTransport::from_config(&config).unwrap());
    let (scheduler, _recorder) = recorded_scheduler(config, transport, &reachability);

    let handles = scheduler
        .download_batch(vec![
            DownloadDescriptor::new(format!("{}/data.bin", server.uri()), &destination)
                .with_expected_size(10)
                .with_expected_hash(md5_hex(b"0123456789")),
        ])
        .unwrap();
    wait_idle(&scheduler).await;

    let snapshot = handles[0].snapshot().unwrap();
    assert_eq!(snapshot.state, TaskState::Completed);
    assert_eq!(snapshot.outcome, Some(TransferOutcome::Resumed { size: 10, offset: 4 }));
    assert_eq!(read(&destination), b"0123456789");
    assert_eq!(scheduler.metrics().resumed, 1);
}

#[tokio::test]
async fn test_server_ignoring_range_restarts_cleanly() {
    let dir = tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"0123456789".to_vec()))
        .mount(&server)
        .await;

    let destination = dest(&dir, "data.bin");
    // Stale bytes that must not leak into the digest or the file
    std::fs::write(create_temp_path(&destination), b"xxxx").unwrap();

    let reachability = ManualReachability::new(true);
    let config = test_config(1);
    let transport = Arc::new(HttpTransport::from_config(&config).unwrap());
    let (scheduler, _recorder) = recorded_scheduler(config, transport, &reachability);

    let handles = scheduler
        .download_batch(vec![
            DownloadDescriptor::new(format!("{}/data.bin", server.uri()), &destination)
                .with_expected_hash(md5_hex(b"0123456789")),
        ])
        .unwrap();
    wait_idle(&scheduler).await;

    let snapshot = handles[0].snapshot().unwrap();
    assert_eq!(snapshot.state, TaskState::Completed);
    assert_eq!(snapshot.outcome, Some(TransferOutcome::Restarted { size: 10, discarded: 4 }));
    assert_eq!(read(&destination), b"0123456789");
}

#[tokio::test]
async fn test_aggregate_progress_never_double_counts_a_restart() {
    let dir = tempdir().unwrap();
    let data = vec![7u8; 32];
    let transport = Arc::new(ScriptedTransport::new(&[("file", &data)], 4).ignoring_range());
    transport.close_gate();
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport.clone(), &reachability);
    let mut events = scheduler.subscribe();

    let handles = scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("file"), dest(&dir, "file"))])
        .unwrap();
    let task = &handles[0];
    eventually("first chunk", || received(task) == 4).await;

    scheduler.suspend_all_ongoing_downloads();
    eventually("suspension", || {
        task.snapshot().is_some_and(|t| t.state == TaskState::Suspended && !scheduler.is_downloading())
    })
    .await;

    transport.open_gate();
    scheduler.continue_in_completed_downloads();
    wait_idle(&scheduler).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        task.snapshot().unwrap().outcome,
        Some(TransferOutcome::Restarted { size: 32, discarded: 4 })
    );
    assert_eq!(scheduler.aggregate_progress(), (32, 32));
    assert_eq!(received(task), 32);

    let percents: Vec<f32> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::Progress { percent, .. } => Some(percent),
            _ => None,
        })
        .collect();
    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
    assert_eq!(percents.last().copied(), Some(100.0));
}

#[tokio::test]
async fn test_initial_bytes_count_toward_aggregate() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"12345678")], 8));
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport, &reachability);

    scheduler.set_initial_downloaded_bytes(92);
    scheduler
        .add_batch(vec![DownloadDescriptor::new(scripted_url("file"), dest(&dir, "file")).with_expected_size(8)])
        .unwrap();
    assert_eq!(scheduler.aggregate_progress(), (92, 100));

    scheduler.set_total_bytes(200);
    assert_eq!(scheduler.aggregate_progress(), (92, 200));
    scheduler.set_total_bytes(0);

    scheduler.start_downloading_current_batch();
    wait_idle(&scheduler).await;
    assert_eq!(scheduler.aggregate_progress(), (100, 100));
}

#[tokio::test]
async fn test_invalid_descriptor_fails_without_network() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("ok", b"fine")], 4));
    let reachability = ManualReachability::new(true);
    let (scheduler, recorder) = recorded_scheduler(test_config(2), transport.clone(), &reachability);

    let handles = scheduler
        .add_batch(vec![
            DownloadDescriptor::new("ftp://files.test/nope", dest(&dir, "nope")),
            DownloadDescriptor::new(scripted_url("ok"), dest(&dir, "ok")),
        ])
        .unwrap();

    // Starting the invalid task directly reports the problem to the caller
    let err = handles[0].start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
    assert_eq!(handles[0].state(), Some(TaskState::Failed));

    scheduler.start_downloading_current_batch();
    wait_idle(&scheduler).await;

    assert_eq!(handles[1].state(), Some(TaskState::Completed));
    assert_eq!(transport.fetches(), vec![("/ok".to_string(), 0)]);
    eventually("finish notification", || recorder.finished_all.load(Ordering::SeqCst) == 1).await;
    assert_eq!(recorder.errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"eventually")], 4).failing_first(2));
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport.clone(), &reachability);
    let mut events = scheduler.subscribe();

    let handles = scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("file"), dest(&dir, "file"))])
        .unwrap();
    wait_idle(&scheduler).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handles[0].state(), Some(TaskState::Completed));
    assert_eq!(read(&dest(&dir, "file")), b"eventually");
    assert_eq!(transport.fetches().len(), 3);
    assert_eq!(scheduler.metrics().retries_attempted, 2);

    let retries = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SchedulerEvent::TaskRetrying { .. }))
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn test_retries_run_out() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"never")], 4).failing_first(10));
    let reachability = ManualReachability::new(true);
    let config = DownloadConfig::builder()
        .max_retries(2)
        .retry_delay(Duration::from_millis(5))
        .build()
        .unwrap();
    let (scheduler, _recorder) = recorded_scheduler(config, transport.clone(), &reachability);

    let handles = scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("file"), dest(&dir, "file"))])
        .unwrap();
    wait_idle(&scheduler).await;

    let snapshot = handles[0].snapshot().unwrap();
    assert_eq!(snapshot.state, TaskState::Failed);
    assert!(matches!(
        snapshot.last_error.as_deref(),
        Some(DownloadError::MaxRetriesExceeded { max_retries: 2, .. })
    ));
    assert_eq!(transport.fetches().len(), 3);
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let dir = tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.bin"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let reachability = ManualReachability::new(true);
    let config = test_config(1);
    let transport = Arc::new(HttpTransport::from_config(&config).unwrap());
    let (scheduler, _recorder) = recorded_scheduler(config, transport, &reachability);

    let handles = scheduler
        .download_batch(vec![DownloadDescriptor::new(
            format!("{}/missing.bin", server.uri()),
            dest(&dir, "missing.bin"),
        )])
        .unwrap();
    wait_idle(&scheduler).await;

    let snapshot = handles[0].snapshot().unwrap();
    assert_eq!(snapshot.state, TaskState::Failed);
    assert!(matches!(
        snapshot.last_error.as_deref(),
        Some(DownloadError::ServerError { status: 404, .. })
    ));
    assert_eq!(scheduler.metrics().retries_attempted, 0);
}

#[tokio::test]
async fn test_existing_valid_file_is_not_downloaded_again() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"present")], 4));
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport.clone(), &reachability);

    let destination = dest(&dir, "file");
    std::fs::write(&destination, b"present").unwrap();
    let handles = scheduler
        .download_batch(vec![
            DownloadDescriptor::new(scripted_url("file"), &destination)
                .with_expected_size(7)
                .with_expected_hash(md5_hex(b"present")),
        ])
        .unwrap();
    wait_idle(&scheduler).await;

    assert_eq!(
        handles[0].snapshot().unwrap().outcome,
        Some(TransferOutcome::AlreadyExists { size: 7 })
    );
    assert!(transport.fetches().is_empty());
}

#[tokio::test]
async fn test_task_level_algorithm_overrides_global() {
    let dir = tempdir().unwrap();
    let data: &[u8] = b"hello world";
    let transport = Arc::new(ScriptedTransport::new(&[("file", data)], 4));
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport, &reachability);
    scheduler.set_hash_algorithm(HashAlgorithm::Sha512);
    assert_eq!(scheduler.hash_algorithm(), HashAlgorithm::Sha512);

    let handles = scheduler
        .download_batch(vec![
            DownloadDescriptor::new(scripted_url("file"), dest(&dir, "file"))
                .with_hash(HashAlgorithm::Md5, md5_hex(data)),
        ])
        .unwrap();
    wait_idle(&scheduler).await;
    assert_eq!(handles[0].state(), Some(TaskState::Completed));
}

#[tokio::test]
async fn test_shutdown_refuses_new_work() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"data")], 4));
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport, &reachability);

    tokio::time::timeout(WAIT, scheduler.shutdown()).await.unwrap();
    let err = scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("file"), dest(&dir, "file"))])
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let reachability = ManualReachability::new(true);
    let transport = Arc::new(ScriptedTransport::new(&[], 4));
    let config = DownloadConfig {
        max_concurrent_downloads: 0,
        ..DownloadConfig::default()
    };
    assert!(BatchScheduler::new(config, transport, &reachability).is_err());
}

#[tokio::test]
async fn test_unanswered_request_times_out() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"never")], 4).hanging_first(usize::MAX));
    let reachability = ManualReachability::new(true);
    let config = DownloadConfig::builder()
        .max_retries(0)
        .idle_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let (scheduler, recorder) = recorded_scheduler(config, transport.clone(), &reachability);

    let handles = scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("file"), dest(&dir, "file"))])
        .unwrap();
    wait_idle(&scheduler).await;

    let snapshot = handles[0].snapshot().unwrap();
    assert_eq!(snapshot.state, TaskState::Failed);
    match snapshot.last_error.as_deref() {
        Some(DownloadError::MaxRetriesExceeded { last_error, .. }) => {
            assert!(matches!(**last_error, DownloadError::NetworkTimeout { .. }));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!dest(&dir, "file").exists());
    eventually("error notification", || recorder.errors.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_idle_timeout_is_retried() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"late reply")], 4).hanging_first(1));
    let reachability = ManualReachability::new(true);
    let config = DownloadConfig::builder()
        .max_retries(2)
        .retry_delay(Duration::from_millis(10))
        .idle_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let (scheduler, _recorder) = recorded_scheduler(config, transport.clone(), &reachability);
    let mut events = scheduler.subscribe();

    let handles = scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("file"), dest(&dir, "file"))])
        .unwrap();
    wait_idle(&scheduler).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(handles[0].state(), Some(TaskState::Completed));
    assert_eq!(read(&dest(&dir, "file")), b"late reply");
    assert_eq!(transport.fetches().len(), 2);

    let retried_on_timeout = drain_events(&mut events).into_iter().any(|e| {
        matches!(
            e,
            SchedulerEvent::TaskRetrying { ref error, .. } if matches!(**error, DownloadError::NetworkTimeout { .. })
        )
    });
    assert!(retried_on_timeout);
}

#[tokio::test]
async fn test_hash_mismatch_removes_stale_destination() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"corrupted")], 4));
    let reachability = ManualReachability::new(true);
    let config = DownloadConfig::builder().skip_existing(false).build().unwrap();
    let (scheduler, _recorder) = recorded_scheduler(config, transport, &reachability);

    let destination = dest(&dir, "file");
    std::fs::write(&destination, b"old stale content").unwrap();
    let handles = scheduler
        .download_batch(vec![
            DownloadDescriptor::new(scripted_url("file"), &destination).with_expected_hash(md5_hex(b"original")),
        ])
        .unwrap();
    wait_idle(&scheduler).await;

    let snapshot = handles[0].snapshot().unwrap();
    assert_eq!(snapshot.state, TaskState::Failed);
    assert_eq!(snapshot.last_error.as_ref().unwrap().kind(), ErrorKind::HashMismatch);
    assert!(!destination.exists());
    assert!(!create_temp_path(&destination).exists());
}

#[tokio::test]
async fn test_body_longer_than_expected_size_fails() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("big", b"0123456789ab")], 4).without_size("big"));
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport, &reachability);

    let destination = dest(&dir, "big");
    let handles = scheduler
        .download_batch(vec![
            DownloadDescriptor::new(scripted_url("big"), &destination).with_expected_size(8),
        ])
        .unwrap();
    wait_idle(&scheduler).await;

    let snapshot = handles[0].snapshot().unwrap();
    assert_eq!(snapshot.state, TaskState::Failed);
    assert!(matches!(
        snapshot.last_error.as_deref(),
        Some(DownloadError::SizeMismatch { expected: 8, actual: 12, .. })
    ));
    assert!(!create_temp_path(&destination).exists());
    assert!(!destination.exists());
    assert_eq!(scheduler.metrics().retries_attempted, 0);
}

#[tokio::test]
async fn test_rate_and_remaining_time_for_active_tasks() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(
        ScriptedTransport::new(&[("sized", b"0123456789abcdef"), ("open", b"0123456789abcdef")], 4)
            .without_size("open"),
    );
    transport.close_gate();
    let reachability = ManualReachability::new(true);
    let config = DownloadConfig::builder()
        .max_concurrent_downloads(2)
        .rate_window(Duration::from_secs(60))
        .build()
        .unwrap();
    let (scheduler, _recorder) = recorded_scheduler(config, transport.clone(), &reachability);

    let handles = scheduler
        .download_batch(vec![
            DownloadDescriptor::new(scripted_url("sized"), dest(&dir, "sized")),
            DownloadDescriptor::new(scripted_url("open"), dest(&dir, "open")),
        ])
        .unwrap();
    eventually("first chunks", || handles.iter().all(|h| received(h) == 4)).await;

    let rates = scheduler.download_rate_and_remaining_time();
    assert_eq!(rates.len(), 2);
    let rate_of = |id: TaskId| rates.iter().find(|r| r.task_id == id).unwrap();

    let sized = rate_of(handles[0].id());
    assert!(sized.bytes_per_second > 0.0);
    assert!(sized.remaining.is_some());

    let open = rate_of(handles[1].id());
    assert!(open.bytes_per_second > 0.0);
    assert_eq!(open.remaining, None);

    transport.open_gate();
    wait_idle(&scheduler).await;
    assert!(scheduler.download_rate_and_remaining_time().is_empty());
}

#[tokio::test]
async fn test_task_progress_reported_per_step() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"0123456789abcdef")], 4));
    let reachability = ManualReachability::new(true);
    let config = DownloadConfig::builder().progress_step_percent(25.0).build().unwrap();
    let (scheduler, recorder) = recorded_scheduler(config, transport, &reachability);

    scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("file"), dest(&dir, "file"))])
        .unwrap();
    wait_idle(&scheduler).await;

    eventually("task progress", || recorder.task_percents.lock().len() == 4).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*recorder.task_percents.lock(), vec![25.0, 50.0, 75.0, 100.0]);
}

#[tokio::test]
async fn test_suspended_task_resumes_from_its_offset() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"0123456789abcdef")], 4));
    transport.close_gate();
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport.clone(), &reachability);

    let destination = dest(&dir, "file");
    let handles = scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("file"), &destination)])
        .unwrap();
    let task = &handles[0];
    eventually("first chunk", || received(task) == 4).await;

    assert!(task.suspend());
    eventually("suspension", || {
        task.snapshot()
            .is_some_and(|t| t.state == TaskState::Suspended && t.resumable_offset == 4)
    })
    .await;
    assert_eq!(read(&create_temp_path(&destination)), b"0123");
    assert!(!task.suspend());

    transport.open_gate();
    task.start().unwrap();
    wait_idle(&scheduler).await;

    let snapshot = task.snapshot().unwrap();
    assert_eq!(snapshot.state, TaskState::Completed);
    assert_eq!(snapshot.outcome, Some(TransferOutcome::Resumed { size: 16, offset: 4 }));
    assert_eq!(transport.fetches(), vec![("/file".to_string(), 0), ("/file".to_string(), 4)]);
    assert_eq!(read(&destination), b"0123456789abcdef");
}

#[tokio::test]
async fn test_cancelling_a_suspended_task_drops_its_rate_history() {
    let dir = tempdir().unwrap();
    let transport = Arc::new(ScriptedTransport::new(&[("file", b"0123456789abcdef")], 4));
    transport.close_gate();
    let reachability = ManualReachability::new(true);
    let (scheduler, _recorder) = recorded_scheduler(test_config(1), transport.clone(), &reachability);

    let destination = dest(&dir, "file");
    let handles = scheduler
        .download_batch(vec![DownloadDescriptor::new(scripted_url("file"), &destination)])
        .unwrap();
    let task = &handles[0];
    eventually("first chunk", || received(task) == 4).await;

    assert!(task.suspend());
    eventually("suspension", || {
        task.snapshot()
            .is_some_and(|t| t.state == TaskState::Suspended && t.resumable_offset == 4)
    })
    .await;
    assert_eq!(scheduler.sampled_tasks(), 1);

    assert!(task.cancel());
    wait_idle(&scheduler).await;
    eventually("partial removed", || !create_temp_path(&destination).exists()).await;
    eventually("rate history dropped", || scheduler.sampled_tasks() == 0).await;
    assert_eq!(task.state(), Some(TaskState::Cancelled));
}
