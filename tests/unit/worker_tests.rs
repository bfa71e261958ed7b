use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rtcr::orchestrator::worker::{CheckpointWorker, Checkpointable};
use rtcr::{AppError, Result};

#[derive(Default)]
struct Recorder {
    running: AtomicBool,
    overlapped: AtomicBool,
    passes: AtomicU64,
    order: Mutex<Vec<u64>>,
    fail: AtomicBool,
}

impl Checkpointable for Recorder {
    fn checkpoint(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        std::thread::sleep(Duration::from_millis(20));
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        self.order.lock().unwrap().push(pass);
        self.running.store(false, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::Kernel(format!("pass {pass} failed")));
        }
        Ok(())
    }
}

fn spawn(unit: &Arc<Recorder>) -> CheckpointWorker {
    CheckpointWorker::spawn(
        "test",
        Arc::clone(unit) as Arc<dyn Checkpointable>,
        Some(3),
        CancellationToken::new(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_and_join_runs_one_pass() {
    let unit = Arc::new(Recorder::default());
    let worker = spawn(&unit);

    worker.start_checkpoint().await.expect("start");
    worker.join_checkpoint().await.expect("join");

    assert_eq!(unit.passes.load(Ordering::SeqCst), 1);
    let status = worker.status();
    assert_eq!(status.completed, 1);
    assert!(status.last_elapsed.is_some());
    assert!(status.last_error.is_none());
    assert_eq!(worker.unit(), "test");
    assert_eq!(worker.affinity(), Some(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_start_waits_for_first_job() {
    let unit = Arc::new(Recorder::default());
    let worker = spawn(&unit);

    worker.start_checkpoint().await.expect("first start");
    worker.start_checkpoint().await.expect("second start");
    assert!(
        unit.passes.load(Ordering::SeqCst) >= 1,
        "second start returns only after the first job finished"
    );
    worker.join_checkpoint().await.expect("join");

    assert_eq!(unit.passes.load(Ordering::SeqCst), 2);
    assert_eq!(*unit.order.lock().unwrap(), vec![1, 2]);
    assert!(!unit.overlapped.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn join_without_start_returns_immediately() {
    let unit = Arc::new(Recorder::default());
    let worker = spawn(&unit);

    tokio::time::timeout(Duration::from_secs(1), worker.join_checkpoint())
        .await
        .expect("join does not block")
        .expect("join");
    assert_eq!(unit.passes.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_job_is_reported_once() {
    let unit = Arc::new(Recorder::default());
    unit.fail.store(true, Ordering::SeqCst);
    let worker = spawn(&unit);

    worker.start_checkpoint().await.expect("start");
    let err = worker.join_checkpoint().await.unwrap_err();
    assert_eq!(err, AppError::Kernel("pass 1 failed".into()));
    assert!(worker.status().last_error.is_some());

    worker.join_checkpoint().await.expect("already-joined failure is not repeated");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopped_worker_refuses_jobs() {
    let unit = Arc::new(Recorder::default());
    let worker = spawn(&unit);

    worker.stop();

    assert!(worker.is_stopped());
    let err = worker.start_checkpoint().await.unwrap_err();
    assert!(matches!(err, AppError::Worker(ref msg) if msg.contains("test")));
    assert_eq!(unit.passes.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_parent_token_stops_worker() {
    let parent = CancellationToken::new();
    let unit = Arc::new(Recorder::default());
    let worker = CheckpointWorker::spawn(
        "child-token",
        Arc::clone(&unit) as Arc<dyn Checkpointable>,
        None,
        parent.child_token(),
    );

    parent.cancel();

    assert!(worker.is_stopped());
    assert!(worker.start_checkpoint().await.is_err());
}
