//! Queue behaviour with scripted executors: ordering, retries, cancellation
//! and lifecycle timestamps.

mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::*;
use crossbeam_channel::{bounded, Receiver, Sender};
use sheetload::db::DatabaseError;
use sheetload::pipeline::{IngestError, JobExecutor};
use sheetload::worker::{JobStats, Sleeper};
use sheetload::{JobStatus, ProcessingJob, WorkerError};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

/// Records the order jobs are executed in.
#[derive(Default)]
struct OrderExecutor {
    seen: Mutex<Vec<String>>,
}

impl JobExecutor for OrderExecutor {
    fn execute(&self, job: &ProcessingJob) -> Result<JobStats, IngestError> {
        self.seen.lock().unwrap().push(job.id().to_string());
        Ok(JobStats::default())
    }
}

/// Fails every attempt with a retryable error.
#[derive(Default)]
struct UnreachableDatabase {
    attempts: AtomicUsize,
}

impl JobExecutor for UnreachableDatabase {
    fn execute(&self, _job: &ProcessingJob) -> Result<JobStats, IngestError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(IngestError::Connection(DatabaseError::LockPoisoned))
    }
}

/// Fails every attempt with an error that retrying cannot fix.
#[derive(Default)]
struct RejectingExecutor {
    attempts: AtomicUsize,
}

impl JobExecutor for RejectingExecutor {
    fn execute(&self, _job: &ProcessingJob) -> Result<JobStats, IngestError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(IngestError::Validation {
            path: PathBuf::from("a.csv"),
            reason: "file is empty".to_string(),
        })
    }
}

/// Announces each job it starts and blocks until released.
struct GatedExecutor {
    started: Sender<String>,
    release: Receiver<()>,
}

impl JobExecutor for GatedExecutor {
    fn execute(&self, job: &ProcessingJob) -> Result<JobStats, IngestError> {
        let _ = self.started.send(job.id().to_string());
        let _ = self.release.recv_timeout(WAIT);
        Ok(JobStats::default())
    }
}

/// Gated executor that also tracks how many jobs run at the same time.
#[derive(Default)]
struct ConcurrencyCounts {
    active: AtomicUsize,
    max_active: AtomicUsize,
}

struct CountingGate {
    started: Sender<String>,
    release: Receiver<()>,
    counts: Arc<ConcurrencyCounts>,
}

impl JobExecutor for CountingGate {
    fn execute(&self, job: &ProcessingJob) -> Result<JobStats, IngestError> {
        let now = self.counts.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counts.max_active.fetch_max(now, Ordering::SeqCst);
        let _ = self.started.send(job.id().to_string());
        let _ = self.release.recv_timeout(WAIT);
        self.counts.active.fetch_sub(1, Ordering::SeqCst);
        Ok(JobStats::default())
    }
}

#[test]
fn test_jobs_run_in_submission_order() {
    let harness = TestHarness::new();
    let executor = Arc::new(OrderExecutor::default());
    let processor = harness.processor_with(executor.clone(), Arc::new(RecordingSleeper::default()));

    for id in ["J1", "J2", "J3"] {
        processor.submit(harness.request(id, Vec::new())).unwrap();
    }
    processor.start().unwrap();
    assert!(processor.wait_for_idle(WAIT).unwrap());

    assert_eq!(*executor.seen.lock().unwrap(), vec!["J1", "J2", "J3"]);
    assert!(processor.stop(WAIT).unwrap());
}

#[test]
fn test_retry_budget_and_backoff() {
    let harness = TestHarness::with_config(|c| c.max_retries(3).backoff_unit_ms(1000));
    let executor = Arc::new(UnreachableDatabase::default());
    let sleeper = Arc::new(RecordingSleeper::default());
    let processor = harness.processor_with(executor.clone(), sleeper.clone());

    processor.submit(harness.request("j1", Vec::new())).unwrap();
    processor.start().unwrap();
    assert!(processor.wait_for_idle(WAIT).unwrap());

    let job = processor.job("j1").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);
    assert!(job
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("Database unavailable"));
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 4);
    assert_eq!(
        sleeper.delays(),
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4)
        ]
    );

    processor.stop(WAIT).unwrap();
}

#[test]
fn test_non_retryable_error_fails_without_backoff() {
    let harness = TestHarness::new();
    let executor = Arc::new(RejectingExecutor::default());
    let sleeper = Arc::new(RecordingSleeper::default());
    let processor = harness.processor_with(executor.clone(), sleeper.clone());

    processor.submit(harness.request("j1", Vec::new())).unwrap();
    processor.start().unwrap();
    assert!(processor.wait_for_idle(WAIT).unwrap());

    let job = processor.job("j1").unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(executor.attempts.load(Ordering::SeqCst), 1);
    assert!(sleeper.delays().is_empty());

    processor.stop(WAIT).unwrap();
}

#[test]
fn test_cancel_pending_but_not_running_job() {
    let harness = TestHarness::new();
    let (started_tx, started_rx) = bounded(4);
    let (release_tx, release_rx) = bounded(4);
    let executor = Arc::new(GatedExecutor {
        started: started_tx,
        release: release_rx,
    });
    let processor = harness.processor_with(executor, Arc::new(RecordingSleeper::default()));

    processor.submit(harness.request("running", Vec::new())).unwrap();
    processor.submit(harness.request("waiting", Vec::new())).unwrap();
    processor.start().unwrap();

    assert_eq!(started_rx.recv_timeout(WAIT).unwrap(), "running");

    let err = processor.cancel("running").unwrap_err();
    assert!(matches!(err, WorkerError::Transition(_)));
    let running = processor.job("running").unwrap().unwrap();
    assert_eq!(running.status, JobStatus::InProgress);
    assert!(running.completed_at.is_none());
    assert_eq!(processor.active_job().unwrap().unwrap().id, "running");

    processor.cancel("waiting").unwrap();
    assert_eq!(
        processor.job("waiting").unwrap().unwrap().status,
        JobStatus::Cancelled
    );

    release_tx.send(()).unwrap();
    assert!(processor.wait_for_idle(WAIT).unwrap());

    assert_eq!(
        processor.job("running").unwrap().unwrap().status,
        JobStatus::Completed
    );
    // The cancelled job never reached the executor.
    assert!(started_rx.try_recv().is_err());

    processor.stop(WAIT).unwrap();
}

#[test]
fn test_duplicate_job_id_is_rejected() {
    let harness = TestHarness::new();
    let processor = harness.processor_with(
        Arc::new(OrderExecutor::default()),
        Arc::new(RecordingSleeper::default()),
    );

    processor.submit(harness.request("j1", Vec::new())).unwrap();
    let err = processor
        .submit(harness.request("j1", Vec::new()))
        .unwrap_err();
    assert!(matches!(err, WorkerError::DuplicateJobId(ref id) if id == "j1"));
    assert_eq!(processor.status().unwrap().pending_count, 1);

    // Still rejected once the first one is finished and cleared.
    processor.start().unwrap();
    assert!(processor.wait_for_idle(WAIT).unwrap());
    processor.clear_history().unwrap();
    assert!(processor.submit(harness.request("j1", Vec::new())).is_err());

    processor.stop(WAIT).unwrap();
}

#[test]
fn test_completed_at_set_only_for_terminal_jobs() {
    let harness = TestHarness::new();
    let processor = harness.processor_with(
        Arc::new(OrderExecutor::default()),
        Arc::new(RecordingSleeper::default()),
    );

    for id in ["a", "b", "c"] {
        processor.submit(harness.request(id, Vec::new())).unwrap();
    }
    processor.cancel("b").unwrap();

    let pending = processor.job("a").unwrap().unwrap();
    assert_eq!(pending.status, JobStatus::Pending);
    assert!(pending.started_at.is_none());
    assert!(pending.completed_at.is_none());

    processor.start().unwrap();
    assert!(processor.wait_for_idle(WAIT).unwrap());

    let history = processor.history(10).unwrap();
    assert_eq!(history.len(), 3);
    for job in &history {
        assert!(job.status.is_terminal());
        assert!(job.completed_at.is_some());
    }

    let a = processor.job("a").unwrap().unwrap();
    assert!(a.started_at.unwrap() <= a.completed_at.unwrap());
    let b = processor.job("b").unwrap().unwrap();
    assert!(b.started_at.is_none());

    let summary = processor.processing_stats().unwrap();
    assert_eq!(summary.successful_jobs, 2);
    assert_eq!(summary.cancelled_jobs, 1);

    processor.stop(WAIT).unwrap();
}

#[test]
fn test_submit_while_running() {
    let harness = TestHarness::new();
    let executor = Arc::new(OrderExecutor::default());
    let processor = harness.processor_with(executor.clone(), Arc::new(RecordingSleeper::default()));
    processor.start().unwrap();

    processor.submit(harness.request("late", Vec::new())).unwrap();
    assert!(processor.wait_for_idle(WAIT).unwrap());

    assert_eq!(*executor.seen.lock().unwrap(), vec!["late"]);
    let status = processor.status().unwrap();
    assert!(status.is_running);
    assert_eq!(status.total_processed, 1);

    assert!(processor.stop(WAIT).unwrap());
    assert!(!processor.status().unwrap().is_running);
}

#[test]
fn test_restart_waits_for_detached_worker() {
    let harness = TestHarness::new();
    let (started_tx, started_rx) = bounded(4);
    let (release_tx, release_rx) = bounded(4);
    let counts = Arc::new(ConcurrencyCounts::default());
    let executor = Arc::new(CountingGate {
        started: started_tx,
        release: release_rx,
        counts: counts.clone(),
    });
    let processor = harness.processor_with(executor, Arc::new(RecordingSleeper::default()));

    processor.submit(harness.request("J1", Vec::new())).unwrap();
    processor.start().unwrap();
    assert_eq!(started_rx.recv_timeout(WAIT).unwrap(), "J1");

    // The worker is stuck in J1: stopping times out and leaves it running.
    assert!(!processor.stop(Duration::from_millis(50)).unwrap());
    assert!(matches!(processor.start(), Err(WorkerError::AlreadyRunning)));
    assert!(processor.is_running());

    processor.submit(harness.request("J2", Vec::new())).unwrap();
    assert!(started_rx.recv_timeout(Duration::from_millis(100)).is_err());

    release_tx.send(()).unwrap();
    assert!(processor.stop(WAIT).unwrap());
    assert!(!processor.is_running());

    processor.start().unwrap();
    assert!(processor.is_running());
    assert_eq!(started_rx.recv_timeout(WAIT).unwrap(), "J2");
    release_tx.send(()).unwrap();
    assert!(processor.wait_for_idle(WAIT).unwrap());

    assert_eq!(counts.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(
        processor.job("J1").unwrap().unwrap().status,
        JobStatus::Completed
    );
    assert!(processor.stop(WAIT).unwrap());
}
