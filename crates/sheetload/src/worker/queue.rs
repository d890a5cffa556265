use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::WorkerError;
use crate::pipeline::JobExecutor;

use super::history::{JobLedger, ProcessingSummary, QueueStatus};
use super::job::{JobRequest, JobStatus, JobSummary, ProcessingJob};
use super::retry::RetryController;

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(10);

struct WorkerHandle {
    stop_tx: Sender<()>,
    done_rx: Receiver<()>,
    handle: JoinHandle<()>,
}

/// FIFO job queue feeding a single sequential worker thread.
///
/// Job ids travel over the channel; the jobs themselves live in the
/// [`JobLedger`] so status readers see every job regardless of where it is
/// in its lifecycle.
pub struct QueueProcessor {
    ledger: Arc<Mutex<JobLedger>>,
    job_tx: Sender<String>,
    job_rx: Receiver<String>,
    executor: Arc<dyn JobExecutor>,
    retry: Arc<RetryController>,
    max_retries: u32,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl QueueProcessor {
    pub fn new(
        executor: Arc<dyn JobExecutor>,
        retry: RetryController,
        config: &QueueConfig,
    ) -> Self {
        let (job_tx, job_rx) = unbounded();
        Self {
            ledger: Arc::new(Mutex::new(JobLedger::new())),
            job_tx,
            job_rx,
            executor,
            retry: Arc::new(retry),
            max_retries: config.max_retries,
            poll_interval: config.poll_interval(),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Production constructor: thread sleeps for backoff.
    pub fn from_config(executor: Arc<dyn JobExecutor>, config: &QueueConfig) -> Self {
        let retry = RetryController::with_thread_sleeper(config.backoff_unit());
        Self::new(executor, retry, config)
    }

    fn ledger(&self) -> Result<MutexGuard<'_, JobLedger>, WorkerError> {
        self.ledger.lock().map_err(|_| WorkerError::LockPoisoned)
    }

    /// Spawns the worker thread.
    pub fn start(&self) -> Result<(), WorkerError> {
        let mut worker = self.worker.lock().map_err(|_| WorkerError::LockPoisoned)?;
        if let Some(previous) = worker.as_ref() {
            // A worker detached by a timed-out stop keeps the slot until it exits.
            match previous.done_rx.try_recv() {
                Err(TryRecvError::Empty) => return Err(WorkerError::AlreadyRunning),
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    if let Some(previous) = worker.take() {
                        if previous.handle.join().is_err() {
                            error!("Previous worker thread panicked");
                        }
                    }
                }
            }
        }

        let (stop_tx, stop_rx) = unbounded();
        let (done_tx, done_rx) = unbounded();
        let ctx = WorkerContext {
            ledger: Arc::clone(&self.ledger),
            executor: Arc::clone(&self.executor),
            retry: Arc::clone(&self.retry),
            poll_interval: self.poll_interval,
            running: Arc::clone(&self.running),
        };
        let job_rx = self.job_rx.clone();

        self.running.store(true, Ordering::SeqCst);
        let handle = thread::Builder::new()
            .name("sheetload-worker".to_string())
            .spawn(move || {
                run_worker(ctx, job_rx, stop_rx);
                let _ = done_tx.send(());
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                WorkerError::SpawnFailed(e.to_string())
            })?;

        *worker = Some(WorkerHandle {
            stop_tx,
            done_rx,
            handle,
        });
        info!("Queue processor started");
        Ok(())
    }

    /// Signals the worker to stop taking jobs and waits up to `timeout` for
    /// the current job to finish. Returns `false` if the worker was still
    /// busy when the timeout elapsed; that worker keeps its slot, so
    /// [`QueueProcessor::start`] refuses to spawn another until it exits.
    pub fn stop(&self, timeout: Duration) -> Result<bool, WorkerError> {
        let mut slot = self.worker.lock().map_err(|_| WorkerError::LockPoisoned)?;
        let Some(worker) = slot.as_ref() else {
            return Ok(true);
        };

        info!("Stopping queue processor...");
        let _ = worker.stop_tx.send(());

        match worker.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                if let Some(worker) = slot.take() {
                    if worker.handle.join().is_err() {
                        error!("Worker thread panicked");
                    }
                }
                info!("Queue processor stopped");
                Ok(true)
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                warn!(
                    "Worker did not finish its current job within {:?}; it will exit afterwards",
                    timeout
                );
                Ok(false)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Enqueues a job. Safe to call while the worker is running.
    pub fn submit(&self, request: JobRequest) -> Result<(), WorkerError> {
        let mut ledger = self.ledger()?;
        let job = ProcessingJob::new(request, self.max_retries);
        let id = job.id().to_string();
        let files = job.file_paths().len();
        ledger.insert(job)?;

        self.job_tx
            .send(id.clone())
            .map_err(|_| WorkerError::ChannelClosed)?;
        info!("Job {} queued with {} file(s)", id, files);
        Ok(())
    }

    /// Submits every request, stopping at the first rejection.
    pub fn submit_all<I>(&self, requests: I) -> Result<usize, WorkerError>
    where
        I: IntoIterator<Item = JobRequest>,
    {
        let mut submitted = 0;
        for request in requests {
            self.submit(request)?;
            submitted += 1;
        }
        Ok(submitted)
    }

    /// Cancels a job that has not been picked up yet.
    pub fn cancel(&self, id: &str) -> Result<(), WorkerError> {
        let mut ledger = self.ledger()?;
        let job = ledger
            .get_mut(id)
            .ok_or_else(|| WorkerError::JobNotFound(id.to_string()))?;
        job.cancel()?;
        info!("Job {} cancelled", id);
        Ok(())
    }

    pub fn status(&self) -> Result<QueueStatus, WorkerError> {
        let ledger = self.ledger()?;
        let counts = ledger.counts();
        Ok(QueueStatus {
            is_running: self.is_running(),
            pending_count: counts.pending,
            total_processed: counts.completed + counts.failed + counts.cancelled,
            status_counts: counts,
        })
    }

    pub fn history(&self, limit: usize) -> Result<Vec<JobSummary>, WorkerError> {
        Ok(self.ledger()?.history(limit))
    }

    pub fn job(&self, id: &str) -> Result<Option<JobSummary>, WorkerError> {
        Ok(self.ledger()?.get(id).map(JobSummary::from))
    }

    pub fn active_job(&self) -> Result<Option<JobSummary>, WorkerError> {
        Ok(self.ledger()?.active().map(JobSummary::from))
    }

    pub fn processing_stats(&self) -> Result<ProcessingSummary, WorkerError> {
        Ok(self.ledger()?.summary())
    }

    /// Forgets finished jobs. Their ids stay reserved.
    pub fn clear_history(&self) -> Result<usize, WorkerError> {
        let removed = self.ledger()?.clear_finished();
        info!("Cleared {} jobs from history", removed);
        Ok(removed)
    }

    /// Blocks until no job is pending or running, or `timeout` elapses.
    pub fn wait_for_idle(&self, timeout: Duration) -> Result<bool, WorkerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.ledger()?.is_idle() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(IDLE_CHECK_INTERVAL);
        }
    }
}

impl Drop for QueueProcessor {
    fn drop(&mut self) {
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(worker) = worker.take() {
                let _ = worker.stop_tx.send(());
            }
        }
    }
}

struct WorkerContext {
    ledger: Arc<Mutex<JobLedger>>,
    executor: Arc<dyn JobExecutor>,
    retry: Arc<RetryController>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
}

enum WorkerEvent {
    Job(String),
    Idle,
    Stop,
    Disconnected,
}

fn run_worker(ctx: WorkerContext, job_rx: Receiver<String>, stop_rx: Receiver<()>) {
    debug!("Worker started");

    loop {
        match stop_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => {
                debug!("Worker received stop signal");
                break;
            }
        }

        let event = select! {
            recv(stop_rx) -> _ => WorkerEvent::Stop,
            recv(job_rx) -> msg => match msg {
                Ok(id) => WorkerEvent::Job(id),
                Err(_) => WorkerEvent::Disconnected,
            },
            default(ctx.poll_interval) => WorkerEvent::Idle,
        };

        match event {
            WorkerEvent::Job(id) => {
                if let Err(e) = process_job(&ctx, &id) {
                    error!("Worker cannot continue: {}", e);
                    break;
                }
            }
            WorkerEvent::Idle => continue,
            WorkerEvent::Stop => {
                debug!("Worker received stop signal");
                break;
            }
            WorkerEvent::Disconnected => {
                debug!("Job channel disconnected");
                break;
            }
        }
    }

    ctx.running.store(false, Ordering::SeqCst);
    debug!("Worker stopped");
}

/// Runs one dequeued job. Only a poisoned ledger is reported as an error;
/// job failures end up in the ledger.
fn process_job(ctx: &WorkerContext, id: &str) -> Result<(), WorkerError> {
    let mut job = {
        let mut ledger = ctx.ledger.lock().map_err(|_| WorkerError::LockPoisoned)?;
        let Some(job) = ledger.get_mut(id) else {
            debug!("Job {} no longer in ledger, skipping", id);
            return Ok(());
        };
        if job.status() != JobStatus::Pending {
            debug!("Skipping job {} in state {}", id, job.status());
            return Ok(());
        }
        job.start()?;
        let snapshot = job.clone();
        ledger.set_active(Some(id.to_string()));
        snapshot
    };

    info!(
        "Processing job {} from {} ({} file(s))",
        id,
        job.sender(),
        job.file_paths().len()
    );
    let outcome = ctx.retry.run(&mut job, ctx.executor.as_ref());

    let mut ledger = ctx.ledger.lock().map_err(|_| WorkerError::LockPoisoned)?;
    ledger.set_active(None);
    match outcome {
        Ok(status) => debug!("Job {} finished as {}", id, status),
        Err(e) => error!("Job {} left in unexpected state: {}", id, e),
    }
    ledger.replace(job);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::pipeline::IngestError;
    use crate::worker::job::JobStats;
    use crate::worker::retry::Sleeper;

    struct NoSleep;

    impl Sleeper for NoSleep {
        fn sleep(&self, _duration: Duration) {}
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

    fn config() -> QueueConfig {
        QueueConfig {
            poll_interval_ms: 10,
            ..QueueConfig::default()
        }
    }

    fn request(id: &str) -> JobRequest {
        JobRequest::new(id, "msg", "sender", vec![PathBuf::from("a.csv")])
    }

    fn processor(executor: Arc<dyn JobExecutor>) -> QueueProcessor {
        QueueProcessor::new(
            executor,
            RetryController::new(Duration::from_millis(1), Arc::new(NoSleep)),
            &config(),
        )
    }

    #[test]
    fn test_jobs_run_in_submission_order() {
        let executor = Arc::new(OrderExecutor::default());
        let processor = processor(executor.clone());

        processor
            .submit_all(vec![request("j1"), request("j2"), request("j3")])
            .unwrap();
        processor.start().unwrap();
        assert!(processor.wait_for_idle(Duration::from_secs(5)).unwrap());

        assert_eq!(*executor.seen.lock().unwrap(), vec!["j1", "j2", "j3"]);
        assert!(processor.stop(Duration::from_secs(5)).unwrap());
        assert!(!processor.is_running());
    }

    #[test]
    fn test_status_before_start() {
        let processor = processor(Arc::new(OrderExecutor::default()));
        processor.submit(request("a")).unwrap();

        let status = processor.status().unwrap();
        assert!(!status.is_running);
        assert_eq!(status.pending_count, 1);
        assert_eq!(status.total_processed, 0);
    }

    #[test]
    fn test_duplicate_submission_rejected() {
        let processor = processor(Arc::new(OrderExecutor::default()));
        processor.submit(request("a")).unwrap();
        assert!(matches!(
            processor.submit(request("a")),
            Err(WorkerError::DuplicateJobId(_))
        ));
        assert_eq!(processor.status().unwrap().pending_count, 1);
    }

    #[test]
    fn test_cancelled_job_is_skipped() {
        let executor = Arc::new(OrderExecutor::default());
        let processor = processor(executor.clone());

        processor.submit(request("keep")).unwrap();
        processor.submit(request("drop")).unwrap();
        processor.cancel("drop").unwrap();

        processor.start().unwrap();
        assert!(processor.wait_for_idle(Duration::from_secs(5)).unwrap());
        processor.stop(Duration::from_secs(5)).unwrap();

        assert_eq!(*executor.seen.lock().unwrap(), vec!["keep"]);
        let dropped = processor.job("drop").unwrap().unwrap();
        assert_eq!(dropped.status, JobStatus::Cancelled);
        assert!(dropped.started_at.is_none());
    }

    #[test]
    fn test_cancel_unknown_job() {
        let processor = processor(Arc::new(OrderExecutor::default()));
        assert!(matches!(
            processor.cancel("nope"),
            Err(WorkerError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_start_twice() {
        let processor = processor(Arc::new(OrderExecutor::default()));
        processor.start().unwrap();
        assert!(matches!(processor.start(), Err(WorkerError::AlreadyRunning)));
        processor.stop(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn test_stop_without_start() {
        let processor = processor(Arc::new(OrderExecutor::default()));
        assert!(processor.stop(Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_restart_drains_remaining_jobs() {
        let executor = Arc::new(OrderExecutor::default());
        let processor = processor(executor.clone());

        processor.start().unwrap();
        processor.stop(Duration::from_secs(5)).unwrap();

        processor.submit(request("later")).unwrap();
        assert_eq!(processor.status().unwrap().pending_count, 1);

        processor.start().unwrap();
        assert!(processor.wait_for_idle(Duration::from_secs(5)).unwrap());
        processor.stop(Duration::from_secs(5)).unwrap();
        assert_eq!(*executor.seen.lock().unwrap(), vec!["later"]);
    }

    #[test]
    fn test_history_and_clear() {
        let processor = processor(Arc::new(OrderExecutor::default()));
        processor.submit_all(vec![request("a"), request("b")]).unwrap();
        processor.start().unwrap();
        assert!(processor.wait_for_idle(Duration::from_secs(5)).unwrap());
        processor.stop(Duration::from_secs(5)).unwrap();

        let status = processor.status().unwrap();
        assert_eq!(status.total_processed, 2);
        assert_eq!(status.status_counts.completed, 2);
        assert_eq!(processor.history(10).unwrap().len(), 2);
        assert_eq!(processor.processing_stats().unwrap().successful_jobs, 2);
        assert!(processor.active_job().unwrap().is_none());

        assert_eq!(processor.clear_history().unwrap(), 2);
        assert!(processor.history(10).unwrap().is_empty());
        assert!(processor.submit(request("a")).is_err());
    }
}
