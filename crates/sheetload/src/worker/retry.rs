use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::pipeline::JobExecutor;

use super::job::{JobStatus, ProcessingJob, TransitionError};

/// Blocks the worker between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Runs one job with bounded retries and exponential backoff.
///
/// Retry `n` (zero based) waits `2^n` backoff units, so the default budget
/// of three retries sleeps 1, 2 and 4 units. Only retryable errors are
/// retried; anything else fails the job on the spot.
pub struct RetryController {
    backoff_unit: Duration,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryController {
    pub fn new(backoff_unit: Duration, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            backoff_unit,
            sleeper,
        }
    }

    pub fn with_thread_sleeper(backoff_unit: Duration) -> Self {
        Self::new(backoff_unit, Arc::new(ThreadSleeper))
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff_unit
            .saturating_mul(2u32.checked_pow(retry).unwrap_or(u32::MAX))
    }

    /// Drives an IN_PROGRESS job to COMPLETED or FAILED.
    pub fn run(
        &self,
        job: &mut ProcessingJob,
        executor: &dyn JobExecutor,
    ) -> Result<JobStatus, TransitionError> {
        loop {
            let attempt = job.retry_count() + 1;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(job)));

            match outcome {
                Ok(Ok(stats)) => {
                    info!(
                        "Job {} completed on attempt {}: {} files processed, {} failed",
                        job.id(),
                        attempt,
                        stats.processed_files,
                        stats.failed_files
                    );
                    job.complete(stats)?;
                    return Ok(JobStatus::Completed);
                }
                Ok(Err(e)) => {
                    let message = e.to_string();
                    if e.is_retryable() && job.retry_count() < job.max_retries() {
                        let delay = self.delay_for(job.retry_count());
                        warn!(
                            "Job {} attempt {} failed: {}. Retrying in {:?}",
                            job.id(),
                            attempt,
                            message,
                            delay
                        );
                        job.note_attempt_error(message);
                        self.sleeper.sleep(delay);
                        job.increment_retry();
                        continue;
                    }

                    error!(
                        "Job {} failed after {} attempts: {}",
                        job.id(),
                        attempt,
                        message
                    );
                    job.fail(message)?;
                    return Ok(JobStatus::Failed);
                }
                Err(payload) => {
                    let message =
                        format!("Job execution panicked: {}", panic_message(payload.as_ref()));
                    error!("Job {}: {}", job.id(), message);
                    job.fail(message)?;
                    return Ok(JobStatus::Failed);
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
