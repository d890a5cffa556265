pub mod history;
pub mod job;
pub mod queue;
pub mod retry;

pub use history::{JobLedger, ProcessingSummary, QueueStatus, StatusCounts};
pub use job::{
    FileOutcome, JobRequest, JobStats, JobStatus, JobSummary, ProcessingJob, TransitionError,
};
pub use queue::QueueProcessor;
pub use retry::{RetryController, Sleeper, ThreadSleeper};
