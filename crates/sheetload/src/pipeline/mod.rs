pub mod error;
pub mod runner;

pub use error::{DuplicateKind, IngestError};
pub use runner::{staging_table_name, JobPipeline};

use crate::worker::{JobStats, ProcessingJob};

/// Executes one attempt of a job. The worker wraps implementations in the
/// retry controller; an `Err` means the attempt as a whole failed.
pub trait JobExecutor: Send + Sync {
    fn execute(&self, job: &ProcessingJob) -> Result<JobStats, IngestError>;
}
