use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Submission record handed over by a collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Must be unique for the lifetime of the process.
    pub id: String,
    /// Identifier of the inbound message the files came from.
    pub source_ref: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub file_paths: Vec<PathBuf>,
}

impl JobRequest {
    pub fn new(
        id: impl Into<String>,
        source_ref: impl Into<String>,
        sender: impl Into<String>,
        file_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            id: id.into(),
            source_ref: source_ref.into(),
            sender: sender.into(),
            timestamp: Utc::now(),
            file_paths,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change the job lifecycle does not allow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Job '{job_id}' cannot move from {from} to {to}")]
pub struct TransitionError {
    pub job_id: String,
    pub from: JobStatus,
    pub to: JobStatus,
}

/// Result of processing one file of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub success: bool,
    pub records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_to: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileOutcome {
    pub fn failed(path: &Path, error: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub total_records: usize,
    pub processed_files: usize,
    pub failed_files: usize,
    pub processing_time_secs: f64,
    pub files: Vec<FileOutcome>,
}

impl JobStats {
    pub fn push(&mut self, outcome: FileOutcome) {
        if outcome.success {
            self.processed_files += 1;
            self.total_records += outcome.records;
        } else {
            self.failed_files += 1;
        }
        self.files.push(outcome);
    }
}

/// The unit of work. Lifecycle fields only change through the transition
/// methods, which enforce
/// `PENDING -> IN_PROGRESS -> {COMPLETED | FAILED}` and
/// `PENDING -> CANCELLED`.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingJob {
    id: String,
    source_ref: String,
    sender: String,
    created_at: DateTime<Utc>,
    submitted_at: DateTime<Utc>,
    file_paths: Vec<PathBuf>,
    status: JobStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_count: u32,
    max_retries: u32,
    error_message: Option<String>,
    stats: Option<JobStats>,
}

impl ProcessingJob {
    pub fn new(request: JobRequest, max_retries: u32) -> Self {
        Self {
            id: request.id,
            source_ref: request.source_ref,
            sender: request.sender,
            created_at: Utc::now(),
            submitted_at: request.timestamp,
            file_paths: request.file_paths,
            status: JobStatus::Pending,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries,
            error_message: None,
            stats: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source_ref(&self) -> &str {
        &self.source_ref
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Timestamp carried by the submission record.
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn file_paths(&self) -> &[PathBuf] {
        &self.file_paths
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn stats(&self) -> Option<&JobStats> {
        self.stats.as_ref()
    }

    fn transition(&mut self, expected: JobStatus, to: JobStatus) -> Result<(), TransitionError> {
        if self.status != expected {
            return Err(TransitionError {
                job_id: self.id.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        if to.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Pending, JobStatus::InProgress)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, stats: JobStats) -> Result<(), TransitionError> {
        self.transition(JobStatus::InProgress, JobStatus::Completed)?;
        self.stats = Some(stats);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(JobStatus::InProgress, JobStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(JobStatus::Pending, JobStatus::Cancelled)
    }

    /// Records the error of a failed attempt that is about to be retried.
    pub(crate) fn note_attempt_error(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
    }

    pub(crate) fn increment_retry(&mut self) {
        self.retry_count += 1;
    }
}

/// Read-only view of a job as returned by status and history queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSummary {
    pub id: String,
    pub source_ref: String,
    pub sender: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub processing_stats: Option<JobStats>,
    pub retry_count: u32,
}

impl From<&ProcessingJob> for JobSummary {
    fn from(job: &ProcessingJob) -> Self {
        Self {
            id: job.id.clone(),
            source_ref: job.source_ref.clone(),
            sender: job.sender.clone(),
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error_message: job.error_message.clone(),
            processing_stats: job.stats.clone(),
            retry_count: job.retry_count,
        }
    }
}
