//! In-memory ledger of every job the processor knows about.
//!
//! Pending, running and finished jobs live in one map guarded by a single
//! mutex shared between the worker and the status/history readers.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::error::WorkerError;

use super::job::{JobStatus, JobSummary, ProcessingJob};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub is_running: bool,
    pub pending_count: usize,
    pub total_processed: usize,
    pub status_counts: StatusCounts,
}

/// Aggregates over finished jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingSummary {
    pub total_jobs: usize,
    pub successful_jobs: usize,
    pub failed_jobs: usize,
    pub cancelled_jobs: usize,
    pub total_records: usize,
    pub total_files: usize,
    pub average_processing_time_secs: f64,
}

#[derive(Debug, Default)]
pub struct JobLedger {
    jobs: HashMap<String, ProcessingJob>,
    seen_ids: HashSet<String>,
    active: Option<String>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a new PENDING job. Ids are never reused, even after the job has
    /// been cleared from history.
    pub fn insert(&mut self, job: ProcessingJob) -> Result<(), WorkerError> {
        if !self.seen_ids.insert(job.id().to_string()) {
            return Err(WorkerError::DuplicateJobId(job.id().to_string()));
        }
        self.jobs.insert(job.id().to_string(), job);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ProcessingJob> {
        self.jobs.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ProcessingJob> {
        self.jobs.get_mut(id)
    }

    /// Stores the worker's copy of a job back into the ledger.
    pub fn replace(&mut self, job: ProcessingJob) {
        self.jobs.insert(job.id().to_string(), job);
    }

    pub fn set_active(&mut self, id: Option<String>) {
        self.active = id;
    }

    pub fn active(&self) -> Option<&ProcessingJob> {
        self.active.as_deref().and_then(|id| self.jobs.get(id))
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for job in self.jobs.values() {
            match job.status() {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::InProgress => counts.in_progress += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// True when nothing is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.jobs
            .values()
            .all(|j| j.status().is_terminal())
    }

    fn finished(&self) -> impl Iterator<Item = &ProcessingJob> {
        self.jobs.values().filter(|j| j.status().is_terminal())
    }

    /// Finished jobs, most recently completed first.
    pub fn history(&self, limit: usize) -> Vec<JobSummary> {
        let mut finished: Vec<&ProcessingJob> = self.finished().collect();
        finished.sort_by(|a, b| {
            b.completed_at()
                .cmp(&a.completed_at())
                .then_with(|| b.created_at().cmp(&a.created_at()))
        });
        finished
            .into_iter()
            .take(limit)
            .map(JobSummary::from)
            .collect()
    }

    pub fn summary(&self) -> ProcessingSummary {
        let mut summary = ProcessingSummary::default();
        let mut total_time = 0.0;
        let mut timed_jobs = 0usize;

        for job in self.finished() {
            summary.total_jobs += 1;
            match job.status() {
                JobStatus::Completed => summary.successful_jobs += 1,
                JobStatus::Failed => summary.failed_jobs += 1,
                JobStatus::Cancelled => summary.cancelled_jobs += 1,
                _ => {}
            }
            if let Some(stats) = job.stats() {
                summary.total_records += stats.total_records;
                summary.total_files += stats.processed_files + stats.failed_files;
                total_time += stats.processing_time_secs;
                timed_jobs += 1;
            }
        }

        if timed_jobs > 0 {
            summary.average_processing_time_secs = total_time / timed_jobs as f64;
        }
        summary
    }

    /// Drops finished jobs. Returns how many were removed.
    pub fn clear_finished(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, j| !j.status().is_terminal());
        before - self.jobs.len()
    }
}
