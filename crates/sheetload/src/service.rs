//! Scheduling loop tying the scanner, the queue and housekeeping together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use serde::Serialize;

use crate::collector::PendingScanner;
use crate::config::Config;
use crate::error::{SheetloadError, StorageError, WorkerError};
use crate::pipeline::JobPipeline;
use crate::worker::QueueProcessor;

const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(200);

/// What one scheduling cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub submitted: usize,
    pub pruned_records: usize,
    pub removed_files: usize,
}

/// Installs a Ctrl-C / SIGTERM handler and returns the flag it sets.
pub fn install_shutdown_handler() -> Result<Arc<AtomicBool>, WorkerError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| WorkerError::SignalHandler(e.to_string()))?;
    Ok(shutdown)
}

pub struct Service {
    config: Config,
    pipeline: Arc<JobPipeline>,
    processor: QueueProcessor,
    scanner: PendingScanner,
}

impl Service {
    pub fn new(config: Config, pipeline: Arc<JobPipeline>, processor: QueueProcessor) -> Self {
        let scanner = PendingScanner::new(
            &config.processing.pending_dir,
            &config.processing.allowed_extensions,
        );
        Self {
            config,
            pipeline,
            processor,
            scanner,
        }
    }

    /// Creates the working directories and wires the production pipeline
    /// and queue from `config`.
    pub fn from_config(config: Config) -> Result<Self, SheetloadError> {
        for dir in [
            &config.processing.pending_dir,
            &config.processing.processed_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| StorageError::CreateDirectory {
                path: dir.clone(),
                source: e,
            })?;
        }

        let pipeline = Arc::new(JobPipeline::from_config(&config)?);
        let processor = QueueProcessor::from_config(pipeline.clone(), &config.queue);
        Ok(Self::new(config, pipeline, processor))
    }

    pub fn processor(&self) -> &QueueProcessor {
        &self.processor
    }

    pub fn pipeline(&self) -> &JobPipeline {
        &self.pipeline
    }

    /// Scans the pending directory, queues what it finds, then applies the
    /// retention policy to the dedup index and the archive.
    pub fn run_once(&mut self) -> Result<CycleReport, SheetloadError> {
        let processor = &self.processor;
        self.scanner.retain_queued(|id| match processor.job(id) {
            Ok(Some(job)) => !job.status.is_terminal(),
            Ok(None) => false,
            Err(_) => true,
        });

        let requests = self.scanner.scan()?;
        let submitted = self.processor.submit_all(requests)?;

        let retention = self.config.processing.file_retention_days;
        let pruned_records = self.pipeline.dedup().prune(retention)?;
        let cleanup = self.pipeline.archive().cleanup_older_than(retention)?;

        Ok(CycleReport {
            submitted,
            pruned_records,
            removed_files: cleanup.removed_files,
        })
    }

    /// Logs queue, dedup and target table statistics.
    pub fn log_stats(&self) {
        match self.processor.status() {
            Ok(status) => info!(
                "Queue: running={}, pending={}, processed={}",
                status.is_running, status.pending_count, status.total_processed
            ),
            Err(e) => warn!("Queue status unavailable: {}", e),
        }

        if let Ok(summary) = self.processor.processing_stats() {
            info!(
                "Jobs: {} total, {} successful, {} failed, {} records, avg {:.2}s",
                summary.total_jobs,
                summary.successful_jobs,
                summary.failed_jobs,
                summary.total_records,
                summary.average_processing_time_secs
            );
        }

        match self.pipeline.dedup().stats() {
            Ok(stats) => info!(
                "Dedup index: {} files, {} today, {} in the last 7 days",
                stats.total_records, stats.processed_today, stats.processed_last_7_days
            ),
            Err(e) => warn!("Dedup stats unavailable: {}", e),
        }

        match self.pipeline.store().target_stats() {
            Ok(stats) => info!(
                "Target table: {} rows, {} loaded today",
                stats.total_records, stats.today_records
            ),
            Err(e) => warn!("Target stats unavailable: {}", e),
        }
    }

    /// Runs a single cycle and waits until every queued job has finished
    /// or `shutdown` is set.
    pub fn run_to_completion(
        &mut self,
        shutdown: &AtomicBool,
    ) -> Result<CycleReport, SheetloadError> {
        self.processor.start()?;
        let report = self.run_once();

        if report.is_ok() {
            loop {
                if shutdown.load(Ordering::SeqCst)
                    || self.processor.wait_for_idle(SHUTDOWN_CHECK_INTERVAL)?
                {
                    break;
                }
            }
        }

        self.log_stats();
        self.stop()?;
        report
    }

    /// Repeats [`Service::run_once`] every `schedule_interval_secs` until
    /// `shutdown` is set, then stops the worker.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), SheetloadError> {
        self.processor.start()?;
        let interval = self.config.processing.schedule_interval();
        info!("Service started, scanning every {:?}", interval);

        while !shutdown.load(Ordering::SeqCst) {
            match self.run_once() {
                Ok(report) => info!(
                    "Cycle queued {} file(s), pruned {} index records, removed {} archived files",
                    report.submitted, report.pruned_records, report.removed_files
                ),
                Err(e) => error!("Processing cycle failed: {}", e),
            }
            self.log_stats();

            let deadline = Instant::now() + interval;
            while !shutdown.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::sleep(SHUTDOWN_CHECK_INTERVAL.min(deadline - now));
            }
        }

        self.stop()
    }

    fn stop(&self) -> Result<(), SheetloadError> {
        let timeout = self.config.queue.shutdown_timeout();
        if !self.processor.stop(timeout)? {
            warn!("Worker still busy after {:?}, exiting anyway", timeout);
        }
        Ok(())
    }
}
