use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, info_span, warn};

use crate::config::Config;
use crate::db::{Database, SqliteStagingStore, StagingStore};
use crate::dedup::{DedupIndex, RecordStats};
use crate::error::SheetloadError;
use crate::storage::ArchiveStorage;
use crate::table::{CsvSheetReader, SheetReader, Table};
use crate::worker::{FileOutcome, JobStats, ProcessingJob};

use super::error::{DuplicateKind, IngestError};
use super::JobExecutor;

const MAX_ID_LEN: usize = 32;

/// Staging table name for one file of a job: `job_<id>_<8 hex>`. The id is
/// reduced to lowercase alphanumerics and underscores.
pub fn staging_table_name(job_id: &str) -> String {
    let mut sanitized: String = job_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    sanitized.truncate(MAX_ID_LEN);

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("job_{}_{}", sanitized, &suffix[..8])
}

/// Processes the files of a job: validate, deduplicate, stage, upsert,
/// record and archive.
pub struct JobPipeline {
    store: Arc<dyn StagingStore>,
    dedup: Arc<DedupIndex>,
    archive: ArchiveStorage,
    reader: Arc<dyn SheetReader>,
    business_key: String,
}

impl JobPipeline {
    pub fn new(
        store: Arc<dyn StagingStore>,
        dedup: Arc<DedupIndex>,
        archive: ArchiveStorage,
        reader: Arc<dyn SheetReader>,
        business_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            dedup,
            archive,
            reader,
            business_key: business_key.into(),
        }
    }

    /// Production constructor: opens the database and dedup index named in
    /// the configuration and reads delimited sheets.
    pub fn from_config(config: &Config) -> Result<Self, SheetloadError> {
        let db = Database::open(&config.database.path)?;
        let store = SqliteStagingStore::new(db, &config.database);
        let index_path = config.processing.dedup_index_path();
        let dedup = DedupIndex::open(&index_path);
        let archive = ArchiveStorage::new(&config.processing.processed_dir).keep(&index_path);

        Ok(Self::new(
            Arc::new(store),
            Arc::new(dedup),
            archive,
            Arc::new(CsvSheetReader::new()),
            config.database.business_key.clone(),
        ))
    }

    pub fn store(&self) -> &dyn StagingStore {
        self.store.as_ref()
    }

    pub fn dedup(&self) -> &DedupIndex {
        &self.dedup
    }

    pub fn archive(&self) -> &ArchiveStorage {
        &self.archive
    }

    /// Runs one file through every step. Any error leaves the file where it
    /// is; the staging table is dropped whether or not the load succeeded.
    pub fn process_file(&self, job_id: &str, path: &Path) -> Result<FileOutcome, IngestError> {
        let started = Instant::now();

        let (bytes, table) = {
            let _step = info_span!("validate").entered();
            self.validate(path)?
        };

        {
            let _step = info_span!("deduplicate").entered();
            self.check_duplicates(path, &bytes, &table)?;
        }

        let staging_table = staging_table_name(job_id);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stamped = table.with_metadata(&file_name, Utc::now());

        let loaded = {
            let _step = info_span!("stage_and_upsert", staging_table = %staging_table).entered();
            let result = self.stage_and_upsert(path, &staging_table, &stamped);
            if let Err(e) = self.store.drop_staging_table(&staging_table) {
                warn!("Failed to drop staging table {}: {}", staging_table, e);
            }
            result?
        };

        {
            let _step = info_span!("record").entered();
            let stats = RecordStats {
                records_processed: loaded,
                staging_table: staging_table.clone(),
                processing_time_secs: started.elapsed().as_secs_f64(),
            };
            self.dedup
                .record(path, &bytes, &table, stats)
                .map_err(|source| IngestError::Dedup {
                    path: path.to_path_buf(),
                    source,
                })?;
        }

        let archived_to = {
            let _step = info_span!("archive").entered();
            self.archive
                .archive(path)
                .map_err(|source| IngestError::Archive {
                    path: path.to_path_buf(),
                    source,
                })?
        };

        info!(
            "Processed {}: {} records upserted via {}",
            path.display(),
            loaded,
            staging_table
        );

        Ok(FileOutcome {
            path: path.to_path_buf(),
            success: true,
            records: table.len(),
            staging_table: Some(staging_table),
            archived_to: Some(archived_to),
            error: None,
        })
    }

    fn validate(&self, path: &Path) -> Result<(Vec<u8>, Table), IngestError> {
        let invalid = |reason: String| IngestError::Validation {
            path: path.to_path_buf(),
            reason,
        };

        if !path.is_file() {
            return Err(invalid("file does not exist".to_string()));
        }
        if !self.reader.supports(path) {
            return Err(invalid("unsupported file type".to_string()));
        }

        let bytes = std::fs::read(path).map_err(|e| invalid(format!("cannot read file: {}", e)))?;
        if bytes.is_empty() {
            return Err(invalid("file is empty".to_string()));
        }

        let raw = self
            .reader
            .parse(path, &bytes)
            .map_err(|e| invalid(e.to_string()))?;
        let (table, report) = raw
            .clean(&self.business_key)
            .map_err(|e| invalid(e.to_string()))?;

        if report.dropped() > 0 {
            debug!(
                "Dropped {} rows from {} ({} empty, {} without key, {} repeated keys)",
                report.dropped(),
                path.display(),
                report.empty_rows,
                report.missing_key_rows,
                report.duplicate_key_rows
            );
        }

        Ok((bytes, table))
    }

    fn check_duplicates(&self, path: &Path, bytes: &[u8], table: &Table) -> Result<(), IngestError> {
        let dedup_err = |source| IngestError::Dedup {
            path: path.to_path_buf(),
            source,
        };

        let prior = match self.dedup.check_bytes(bytes).map_err(dedup_err)? {
            Some(prior) => Some((DuplicateKind::File, prior)),
            None => self
                .dedup
                .check_content(table)
                .map_err(dedup_err)?
                .map(|prior| (DuplicateKind::Content, prior)),
        };

        match prior {
            Some((kind, prior)) => Err(IngestError::Duplicate {
                path: path.to_path_buf(),
                kind,
                prior_path: prior.path,
                processed_at: prior.record.processed_at,
            }),
            None => Ok(()),
        }
    }

    fn stage_and_upsert(
        &self,
        path: &Path,
        staging_table: &str,
        table: &Table,
    ) -> Result<usize, IngestError> {
        self.store
            .create_staging_table(staging_table, table)
            .map_err(|source| IngestError::Load {
                path: path.to_path_buf(),
                source,
            })?;

        self.store
            .upsert_into_target(staging_table)
            .map_err(|source| IngestError::Upsert {
                staging_table: staging_table.to_string(),
                source,
            })
    }
}

impl JobExecutor for JobPipeline {
    /// Processes every file of the job. Individual file failures are
    /// recorded in the returned stats; only an unreachable staging schema
    /// fails the attempt.
    fn execute(&self, job: &ProcessingJob) -> Result<JobStats, IngestError> {
        let _job_span = info_span!("job",
            job_id = %job.id(),
            sender = %job.sender(),
            files = job.file_paths().len(),
        )
        .entered();
        let started = Instant::now();

        self.store
            .ensure_staging_schema()
            .map_err(IngestError::Connection)?;

        let mut stats = JobStats::default();
        for path in job.file_paths() {
            let _file_span = info_span!("file", path = %path.display()).entered();
            match self.process_file(job.id(), path) {
                Ok(outcome) => stats.push(outcome),
                Err(e) => {
                    warn!("File {} failed: {}", path.display(), e);
                    stats.push(FileOutcome::failed(path, e.to_string()));
                }
            }
        }

        stats.processing_time_secs = started.elapsed().as_secs_f64();
        info!(
            "Job {} processed {} of {} files ({} records) in {:.2}s",
            job.id(),
            stats.processed_files,
            job.file_paths().len(),
            stats.total_records,
            stats.processing_time_secs
        );
        Ok(stats)
    }
}
