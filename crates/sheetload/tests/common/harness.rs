//! Test harness wiring a pipeline against an in-memory database and a
//! temporary directory tree.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sheetload::config::Config;
use sheetload::db::StagingStore;
use sheetload::pipeline::JobExecutor;
use sheetload::worker::{RetryController, Sleeper};
use sheetload::{
    ArchiveStorage, CsvSheetReader, Database, DedupIndex, JobPipeline, JobRequest,
    QueueProcessor, SqliteStagingStore,
};
use tempfile::TempDir;

use super::builders::ConfigBuilder;

pub struct TestHarness {
    pub temp_dir: TempDir,
    pub config: Config,
    pub store: SqliteStagingStore,
    pub pipeline: Arc<JobPipeline>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|builder| builder)
    }

    /// Creates a harness whose configuration is adjusted by `configure`.
    pub fn with_config<F>(configure: F) -> Self
    where
        F: FnOnce(ConfigBuilder) -> ConfigBuilder,
    {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = configure(ConfigBuilder::new(temp_dir.path())).build();

        std::fs::create_dir_all(&config.processing.pending_dir)
            .expect("Failed to create pending dir");
        std::fs::create_dir_all(&config.processing.processed_dir)
            .expect("Failed to create processed dir");

        let db = Database::open_in_memory().expect("Failed to open database");
        let store = SqliteStagingStore::new(db, &config.database);
        let index_path = config.processing.dedup_index_path();
        let pipeline = JobPipeline::new(
            Arc::new(store.clone()),
            Arc::new(DedupIndex::open(&index_path)),
            ArchiveStorage::new(&config.processing.processed_dir).keep(&index_path),
            Arc::new(CsvSheetReader::new()),
            config.database.business_key.clone(),
        );

        Self {
            temp_dir,
            config,
            store,
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn pending_dir(&self) -> &Path {
        &self.config.processing.pending_dir
    }

    pub fn processed_dir(&self) -> &Path {
        &self.config.processing.processed_dir
    }

    /// Writes a file into the pending directory and returns its path.
    pub fn write_pending(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.pending_dir().join(name);
        std::fs::write(&path, contents).expect("Failed to write pending file");
        path
    }

    pub fn request(&self, id: &str, files: Vec<PathBuf>) -> JobRequest {
        JobRequest::new(id, format!("{}.msg", id), "tests@example.com", files)
    }

    /// A second pipeline over `store` that reads the same dedup index and
    /// archive as the harness pipeline.
    pub fn pipeline_over(&self, store: Arc<dyn StagingStore>) -> JobPipeline {
        let index_path = self.config.processing.dedup_index_path();
        JobPipeline::new(
            store,
            Arc::new(DedupIndex::open(&index_path)),
            ArchiveStorage::new(&self.config.processing.processed_dir).keep(&index_path),
            Arc::new(CsvSheetReader::new()),
            self.config.database.business_key.clone(),
        )
    }

    /// Queue backed by the real pipeline.
    pub fn processor(&self) -> QueueProcessor {
        QueueProcessor::from_config(self.pipeline.clone(), &self.config.queue)
    }

    /// Queue backed by a custom executor and sleeper.
    pub fn processor_with(
        &self,
        executor: Arc<dyn JobExecutor>,
        sleeper: Arc<dyn Sleeper>,
    ) -> QueueProcessor {
        let retry = RetryController::new(self.config.queue.backoff_unit(), sleeper);
        QueueProcessor::new(executor, retry, &self.config.queue)
    }

    /// Rows of the target table as `(key, column)` pairs ordered by key.
    pub fn target_values(&self, column: &str) -> Vec<(String, Option<String>)> {
        let sql = format!(
            "SELECT \"{key}\", \"{column}\" FROM \"{table}\" ORDER BY \"{key}\"",
            key = self.config.database.business_key,
            column = column,
            table = self.config.database.target_table,
        );
        self.store
            .database()
            .with_conn(|conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .expect("Failed to read target table")
    }

    pub fn staging_tables(&self) -> Vec<String> {
        self.store
            .staging_tables()
            .expect("Failed to list staging tables")
    }

    /// Files under the processed directory, excluding the dedup index.
    pub fn archived_files(&self) -> Vec<PathBuf> {
        let index = self.config.processing.dedup_index_path();
        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(self.processed_dir())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| *p != index)
            .collect();
        files.sort();
        files
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
