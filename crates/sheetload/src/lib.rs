pub mod collector;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod service;
pub mod storage;
pub mod table;
pub mod worker;

pub use collector::PendingScanner;
pub use config::{load_config, validate_config, Config};
pub use db::{Database, DatabaseError, SqliteStagingStore, StagingStore, TargetStats};
pub use dedup::{DedupError, DedupIndex, FileRecord};
pub use error::{ConfigError, Result, SheetloadError, StorageError, WorkerError};
pub use logging::init_logging;
pub use pipeline::{IngestError, JobExecutor, JobPipeline};
pub use service::Service;
pub use storage::ArchiveStorage;
pub use table::{CsvSheetReader, SheetReader, Table};
pub use worker::{JobRequest, JobStatus, ProcessingJob, QueueProcessor};
