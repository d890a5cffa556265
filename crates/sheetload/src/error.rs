use std::path::PathBuf;
use thiserror::Error;

use crate::worker::TransitionError;

#[derive(Error, Debug)]
pub enum SheetloadError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Dedup index error: {0}")]
    Dedup(#[from] crate::dedup::DedupError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] crate::pipeline::IngestError),

    #[error("Logging setup failed: {0}")]
    Logging(#[from] crate::logging::LoggingError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid SQL identifier for '{field}': '{value}'")]
    InvalidIdentifier { field: String, value: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move file from '{from}' to '{to}': {source}")]
    MoveFile {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    RemoveFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to walk '{path}': {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Path has no file name: {0}")]
    MissingFileName(PathBuf),

    #[error("File already exists: {0}")]
    FileExists(PathBuf),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker is already running")]
    AlreadyRunning,

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,

    #[error("Job id '{0}' was already submitted")]
    DuplicateJobId(String),

    #[error("Job '{0}' not found")]
    JobNotFound(String),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Job ledger lock poisoned")]
    LockPoisoned,

    #[error("Directory scan failed for '{path}': {source}")]
    ScanFailed {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Failed to install signal handler: {0}")]
    SignalHandler(String),
}

pub type Result<T> = std::result::Result<T, SheetloadError>;
