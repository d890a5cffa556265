use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::DatabaseError;
use crate::dedup::DedupError;
use crate::error::StorageError;

/// Which fingerprint matched a previously processed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    /// Byte-identical file.
    File,
    /// Same cleaned data under a different name or encoding.
    Content,
}

impl fmt::Display for DuplicateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicateKind::File => f.write_str("file"),
            DuplicateKind::Content => f.write_str("content"),
        }
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Validation failed for '{path}': {reason}")]
    Validation { path: PathBuf, reason: String },

    #[error("Duplicate {kind} '{path}': already processed as '{prior_path}' at {processed_at}")]
    Duplicate {
        path: PathBuf,
        kind: DuplicateKind,
        prior_path: String,
        processed_at: DateTime<Utc>,
    },

    #[error("Failed to stage '{path}': {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: DatabaseError,
    },

    #[error("Upsert from staging table '{staging_table}' failed: {source}")]
    Upsert {
        staging_table: String,
        #[source]
        source: DatabaseError,
    },

    #[error("Database unavailable: {0}")]
    Connection(#[source] DatabaseError),

    #[error("Failed to record '{path}' in dedup index: {source}")]
    Dedup {
        path: PathBuf,
        #[source]
        source: DedupError,
    },

    #[error("Failed to archive '{path}': {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: StorageError,
    },
}

impl IngestError {
    /// Whether retrying the job could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Load { .. } | IngestError::Upsert { .. } | IngestError::Connection(_)
        )
    }
}
