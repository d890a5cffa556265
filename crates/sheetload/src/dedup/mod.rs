//! Persistent index of processed files.
//!
//! Answers two questions before any staging work starts: has this exact
//! byte stream been loaded before, and has this exact data been loaded
//! before under a different name or encoding. The index is a JSON object
//! keyed by file path, loaded once at startup and rewritten wholesale on
//! every change.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::table::Table;

#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Failed to write dedup index '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize dedup index: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Dedup index lock poisoned")]
    LockPoisoned,
}

/// Statistics kept alongside each processed file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordStats {
    pub records_processed: usize,
    pub staging_table: String,
    pub processing_time_secs: f64,
}

/// One entry per successfully processed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub file_hash: String,
    pub content_hash: String,
    pub processed_at: DateTime<Utc>,
    pub file_size: u64,
    pub records_count: usize,
    #[serde(default)]
    pub processing_stats: RecordStats,
}

/// A previously recorded file matched by a fingerprint lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorRecord {
    pub path: String,
    pub record: FileRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    pub total_records: usize,
    pub processed_today: usize,
    pub processed_last_7_days: usize,
    pub latest_processing: Option<DateTime<Utc>>,
}

/// SHA-256 of raw file bytes, hex encoded.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub struct DedupIndex {
    path: PathBuf,
    records: Mutex<BTreeMap<String, FileRecord>>,
}

impl DedupIndex {
    /// Loads the index from `path`. A missing file starts an empty index;
    /// an unreadable or corrupt file is logged and also starts empty.
    pub fn open<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let records = Self::load(&path);
        info!(
            "Loaded dedup index with {} records from {}",
            records.len(),
            path.display()
        );
        Self {
            path,
            records: Mutex::new(records),
        }
    }

    fn load(path: &Path) -> BTreeMap<String, FileRecord> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
            Err(e) => {
                warn!("Could not read dedup index {}: {}", path.display(), e);
                return BTreeMap::new();
            }
        };

        match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    "Dedup index {} is corrupt, starting empty: {}",
                    path.display(),
                    e
                );
                BTreeMap::new()
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, FileRecord>>, DedupError> {
        self.records.lock().map_err(|_| DedupError::LockPoisoned)
    }

    pub fn len(&self) -> Result<usize, DedupError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, DedupError> {
        Ok(self.lock()?.is_empty())
    }

    /// Looks up a record with the same byte fingerprint.
    pub fn check_bytes(&self, bytes: &[u8]) -> Result<Option<PriorRecord>, DedupError> {
        let hash = fingerprint_bytes(bytes);
        self.find(|r| r.file_hash == hash)
    }

    /// Looks up a record whose cleaned data matches `table`.
    pub fn check_content(&self, table: &Table) -> Result<Option<PriorRecord>, DedupError> {
        let hash = table.content_fingerprint();
        self.find(|r| r.content_hash == hash)
    }

    fn find<F>(&self, predicate: F) -> Result<Option<PriorRecord>, DedupError>
    where
        F: Fn(&FileRecord) -> bool,
    {
        let records = self.lock()?;
        Ok(records
            .iter()
            .find(|(_, r)| predicate(r))
            .map(|(path, record)| PriorRecord {
                path: path.clone(),
                record: record.clone(),
            }))
    }

    /// Records a processed file and flushes the index. If the flush fails
    /// the entry is removed again so memory and disk agree.
    pub fn record(
        &self,
        file: &Path,
        bytes: &[u8],
        table: &Table,
        stats: RecordStats,
    ) -> Result<FileRecord, DedupError> {
        let record = FileRecord {
            file_hash: fingerprint_bytes(bytes),
            content_hash: table.content_fingerprint(),
            processed_at: Utc::now(),
            file_size: bytes.len() as u64,
            records_count: table.len(),
            processing_stats: stats,
        };

        let mut records = self.lock()?;

        let base = file.to_string_lossy().into_owned();
        let mut key = base.clone();
        let mut counter = 1;
        while records.contains_key(&key) {
            key = format!("{}#{}", base, counter);
            counter += 1;
        }

        records.insert(key.clone(), record.clone());
        if let Err(e) = self.save(&records) {
            records.remove(&key);
            return Err(e);
        }

        debug!("Recorded {} in dedup index", key);
        Ok(record)
    }

    /// Drops records older than `retention_days`. Returns how many were removed.
    /// A window reaching past the earliest representable date prunes nothing.
    pub fn prune(&self, retention_days: u32) -> Result<usize, DedupError> {
        let Some(cutoff) = Duration::try_days(i64::from(retention_days))
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            debug!("Retention of {} days keeps every record", retention_days);
            return Ok(0);
        };
        let mut records = self.lock()?;

        let before = records.len();
        let kept: BTreeMap<String, FileRecord> = records
            .iter()
            .filter(|(_, r)| r.processed_at >= cutoff)
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect();
        let removed = before - kept.len();

        if removed > 0 {
            self.save(&kept)?;
            *records = kept;
            info!("Pruned {} records older than {} days", removed, retention_days);
        }

        Ok(removed)
    }

    pub fn stats(&self) -> Result<DedupStats, DedupError> {
        let records = self.lock()?;
        let now = Utc::now();
        let today = now.date_naive();
        let week_ago = now - Duration::days(7);

        Ok(DedupStats {
            total_records: records.len(),
            processed_today: records
                .values()
                .filter(|r| r.processed_at.date_naive() == today)
                .count(),
            processed_last_7_days: records
                .values()
                .filter(|r| r.processed_at >= week_ago)
                .count(),
            latest_processing: records.values().map(|r| r.processed_at).max(),
        })
    }

    /// Writes the index to `<path>.tmp` and renames it into place.
    fn save(&self, records: &BTreeMap<String, FileRecord>) -> Result<(), DedupError> {
        let write_err = |path: &Path, source: std::io::Error| DedupError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| write_err(parent, e))?;
        }

        let json = serde_json::to_string_pretty(records)?;

        let mut tmp: OsString = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json).map_err(|e| write_err(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| write_err(&self.path, e))?;
        Ok(())
    }
}
