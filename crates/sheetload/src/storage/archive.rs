use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{NaiveDate, Utc};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::StorageError;

const MAX_SUFFIX: u32 = 1000;

/// Moves a processed file into the archive. When `rename` fails (the
/// archive lives on another device) the file is copied and the source
/// deleted; if the source cannot be deleted the copy is removed again so
/// the file stays in the pending directory only.
fn move_into_archive(src: &Path, dst: &Path) -> Result<(), StorageError> {
    let rename_err = match std::fs::rename(src, dst) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    debug!(
        "Rename {} -> {} failed ({}), copying instead",
        src.display(),
        dst.display(),
        rename_err
    );

    let move_err = |source: std::io::Error| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source,
    };

    std::fs::copy(src, dst).map_err(move_err)?;
    if let Err(e) = std::fs::remove_file(src) {
        if let Err(cleanup) = std::fs::remove_file(dst) {
            warn!("Could not remove partial archive copy {}: {}", dst.display(), cleanup);
        }
        return Err(move_err(e));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed_files: usize,
    pub removed_dirs: usize,
}

/// Archive of successfully processed source files, partitioned by
/// processing date: `<root>/<YYYYMMDD>/<name>`.
pub struct ArchiveStorage {
    processed_root: PathBuf,
    keep: Vec<PathBuf>,
}

impl ArchiveStorage {
    pub fn new<P: AsRef<Path>>(processed_root: P) -> Self {
        Self {
            processed_root: processed_root.as_ref().to_path_buf(),
            keep: Vec::new(),
        }
    }

    /// Excludes `path` from retention cleanup. Used for the dedup index,
    /// which lives inside the processed root by default.
    pub fn keep<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.keep.push(path.as_ref().to_path_buf());
        self
    }

    pub fn processed_root(&self) -> &Path {
        &self.processed_root
    }

    /// Moves `source` into today's partition and returns its new path.
    pub fn archive<P: AsRef<Path>>(&self, source: P) -> Result<PathBuf, StorageError> {
        self.archive_at(source, Utc::now().date_naive())
    }

    pub fn archive_at<P: AsRef<Path>>(
        &self,
        source: P,
        date: NaiveDate,
    ) -> Result<PathBuf, StorageError> {
        let source = source.as_ref();
        let file_name = source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::MissingFileName(source.to_path_buf()))?;

        let partition = self
            .processed_root
            .join(date.format("%Y%m%d").to_string());
        ensure_directory(&partition)?;

        let destination = resolve_conflict(&partition, file_name)?;
        move_into_archive(source, &destination)?;

        info!(
            "Moved file to processed: {} -> {}",
            source.display(),
            destination.display()
        );
        Ok(destination)
    }

    /// Deletes archived files last modified more than `retention_days` ago,
    /// then removes date partitions left empty.
    pub fn cleanup_older_than(&self, retention_days: u32) -> Result<CleanupReport, StorageError> {
        let mut report = CleanupReport::default();
        if !self.processed_root.exists() {
            return Ok(report);
        }

        let window = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
        let cutoff = SystemTime::now()
            .checked_sub(window)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut dirs = Vec::new();
        for entry in WalkDir::new(&self.processed_root).min_depth(1) {
            let entry = entry.map_err(|e| StorageError::Walk {
                path: self.processed_root.clone(),
                source: e,
            })?;
            let path = entry.path();

            if entry.file_type().is_dir() {
                dirs.push(path.to_path_buf());
                continue;
            }
            if self.is_kept(path) {
                continue;
            }

            let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
                Some(modified) => modified,
                None => {
                    warn!("Could not read modification time of {}", path.display());
                    continue;
                }
            };

            if modified < cutoff {
                std::fs::remove_file(path).map_err(|e| StorageError::RemoveFile {
                    path: path.to_path_buf(),
                    source: e,
                })?;
                debug!("Deleted old file: {}", path.display());
                report.removed_files += 1;
            }
        }

        // Deepest first so nested empties collapse.
        dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
        for dir in dirs {
            let is_empty = std::fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if is_empty {
                std::fs::remove_dir(&dir).map_err(|e| StorageError::RemoveFile {
                    path: dir.clone(),
                    source: e,
                })?;
                report.removed_dirs += 1;
            }
        }

        if report.removed_files > 0 {
            info!("Cleaned up {} old files", report.removed_files);
        }
        Ok(report)
    }

    fn is_kept(&self, path: &Path) -> bool {
        self.keep.iter().any(|k| {
            if path == k {
                return true;
            }
            // The index's write-ahead temp file.
            let mut tmp = k.as_os_str().to_owned();
            tmp.push(".tmp");
            path.as_os_str() == tmp
        })
    }
}

fn ensure_directory(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// Finds a free name in `directory`: `name.ext`, then `name_1.ext`,
/// `name_2.ext`, ...
fn resolve_conflict(directory: &Path, filename: &str) -> Result<PathBuf, StorageError> {
    let path = directory.join(filename);
    if std::fs::symlink_metadata(&path).is_err() {
        return Ok(path);
    }

    let (base, ext) = match filename.rfind('.') {
        Some(dot_pos) if dot_pos > 0 => (&filename[..dot_pos], Some(&filename[dot_pos..])),
        _ => (filename, None),
    };

    for counter in 1..=MAX_SUFFIX {
        let candidate = match ext {
            Some(ext) => format!("{}_{}{}", base, counter, ext),
            None => format!("{}_{}", base, counter),
        };
        let candidate = directory.join(candidate);
        if std::fs::symlink_metadata(&candidate).is_err() {
            return Ok(candidate);
        }
    }

    Err(StorageError::FileExists(path))
}
