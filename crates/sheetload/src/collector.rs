//! Turns spreadsheets dropped into the pending directory into jobs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use walkdir::WalkDir;

use crate::error::WorkerError;
use crate::worker::JobRequest;

pub const PENDING_SENDER: &str = "pending-dir";

pub struct PendingScanner {
    pending_dir: PathBuf,
    extensions: Vec<String>,
    /// Files handed out as jobs, keyed by path, with the job id.
    queued: HashMap<PathBuf, String>,
}

impl PendingScanner {
    pub fn new<P: AsRef<Path>>(pending_dir: P, extensions: &[String]) -> Self {
        Self {
            pending_dir: pending_dir.as_ref().to_path_buf(),
            extensions: extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            queued: HashMap::new(),
        }
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    fn is_allowed(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|a| a.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// Lists spreadsheets directly inside the pending directory and returns
    /// one job request per file not already queued.
    pub fn scan(&mut self) -> Result<Vec<JobRequest>, WorkerError> {
        if !self.pending_dir.is_dir() {
            debug!(
                "Pending directory {} does not exist",
                self.pending_dir.display()
            );
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.pending_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| WorkerError::ScanFailed {
                path: self.pending_dir.clone(),
                source: e,
            })?;
            let path = entry.path();
            if entry.file_type().is_file() && self.is_allowed(path) {
                files.push(path.to_path_buf());
            }
        }

        let mut requests = Vec::new();
        for path in files {
            if self.queued.contains_key(&path) {
                debug!("Already queued: {}", path.display());
                continue;
            }

            let id = uuid::Uuid::new_v4().to_string();
            let source_ref = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.queued.insert(path.clone(), id.clone());
            requests.push(JobRequest::new(id, source_ref, PENDING_SENDER, vec![path]));
        }

        info!(
            "Found {} new file(s) in {}",
            requests.len(),
            self.pending_dir.display()
        );
        Ok(requests)
    }

    /// Keeps only the queued entries whose job `is_active` still reports as
    /// unfinished, so files left behind by failed jobs are picked up again.
    pub fn retain_queued<F>(&mut self, is_active: F)
    where
        F: Fn(&str) -> bool,
    {
        self.queued.retain(|_, id| is_active(id));
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }
}
