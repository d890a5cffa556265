//! Tabular dataset handed over by the sheet reader, plus the cleaning
//! rules applied before anything is staged.

pub mod reader;

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use reader::{CsvSheetReader, ReadError, SheetReader};

/// Metadata column holding the original file name of each staged row.
pub const FILE_SOURCE_COLUMN: &str = "file_source";
/// Metadata column holding the RFC 3339 load timestamp of each staged row.
pub const PROCESSED_AT_COLUMN: &str = "processed_at";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TableError {
    #[error("contains no data rows")]
    Empty,

    #[error("missing required column '{0}'")]
    MissingColumn(String),

    #[error("duplicate column '{0}' after header normalisation")]
    DuplicateColumn(String),

    #[error("no rows carry a value for '{0}'")]
    NoKeyedRows(String),
}

/// Counts of rows removed by [`Table::clean`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub empty_rows: usize,
    pub missing_key_rows: usize,
    pub duplicate_key_rows: usize,
}

impl CleanReport {
    pub fn dropped(&self) -> usize {
        self.empty_rows + self.missing_key_rows + self.duplicate_key_rows
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

impl Table {
    /// Creates a table. Rows are padded or truncated to the header width.
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        let width = columns.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, None);
                row
            })
            .collect();
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Normalises headers and cell values, then drops rows that cannot be
    /// loaded under `business_key`:
    ///
    /// - cells are trimmed and empty cells become missing values
    /// - fully empty rows are removed
    /// - rows without a business key value are removed
    /// - repeated business keys keep their first row
    pub fn clean(self, business_key: &str) -> Result<(Table, CleanReport), TableError> {
        if self.rows.is_empty() {
            return Err(TableError::Empty);
        }

        let mut seen_columns = HashSet::new();
        let mut columns = Vec::with_capacity(self.columns.len());
        for (idx, raw) in self.columns.iter().enumerate() {
            let mut name = normalize_column_name(raw);
            if name.is_empty() {
                name = format!("column_{}", idx + 1);
            }
            if !seen_columns.insert(name.clone()) {
                return Err(TableError::DuplicateColumn(name));
            }
            columns.push(name);
        }

        let key = normalize_column_name(business_key);
        let key_idx = columns
            .iter()
            .position(|c| *c == key)
            .ok_or_else(|| TableError::MissingColumn(key.clone()))?;

        let mut report = CleanReport::default();
        let mut seen_keys = HashSet::new();
        let mut rows = Vec::with_capacity(self.rows.len());

        for row in self.rows {
            let row: Vec<Option<String>> = row.into_iter().map(clean_cell).collect();

            if row.iter().all(Option::is_none) {
                report.empty_rows += 1;
                continue;
            }

            let Some(key_value) = row[key_idx].clone() else {
                report.missing_key_rows += 1;
                continue;
            };

            if !seen_keys.insert(key_value) {
                report.duplicate_key_rows += 1;
                continue;
            }

            rows.push(row);
        }

        if rows.is_empty() {
            return Err(TableError::NoKeyedRows(key));
        }

        Ok((Table { columns, rows }, report))
    }

    /// Returns a copy carrying the `file_source` and `processed_at`
    /// metadata columns. Existing columns of the same name are overwritten.
    pub fn with_metadata(&self, file_source: &str, processed_at: DateTime<Utc>) -> Table {
        let stamp = processed_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut table = self.clone();

        for (name, value) in [
            (FILE_SOURCE_COLUMN, file_source.to_string()),
            (PROCESSED_AT_COLUMN, stamp),
        ] {
            match table.column_index(name) {
                Some(idx) => {
                    for row in &mut table.rows {
                        row[idx] = Some(value.clone());
                    }
                }
                None => {
                    table.columns.push(name.to_string());
                    for row in &mut table.rows {
                        row.push(Some(value.clone()));
                    }
                }
            }
        }

        table
    }

    /// Deterministic digest of headers and cell values. Independent of the
    /// file name and of how the source file encoded the same data.
    pub fn content_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();

        hasher.update((self.columns.len() as u64).to_le_bytes());
        for column in &self.columns {
            update_str(&mut hasher, column);
        }

        hasher.update((self.rows.len() as u64).to_le_bytes());
        for row in &self.rows {
            for cell in row {
                match cell {
                    Some(value) => {
                        hasher.update([1u8]);
                        update_str(&mut hasher, value);
                    }
                    None => hasher.update([0u8]),
                }
            }
        }

        hex::encode(hasher.finalize())
    }
}

fn update_str(hasher: &mut Sha256, value: &str) {
    hasher.update((value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

fn clean_cell(cell: Option<String>) -> Option<String> {
    cell.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

/// Header normalisation: trim, lowercase, inner whitespace runs become `_`.
pub fn normalize_column_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}
