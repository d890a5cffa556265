use std::path::{Path, PathBuf};

use thiserror::Error;

use super::Table;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("Unsupported sheet format: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("Failed to parse '{path}': {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Turns the raw bytes of an attachment into a [`Table`].
///
/// Parsing binary workbook formats is left to implementors; the crate
/// ships [`CsvSheetReader`] for delimited exports.
pub trait SheetReader: Send + Sync {
    fn supports(&self, path: &Path) -> bool;

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<Table, ReadError>;
}

/// Reads comma separated (`.csv`) and tab separated (`.tsv`) sheets.
/// The first record is the header row.
#[derive(Debug, Clone, Copy, Default)]
pub struct CsvSheetReader;

impl CsvSheetReader {
    /// File extensions this reader can parse, lowercase and without a dot.
    pub const EXTENSIONS: &'static [&'static str] = &["csv", "tsv"];

    pub fn new() -> Self {
        Self
    }

    fn delimiter_for(path: &Path) -> Option<u8> {
        let ext = path.extension()?.to_str()?;
        Self::delimiter_for_extension(ext)
    }

    fn delimiter_for_extension(ext: &str) -> Option<u8> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Some(b','),
            "tsv" => Some(b'\t'),
            _ => None,
        }
    }

    /// Whether `ext` (with or without a leading dot) names a readable format.
    pub fn supports_extension(ext: &str) -> bool {
        Self::delimiter_for_extension(ext.trim_start_matches('.')).is_some()
    }
}

impl SheetReader for CsvSheetReader {
    fn supports(&self, path: &Path) -> bool {
        Self::delimiter_for(path).is_some()
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<Table, ReadError> {
        let delimiter = Self::delimiter_for(path)
            .ok_or_else(|| ReadError::UnsupportedFormat(path.to_path_buf()))?;

        let csv_err = |source: csv::Error| ReadError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let columns: Vec<String> = reader
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(csv_err)?;
            let row = record
                .iter()
                .map(|v| {
                    if v.is_empty() {
                        None
                    } else {
                        Some(v.to_string())
                    }
                })
                .collect();
            rows.push(row);
        }

        Ok(Table::new(columns, rows))
    }
}
