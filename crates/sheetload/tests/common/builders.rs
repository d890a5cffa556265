//! Builders for configurations and sheet contents used across tests.

#![allow(dead_code)]

use std::path::Path;

use sheetload::Config;

/// Builds a [`Config`] rooted in a temporary directory with timings short
/// enough for tests.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new(base: &Path) -> Self {
        let mut config = Config::with_base_dir(base);
        config.queue.poll_interval_ms = 10;
        config.queue.backoff_unit_ms = 1;
        config.queue.shutdown_timeout_secs = 5;
        Self { config }
    }

    pub fn business_key(mut self, key: &str) -> Self {
        self.config.database.business_key = key.to_string();
        self
    }

    pub fn target_table(mut self, table: &str) -> Self {
        self.config.database.target_table = table.to_string();
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.queue.max_retries = retries;
        self
    }

    pub fn backoff_unit_ms(mut self, unit: u64) -> Self {
        self.config.queue.backoff_unit_ms = unit;
        self
    }

    pub fn retention_days(mut self, days: u32) -> Self {
        self.config.processing.file_retention_days = days;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Renders a CSV sheet from a header and rows.
pub fn csv_sheet(header: &[&str], rows: &[&[&str]]) -> String {
    sheet(',', header, rows)
}

/// Renders a tab separated sheet from a header and rows.
pub fn tsv_sheet(header: &[&str], rows: &[&[&str]]) -> String {
    sheet('\t', header, rows)
}

fn sheet(delimiter: char, header: &[&str], rows: &[&[&str]]) -> String {
    let sep = delimiter.to_string();
    let mut out = header.join(&sep);
    out.push('\n');
    for row in rows {
        out.push_str(&row.join(&sep));
        out.push('\n');
    }
    out
}

/// Minimal JSON configuration pointing every path into `base`.
pub fn config_json(base: &Path, extra_database: &str) -> String {
    let base = base.display().to_string().replace('\\', "/");
    let database = if extra_database.is_empty() {
        String::new()
    } else {
        format!(", {}", extra_database)
    };
    format!(
        r#"{{
    "version": "1.0",
    "database": {{ "path": "{base}/data.db"{database} }},
    "processing": {{
        "pending_dir": "{base}/pending",
        "processed_dir": "{base}/processed"
    }},
    "queue": {{ "poll_interval_ms": 10, "backoff_unit_ms": 1 }}
}}"#
    )
}
