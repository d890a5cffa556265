use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::config::schema::{default_base_dir, Config};
use crate::error::ConfigError;
use crate::table::{
    normalize_column_name, CsvSheetReader, FILE_SOURCE_COLUMN, PROCESSED_AT_COLUMN,
};

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

/// Returns the canonical config path: `~/.sheetload/config.json`.
pub fn default_config_path() -> PathBuf {
    default_base_dir().join("config.json")
}

fn identifier_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

/// Plain unquoted SQL identifier: letters, digits and underscores, not
/// starting with a digit.
pub fn is_sql_identifier(value: &str) -> bool {
    identifier_pattern().is_some_and(|re| re.is_match(value))
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let identifiers = [
        ("database.staging_schema", &config.database.staging_schema),
        ("database.target_table", &config.database.target_table),
        ("database.business_key", &config.database.business_key),
    ];
    for (field, value) in identifiers {
        if !is_sql_identifier(value) {
            return Err(ConfigError::InvalidIdentifier {
                field: field.to_string(),
                value: value.clone(),
            });
        }
    }

    let key = normalize_column_name(&config.database.business_key);
    if key == FILE_SOURCE_COLUMN || key == PROCESSED_AT_COLUMN {
        return Err(ConfigError::Validation {
            message: format!(
                "database.business_key '{}' is a metadata column written on every row",
                config.database.business_key
            ),
        });
    }

    if config.database.staging_schema.eq_ignore_ascii_case("main")
        || config.database.staging_schema.eq_ignore_ascii_case("temp")
    {
        return Err(ConfigError::Validation {
            message: format!(
                "Staging schema '{}' collides with a built-in schema",
                config.database.staging_schema
            ),
        });
    }

    if config.processing.file_retention_days == 0 {
        return Err(ConfigError::Validation {
            message: "processing.file_retention_days must be at least 1".to_string(),
        });
    }

    if config.queue.poll_interval_ms == 0 {
        return Err(ConfigError::Validation {
            message: "queue.poll_interval_ms must be positive".to_string(),
        });
    }

    if config.processing.allowed_extensions.is_empty() {
        return Err(ConfigError::Validation {
            message: "processing.allowed_extensions must not be empty".to_string(),
        });
    }

    if let Some(ext) = config
        .processing
        .allowed_extensions
        .iter()
        .find(|ext| !CsvSheetReader::supports_extension(ext))
    {
        return Err(ConfigError::Validation {
            message: format!(
                "processing.allowed_extensions contains '{}', supported: {}",
                ext,
                CsvSheetReader::EXTENSIONS.join(", ")
            ),
        });
    }

    Ok(())
}
