pub mod loader;
pub mod schema;

pub use loader::{
    default_config_path, is_sql_identifier, load_config, load_config_from_str, validate_config,
};
pub use schema::{
    default_base_dir, Config, DatabaseConfig, LogFormat, LoggingConfig, ProcessingConfig,
    QueueConfig,
};
