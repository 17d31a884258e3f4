//! Process-level configuration from environment variables.

use std::env;

/// Environment configuration resolved once at startup.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// SQLite database file path.
    pub db_path: String,

    /// YAML file holding the hot-reloadable component configs.
    pub config_file_path: String,

    /// Structured JSON log file.
    pub log_file_path: String,

    /// User-provided font library scanned by the subtitle catalog.
    pub font_dir: String,

    /// Verbose request logging when true.
    pub dev: bool,
}

impl EnvConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("DB_PATH").unwrap_or_else(|_| "/data/data.db".to_string()),
            config_file_path: env::var("CONFIG_FILE_PATH")
                .unwrap_or_else(|_| "/config/config.yaml".to_string()),
            log_file_path: env::var("LOG_FILE_PATH")
                .unwrap_or_else(|_| "/data/log/log.log".to_string()),
            font_dir: env::var("FONT_DIR").unwrap_or_else(|_| "/data/fonts".to_string()),
            dev: env::var("DEV").map(|v| v == "true" || v == "1").unwrap_or(false),
        }
    }
}
