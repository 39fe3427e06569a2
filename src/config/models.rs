use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_DATA_DIR: &str = ".dupliwatch";
const DEFAULT_TOOL_BINARY: &str = "duplicacy";
const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 300;

#[inline]
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

#[inline]
fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

#[inline]
fn default_shutdown_grace_seconds() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECONDS
}

/// Main service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding the registry and the application settings document
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file directory (if None, only console logging)
    #[serde(default)]
    pub log_directory: Option<PathBuf>,

    /// Log file rotation strategy
    #[serde(default)]
    pub log_rotation: LogRotation,

    /// External backup tool invocation
    #[serde(default)]
    pub backup_tool: BackupToolConfig,

    /// How long shutdown waits for queued backups before exiting
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            log_directory: None,
            log_rotation: LogRotation::default(),
            backup_tool: BackupToolConfig::default(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

impl ServiceConfig {
    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("directories.json")
    }

    pub fn app_settings_path(&self) -> PathBuf {
        self.data_dir.join("app-config.json")
    }
}

/// Log file rotation strategy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogRotation {
    /// Rotate daily
    #[default]
    Daily,
    /// Rotate hourly
    Hourly,
    /// Never rotate (single file)
    Never,
}

/// How the external backup binary is launched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupToolConfig {
    /// Binary name or path, resolved through PATH when bare
    pub binary: String,

    /// Arguments for a backup run
    pub backup_args: Vec<String>,

    /// Arguments for listing snapshots
    pub list_args: Vec<String>,
}

impl Default for BackupToolConfig {
    fn default() -> Self {
        Self {
            binary: DEFAULT_TOOL_BINARY.to_string(),
            backup_args: vec!["backup".to_string(), "--stats".to_string()],
            list_args: vec!["list".to_string()],
        }
    }
}
