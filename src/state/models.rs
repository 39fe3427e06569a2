use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Subdirectory whose presence marks a path as initialized for the backup tool
pub const MARKER_DIR: &str = ".duplicacy";

/// Per-directory config document, stored inside the marker directory
pub const DIRECTORY_CONFIG_FILE: &str = "dupliwatch.json";

/// Output of the most recent backup run, stored inside the marker directory
pub const BACKUP_LOG_FILE: &str = "backup-log.txt";

pub fn marker_dir(directory: &Path) -> PathBuf {
    directory.join(MARKER_DIR)
}

pub fn directory_config_path(directory: &Path) -> PathBuf {
    marker_dir(directory).join(DIRECTORY_CONFIG_FILE)
}

pub fn backup_log_path(directory: &Path) -> PathBuf {
    marker_dir(directory).join(BACKUP_LOG_FILE)
}

/// A user-registered backup target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Unique identifier, `[A-Za-z0-9_]+`
    pub name: String,

    /// Absolute filesystem path
    pub path: PathBuf,
}

impl DirectoryEntry {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Registry of directory entries, persisted as one document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryList {
    pub directories: Vec<DirectoryEntry>,
}

impl DirectoryList {
    pub fn find(&self, name: &str) -> Option<&DirectoryEntry> {
        self.directories.iter().find(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }
}

/// Six cron-style field expressions, evaluated as
/// `second minute hour day-of-month month day-of-week`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CronSchedule {
    pub second: String,
    pub minute: String,
    pub hour: String,
    pub day_of_month: String,
    pub month: String,
    pub day_of_week: String,
}

impl Default for CronSchedule {
    /// Top of every minute
    fn default() -> Self {
        Self {
            second: "0".to_string(),
            minute: "*".to_string(),
            hour: "*".to_string(),
            day_of_month: "*".to_string(),
            month: "*".to_string(),
            day_of_week: "*".to_string(),
        }
    }
}

impl CronSchedule {
    /// Fields in evaluation order
    pub fn fields(&self) -> [&str; 6] {
        [
            &self.second,
            &self.minute,
            &self.hour,
            &self.day_of_month,
            &self.month,
            &self.day_of_week,
        ]
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fields().join(" "))
    }
}

/// Backup lifecycle of one directory
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupState {
    #[default]
    Idle,
    /// Accepted by the queue, not started yet
    Pending,
    /// Subprocess running
    Executing,
    Done,
    Error,
}

impl BackupState {
    /// States from which a new backup may be scheduled
    pub fn is_backup_eligible(self) -> bool {
        matches!(self, BackupState::Idle | BackupState::Done | BackupState::Error)
    }

    /// States that cannot survive a process restart
    pub fn is_in_flight(self) -> bool {
        matches!(self, BackupState::Pending | BackupState::Executing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupState::Idle => "idle",
            BackupState::Pending => "pending",
            BackupState::Executing => "executing",
            BackupState::Done => "done",
            BackupState::Error => "error",
        }
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schedule and lifecycle state for one directory, keyed by its path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DirectoryConfig {
    #[serde(rename = "backupSchedule", alias = "schedule")]
    pub schedule: CronSchedule,

    pub backup_enabled: bool,

    /// Start time of the most recent backup
    pub last_backup: Option<DateTime<Utc>>,

    /// Last user edit of `schedule` / `backup_enabled`
    pub last_modified: Option<DateTime<Utc>>,

    pub backup_state: BackupState,

    pub last_backup_result: String,

    /// Captured output of the most recent run
    pub last_backup_log: String,
}

impl DirectoryConfig {
    /// Shallow merge: only fields present in `update` are replaced.
    pub fn apply(&mut self, update: DirectoryConfigUpdate) {
        if let Some(schedule) = update.schedule {
            self.schedule = schedule;
        }
        if let Some(enabled) = update.backup_enabled {
            self.backup_enabled = enabled;
        }
        if let Some(last_backup) = update.last_backup {
            self.last_backup = last_backup;
        }
        if let Some(last_modified) = update.last_modified {
            self.last_modified = last_modified;
        }
        if let Some(state) = update.backup_state {
            self.backup_state = state;
        }
        if let Some(result) = update.last_backup_result {
            self.last_backup_result = result;
        }
        if let Some(log) = update.last_backup_log {
            self.last_backup_log = log;
        }
    }

    pub fn merged(mut self, update: DirectoryConfigUpdate) -> Self {
        self.apply(update);
        self
    }
}

/// Partial DirectoryConfig. `None` leaves a field untouched; the nullable
/// timestamps use `Some(None)` to clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryConfigUpdate {
    pub schedule: Option<CronSchedule>,
    pub backup_enabled: Option<bool>,
    pub last_backup: Option<Option<DateTime<Utc>>>,
    pub last_modified: Option<Option<DateTime<Utc>>>,
    pub backup_state: Option<BackupState>,
    pub last_backup_result: Option<String>,
    pub last_backup_log: Option<String>,
}

impl DirectoryConfigUpdate {
    pub fn state(state: BackupState) -> Self {
        Self {
            backup_state: Some(state),
            ..Self::default()
        }
    }

    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.last_backup_result = Some(result.into());
        self
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.last_backup_log = Some(log.into());
        self
    }

    pub fn with_last_backup(mut self, at: DateTime<Utc>) -> Self {
        self.last_backup = Some(Some(at));
        self
    }
}

/// Application-level settings document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AppSettings {
    pub open_at_login: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppSettingsUpdate {
    pub open_at_login: Option<bool>,
}

impl AppSettings {
    pub fn apply(&mut self, update: AppSettingsUpdate) {
        if let Some(open_at_login) = update.open_at_login {
            self.open_at_login = open_at_login;
        }
    }
}

/// Config plus its computed next due time, as shown to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryStats {
    pub directory_config: DirectoryConfig,
    pub next_backup: Option<DateTime<Utc>>,
}
