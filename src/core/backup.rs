use anyhow::{Context, Result};
use std::future::Future;
use std::path::Path;
use tracing::info;

use super::command::{CommandExecutor, CommandOutcome};
use super::snapshots::{parse_snapshot_list, SnapshotEntry};
use crate::config::BackupToolConfig;
use crate::state::models::backup_log_path;

/// The external program that performs a backup of one directory
pub trait BackupTool: Send + Sync + 'static {
    /// Back up `directory`, running to completion.
    fn backup(&self, directory: &Path) -> impl Future<Output = CommandOutcome> + Send;
}

/// Backup tool driven through its command line
pub struct CliBackupTool {
    executor: CommandExecutor,
    config: BackupToolConfig,
}

impl CliBackupTool {
    pub fn new(config: BackupToolConfig) -> Self {
        Self {
            executor: CommandExecutor::new(config.binary.clone()),
            config,
        }
    }

    /// Revisions stored for `directory`, newest first
    pub async fn list_snapshots(&self, directory: &Path) -> Result<Vec<SnapshotEntry>> {
        let output = self.executor
            .run_with_output(&self.config.list_args, directory)
            .await
            .context("Failed to list snapshots")?;
        Ok(parse_snapshot_list(&output))
    }
}

impl BackupTool for CliBackupTool {
    async fn backup(&self, directory: &Path) -> CommandOutcome {
        info!("Backing up {}", directory.display());
        let log = backup_log_path(directory);
        self.executor.run(&self.config.backup_args, directory, Some(&log)).await
    }
}

/// Output of the most recent backup run for `directory`
pub async fn read_backup_log(directory: &Path) -> Result<String> {
    let path = backup_log_path(directory);
    tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read backup log {}", path.display()))
}
