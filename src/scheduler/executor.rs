use anyhow::Result;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::queue::JobQueue;
use crate::core::BackupTool;
use crate::state::{BackupState, ConfigStore, DirectoryConfigUpdate};

pub const SUCCESS_RESULT: &str = "Success!";

/// Moves directories through `pending -> executing -> done | error` and feeds
/// the serialized job queue.
pub struct JobExecutor<T: BackupTool> {
    store: Arc<ConfigStore>,
    tool: Arc<T>,
    queue: JobQueue,
}

impl<T: BackupTool> JobExecutor<T> {
    /// Must be called inside a Tokio runtime (spawns the queue worker).
    pub fn new(store: Arc<ConfigStore>, tool: Arc<T>) -> Self {
        Self {
            store,
            tool,
            queue: JobQueue::new(),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn tool(&self) -> &Arc<T> {
        &self.tool
    }

    /// Queue a backup of `directory` if it is idle, done or errored.
    ///
    /// The state check and the switch to `pending` are one store operation, so
    /// concurrent calls for the same directory queue it at most once. Returns
    /// whether a job was queued.
    pub async fn schedule_backup(&self, directory: &Path) -> Result<bool> {
        let accepted = self.store
            .update_directory_config_if(
                directory,
                |config| config.backup_state.is_backup_eligible(),
                DirectoryConfigUpdate::state(BackupState::Pending),
            )
            .await?;

        if !accepted {
            debug!("Backup already queued or running: {}", directory.display());
            return Ok(false);
        }

        info!("Queued backup: {} ({} jobs outstanding)", directory.display(), self.queue.len() + 1);

        let store = Arc::clone(&self.store);
        let tool = Arc::clone(&self.tool);
        let directory = directory.to_path_buf();
        self.queue.enqueue(async move {
            execute_backup(&store, tool.as_ref(), &directory).await;
        });

        Ok(true)
    }
}

/// One queued backup. Every failure ends up recorded on the directory config.
async fn execute_backup<T: BackupTool>(store: &ConfigStore, tool: &T, directory: &Path) {
    let started = DirectoryConfigUpdate::state(BackupState::Executing).with_last_backup(Utc::now());
    if let Err(e) = store.update_directory_config(directory, started).await {
        error!("Failed to start backup of {}: {:#}", directory.display(), e);
        let failed = DirectoryConfigUpdate::state(BackupState::Error).with_result(format!("Error: {:#}", e));
        if let Err(e) = store.update_directory_config(directory, failed).await {
            error!("Failed to record backup error for {}: {:#}", directory.display(), e);
        }
        return;
    }

    let outcome = tool.backup(directory).await;

    let update = match &outcome.error {
        None => {
            info!("Backup completed: {}", directory.display());
            DirectoryConfigUpdate::state(BackupState::Done).with_result(SUCCESS_RESULT)
        }
        Some(message) => {
            warn!("Backup failed: {}: {}", directory.display(), message);
            DirectoryConfigUpdate::state(BackupState::Error).with_result(format!("Error: {}", message))
        }
    }
    .with_log(outcome.combined_log());

    if let Err(e) = store.update_directory_config(directory, update).await {
        error!("Failed to record backup result for {}: {:#}", directory.display(), e);
    }
}
