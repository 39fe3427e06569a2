use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::state::{BackupState, ConfigStore, DirectoryConfigUpdate};

pub fn interrupted_message(state: BackupState) -> String {
    format!("Dupliwatch was closed while backup was {}.", state)
}

pub struct RecoveryManager {
    store: Arc<ConfigStore>,
}

impl RecoveryManager {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self { store }
    }

    /// Mark backups left `pending` or `executing` by a previous run as failed.
    ///
    /// Must finish before the scheduler starts; in-flight states are never
    /// rescheduled otherwise. Returns how many directories were reset.
    pub async fn clear_interrupted_backups(&self) -> Result<usize> {
        info!("Checking for interrupted backups...");
        let mut cleared = 0;

        for entry in self.store.registry().await.directories {
            let config = match self.store.directory_config(&entry.path).await {
                Ok(config) => config,
                Err(e) => {
                    warn!("Skipping {}: {:#}", entry.name, e);
                    continue;
                }
            };

            let state = config.backup_state;
            if !state.is_in_flight() {
                continue;
            }

            warn!("Backup of {} was interrupted while {}", entry.name, state);
            let update = DirectoryConfigUpdate::state(BackupState::Error).with_result(interrupted_message(state));
            self.store
                .update_directory_config(&entry.path, update)
                .await
                .with_context(|| format!("Failed to reset interrupted backup of {}", entry.name))?;
            cleared += 1;
        }

        Ok(cleared)
    }
}
