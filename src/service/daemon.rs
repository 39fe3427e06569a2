use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::core::CliBackupTool;
use crate::observability::shutdown_logging;
use crate::scheduler::{BackupScheduler, JobExecutor};
use crate::service::{setup_shutdown_handler, RecoveryManager};
use crate::state::ConfigStore;

/// Service daemon orchestrating all operations
pub struct ServiceDaemon {
    config: ServiceConfig,
    store: Arc<ConfigStore>,
    recovery: RecoveryManager,
    cancellation: CancellationToken,
}

impl ServiceDaemon {
    pub async fn new(config: ServiceConfig) -> Result<Self> {
        Self::with_cancellation(config, CancellationToken::new()).await
    }

    /// Create daemon with an external cancellation token
    pub async fn with_cancellation(config: ServiceConfig, cancellation: CancellationToken) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", config.data_dir.display()))?;

        let store = Arc::new(ConfigStore::from_config(&config));
        let recovery = RecoveryManager::new(Arc::clone(&store));

        Ok(Self {
            config,
            store,
            recovery,
            cancellation,
        })
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Run until a shutdown signal arrives or the cancellation token fires
    pub async fn run(self) -> Result<()> {
        info!("Dupliwatch service starting...");

        setup_shutdown_handler(self.cancellation.clone()).await;

        let cleared = self.recovery.clear_interrupted_backups().await?;
        if cleared > 0 {
            info!("Reset {} interrupted backups", cleared);
        }

        let tool = Arc::new(CliBackupTool::new(self.config.backup_tool.clone()));
        let executor = Arc::new(JobExecutor::new(Arc::clone(&self.store), tool));
        let mut scheduler = BackupScheduler::new(Arc::clone(&self.store), Arc::clone(&executor));
        scheduler.start();

        let registry = self.store.registry().await;
        info!("Watching {} directories", registry.directories.len());

        self.cancellation.cancelled().await;

        info!("Shutdown signal received, stopping scheduler...");
        scheduler.stop().await;
        self.drain_queue(&executor).await;

        info!("Dupliwatch service stopped");
        info!("Flushing logs before shutdown...");
        shutdown_logging();

        Ok(())
    }

    /// Give queued backups a bounded chance to finish
    async fn drain_queue(&self, executor: &JobExecutor<CliBackupTool>) {
        let queue = executor.queue();
        if queue.is_idle() {
            return;
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_seconds);
        info!("Waiting up to {:?} for {} queued backups...", grace, queue.len());

        if tokio::time::timeout(grace, queue.wait_idle()).await.is_err() {
            warn!(
                "{} backups still outstanding at shutdown; they will be marked as interrupted on next start",
                queue.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackupToolConfig;
    use crate::state::models::{directory_config_path, MARKER_DIR};
    use crate::state::{BackupState, DirectoryConfig, DirectoryConfigUpdate, DirectoryEntry, DirectoryList};
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> ServiceConfig {
        ServiceConfig {
            data_dir: dir.path().join("data"),
            backup_tool: BackupToolConfig {
                binary: "dupliwatch-no-such-binary".to_string(),
                ..BackupToolConfig::default()
            },
            shutdown_grace_seconds: 5,
            ..ServiceConfig::default()
        }
    }

    #[tokio::test]
    async fn test_creates_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        ServiceDaemon::new(config.clone()).await.unwrap();
        assert!(config.data_dir.is_dir());
    }

    #[tokio::test]
    async fn test_recovers_then_runs_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::create_dir_all(&config.data_dir).unwrap();

        let docs = dir.path().join("docs");
        std::fs::create_dir_all(docs.join(MARKER_DIR)).unwrap();
        let interrupted = DirectoryConfig {
            backup_state: BackupState::Executing,
            ..DirectoryConfig::default()
        };
        std::fs::write(directory_config_path(&docs), serde_json::to_string(&interrupted).unwrap()).unwrap();
        let registry = DirectoryList { directories: vec![DirectoryEntry::new("docs", &docs)] };
        std::fs::write(config.registry_path(), serde_json::to_string(&registry).unwrap()).unwrap();

        let cancellation = CancellationToken::new();
        let daemon = ServiceDaemon::with_cancellation(config, cancellation.clone()).await.unwrap();
        let store = Arc::clone(daemon.store());
        let handle = tokio::spawn(daemon.run());

        // Wait for the recovery sweep
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.directory_config(&docs).await.unwrap().backup_state != BackupState::Error {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            store.directory_config(&docs).await.unwrap().last_backup_result,
            "Dupliwatch was closed while backup was executing."
        );

        // Make it due; the missing tool binary turns the run into an error
        let before = Utc::now();
        let update = DirectoryConfigUpdate {
            backup_enabled: Some(true),
            last_modified: Some(Some(before - chrono::Duration::minutes(2))),
            ..DirectoryConfigUpdate::default()
        };
        store.update_directory_config(&docs, update).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let config = store.directory_config(&docs).await.unwrap();
                if config.last_backup.is_some_and(|at| at >= before) && !config.backup_state.is_in_flight() {
                    return config;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .map(|config| {
            assert_eq!(config.backup_state, BackupState::Error);
            assert!(config.last_backup_result.starts_with("Error: Failed to launch"));
        })
        .unwrap();

        cancellation.cancel();
        handle.await.unwrap().unwrap();
    }
}
