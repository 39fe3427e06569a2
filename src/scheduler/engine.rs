use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::cron::next_fire_time;
use super::executor::JobExecutor;
use crate::core::{BackupTool, CliBackupTool, SnapshotEntry};
use crate::state::{
    ConfigStore, CronSchedule, DirectoryConfig, DirectoryConfigUpdate, DirectoryEntry, DirectoryStats, StoreEvent,
};

/// Longest single sleep; the loop re-arms after waking even if nothing is due.
pub const MAX_TIMER_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Next time `config` should be backed up, or `None` if it is disabled, already
/// queued or running, or its schedule is unusable.
///
/// Counting starts from the later of the last backup and the last schedule
/// edit, falling back to `now`. Cron fields are read in local time.
pub fn calculate_next_backup(config: &DirectoryConfig, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if !config.backup_enabled || !config.backup_state.is_backup_eligible() {
        return None;
    }

    let reference = config.last_backup.max(config.last_modified).unwrap_or(now);

    match next_fire_time(&config.schedule, &reference.with_timezone(&Local)) {
        Ok(next) => Some(next.with_timezone(&Utc)),
        Err(e) => {
            warn!("Invalid backup schedule '{}': {}", config.schedule, e);
            None
        }
    }
}

/// Sleep length until `next`: zero when overdue, capped at [`MAX_TIMER_DELAY`].
pub fn timer_delay(next: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (next - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .min(MAX_TIMER_DELAY)
}

#[derive(Debug, Clone)]
pub struct ScheduledBackup {
    pub entry: DirectoryEntry,
    pub next_backup: DateTime<Utc>,
}

/// Next backup time of every registered directory that has one. Directories
/// whose config cannot be loaded are logged and left out.
pub async fn scheduled_backups(store: &ConfigStore, now: DateTime<Utc>) -> Vec<ScheduledBackup> {
    let mut scheduled = Vec::new();

    for entry in store.registry().await.directories {
        let config = match store.directory_config(&entry.path).await {
            Ok(config) => config,
            Err(e) => {
                warn!("Skipping {}: {:#}", entry.name, e);
                continue;
            }
        };

        if let Some(next_backup) = calculate_next_backup(&config, now) {
            scheduled.push(ScheduledBackup { entry, next_backup });
        }
    }

    scheduled
}

/// Queue every directory whose next backup is at or before `now`.
/// Returns how many were queued.
pub async fn run_due_backups<T: BackupTool>(
    store: &ConfigStore,
    executor: &JobExecutor<T>,
    now: DateTime<Utc>,
) -> usize {
    let mut queued = 0;

    for backup in scheduled_backups(store, now).await {
        if backup.next_backup > now {
            continue;
        }
        match executor.schedule_backup(&backup.entry.path).await {
            Ok(true) => {
                info!("Backup due: {} (scheduled for {})", backup.entry.name, backup.next_backup);
                queued += 1;
            }
            Ok(false) => {}
            Err(e) => error!("Failed to queue backup of {}: {:#}", backup.entry.name, e),
        }
    }

    queued
}

/// Owns the timer loop that turns schedules into queued backups.
pub struct BackupScheduler<T: BackupTool> {
    store: Arc<ConfigStore>,
    executor: Arc<JobExecutor<T>>,
    wake: Arc<Notify>,
    events: Option<broadcast::Receiver<StoreEvent>>,
    cancellation: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T: BackupTool> BackupScheduler<T> {
    /// Subscribes to store events right away so nothing committed before
    /// `start` is missed.
    pub fn new(store: Arc<ConfigStore>, executor: Arc<JobExecutor<T>>) -> Self {
        let events = Some(store.events());
        Self {
            store,
            executor,
            wake: Arc::new(Notify::new()),
            events,
            cancellation: CancellationToken::new(),
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Backup scheduler already running");
            return;
        }

        if self.cancellation.is_cancelled() {
            self.cancellation = CancellationToken::new();
        }

        let scheduler_loop = SchedulerLoop {
            store: Arc::clone(&self.store),
            executor: Arc::clone(&self.executor),
            events: self.events.take().unwrap_or_else(|| self.store.events()),
            wake: Arc::clone(&self.wake),
            cancellation: self.cancellation.clone(),
        };

        self.task = Some(tokio::spawn(scheduler_loop.run()));
    }

    /// Stop the loop. Queued and running backups are left to finish.
    pub async fn stop(&mut self) {
        self.cancellation.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Backup scheduler task failed: {}", e);
            }
        }
    }

    /// Recompute the timer now, e.g. after the machine wakes from sleep.
    pub fn reschedule(&self) {
        self.wake.notify_one();
    }

    /// Queue a backup of the named directory regardless of its schedule.
    /// Returns `false` if it is already queued or running.
    pub async fn backup_now(&self, name: &str) -> Result<bool> {
        let path = self.store.directory_path(name).await?;
        info!("Manual backup requested: {}", name);
        self.executor.schedule_backup(&path).await
    }

    pub async fn directory_stats(&self, name: &str) -> Result<DirectoryStats> {
        let directory_config = self.store.directory_config_by_name(name).await?;
        let next_backup = calculate_next_backup(&directory_config, Utc::now());
        Ok(DirectoryStats {
            directory_config,
            next_backup,
        })
    }

    /// Apply a user edit to the schedule or enable flag, stamping
    /// `last_modified` so the next backup counts from the edit.
    pub async fn update_schedule(
        &self,
        name: &str,
        schedule: Option<CronSchedule>,
        backup_enabled: Option<bool>,
    ) -> Result<()> {
        let path = self.store.directory_path(name).await?;
        let update = DirectoryConfigUpdate {
            schedule,
            backup_enabled,
            last_modified: Some(Some(Utc::now())),
            ..DirectoryConfigUpdate::default()
        };
        self.store.update_directory_config(&path, update).await
    }

    pub async fn read_backup_log(&self, name: &str) -> Result<String> {
        let path = self.store.directory_path(name).await?;
        crate::core::read_backup_log(&path).await
    }
}

impl BackupScheduler<CliBackupTool> {
    pub async fn list_snapshots(&self, name: &str) -> Result<Vec<SnapshotEntry>> {
        let path = self.store.directory_path(name).await?;
        self.executor.tool().list_snapshots(&path).await
    }
}

impl<T: BackupTool> Drop for BackupScheduler<T> {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

enum Wakeup {
    Stop,
    Timer,
    Store(Result<StoreEvent, RecvError>),
    Reschedule,
}

struct SchedulerLoop<T: BackupTool> {
    store: Arc<ConfigStore>,
    executor: Arc<JobExecutor<T>>,
    events: broadcast::Receiver<StoreEvent>,
    wake: Arc<Notify>,
    cancellation: CancellationToken,
}

impl<T: BackupTool> SchedulerLoop<T> {
    async fn run(mut self) {
        info!("Backup scheduler started");

        loop {
            let delay = self.next_delay().await;
            let timer = async move {
                match delay {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => future::pending::<()>().await,
                }
            };

            let wakeup = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => Wakeup::Stop,
                event = self.events.recv() => Wakeup::Store(event),
                _ = self.wake.notified() => Wakeup::Reschedule,
                _ = timer => Wakeup::Timer,
            };

            match wakeup {
                Wakeup::Stop => break,
                Wakeup::Timer => {
                    run_due_backups(&self.store, &self.executor, Utc::now()).await;
                }
                Wakeup::Store(Ok(event)) => {
                    trace!(?event, "Store changed");
                    self.drain_events();
                }
                Wakeup::Store(Err(RecvError::Lagged(skipped))) => {
                    debug!("Missed {} store events, recomputing", skipped);
                }
                Wakeup::Store(Err(RecvError::Closed)) => {
                    warn!("Store event channel closed");
                    break;
                }
                Wakeup::Reschedule => debug!("Reschedule requested"),
            }
        }

        info!("Backup scheduler stopped");
    }

    /// Swallow whatever else is already buffered so a burst costs one recompute.
    fn drain_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    async fn next_delay(&self) -> Option<Duration> {
        let now = Utc::now();
        let earliest = scheduled_backups(&self.store, now)
            .await
            .into_iter()
            .min_by_key(|backup| backup.next_backup);

        match earliest {
            Some(backup) => {
                let delay = timer_delay(backup.next_backup, now);
                debug!("Next backup: {} at {} (timer {:?})", backup.entry.name, backup.next_backup, delay);
                Some(delay)
            }
            None => {
                debug!("No backups scheduled");
                None
            }
        }
    }
}
