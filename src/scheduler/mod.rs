pub mod cron;
pub mod engine;
pub mod executor;
pub mod queue;

pub use cron::{next_fire_time, CronError, CronExpression};
pub use engine::{calculate_next_backup, BackupScheduler, MAX_TIMER_DELAY};
pub use executor::{JobExecutor, SUCCESS_RESULT};
pub use queue::JobQueue;
