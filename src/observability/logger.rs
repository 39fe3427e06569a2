use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogRotation;

const LOG_FILE_NAME: &str = "dupliwatch.log";

/// Must be kept alive for the entire application lifetime
static LOG_GUARD: OnceLock<Mutex<Option<tracing_appender::non_blocking::WorkerGuard>>> = OnceLock::new();

/// Log rotation strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Daily,
    Hourly,
    Never,
}

impl From<&LogRotation> for Rotation {
    fn from(rotation: &LogRotation) -> Self {
        match rotation {
            LogRotation::Daily => Rotation::Daily,
            LogRotation::Hourly => Rotation::Hourly,
            LogRotation::Never => Rotation::Never,
        }
    }
}

/// Install the global subscriber: console always, rolling file when `log_dir` is set.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init_logging(
    level: &str,
    log_dir: Option<&Path>,
    rotation: Rotation,
) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer);

    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)?;

        let file_appender = match rotation {
            Rotation::Daily => tracing_appender::rolling::daily(dir, LOG_FILE_NAME),
            Rotation::Hourly => tracing_appender::rolling::hourly(dir, LOG_FILE_NAME),
            Rotation::Never => tracing_appender::rolling::never(dir, LOG_FILE_NAME),
        };

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false);

        subscriber.with(file_layer).try_init()?;

        LOG_GUARD.set(Mutex::new(Some(guard)))
            .map_err(|_| anyhow::anyhow!("Logger already initialized"))?;
    } else {
        subscriber.try_init()?;
    }

    Ok(())
}

/// Flush buffered file output. Safe to call when file logging was never enabled.
pub fn shutdown_logging() {
    if let Some(mutex) = LOG_GUARD.get() {
        if let Ok(mut guard_option) = mutex.lock() {
            if let Some(guard) = guard_option.take() {
                drop(guard);
            }
        }
    }
}
