use anyhow::{Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Result of one subprocess run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the process never started or was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Failure description; `None` iff the process exited with code 0
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Both streams in one block, stderr first
    pub fn combined_log(&self) -> String {
        format!("Stderr:\n{}\n\nStdout:\n{}", self.stderr, self.stdout)
    }
}

/// Launches one external program and collects its output.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Run to completion in `working_dir`.
    ///
    /// With `log` set, the file is truncated and both output streams are
    /// written to it chunk by chunk as they arrive. Launch failures come back
    /// as a failed outcome, the same as a nonzero exit. Never times out.
    pub async fn run(&self, args: &[String], working_dir: &Path, log: Option<&Path>) -> CommandOutcome {
        match self.try_run(args, working_dir, log).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(program = %self.program, "Command failed to run: {:#}", e);
                CommandOutcome::failed(format!("{:#}", e))
            }
        }
    }

    /// Run without a log file and return stdout, or the failure as an error.
    pub async fn run_with_output(&self, args: &[String], working_dir: &Path) -> Result<String> {
        let outcome = self.run(args, working_dir, None).await;
        match outcome.error {
            None => Ok(outcome.stdout),
            Some(message) => anyhow::bail!("{} {}: {}", self.program, args.join(" "), message),
        }
    }

    async fn try_run(&self, args: &[String], working_dir: &Path, log: Option<&Path>) -> Result<CommandOutcome> {
        let log_file = match log {
            Some(path) => {
                let file = File::create(path).await
                    .with_context(|| format!("Failed to open log file {}", path.display()))?;
                Some(Arc::new(Mutex::new(file)))
            }
            None => None,
        };

        debug!(program = %self.program, ?args, cwd = %working_dir.display(), "Spawning command");

        let mut child = Command::new(&self.program)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to launch {}", self.program))?;

        let stdout = child.stdout.take().context("stdout was not captured")?;
        let stderr = child.stderr.take().context("stderr was not captured")?;

        let (stdout, stderr, status) = tokio::join!(
            pump(stdout, log_file.clone()),
            pump(stderr, log_file.clone()),
            child.wait(),
        );

        let status = status.with_context(|| format!("Failed to wait for {}", self.program))?;

        if let Some(log) = &log_file {
            log.lock().await.flush().await.context("Failed to flush log file")?;
        }

        let stdout = String::from_utf8_lossy(&stdout?).into_owned();
        let stderr = String::from_utf8_lossy(&stderr?).into_owned();

        let error = match status.code() {
            Some(0) => None,
            Some(code) => Some(format!("Exit code: {}", code)),
            None => Some("Terminated by signal".to_string()),
        };

        debug!(program = %self.program, code = ?status.code(), "Command finished");

        Ok(CommandOutcome {
            exit_code: status.code(),
            stdout,
            stderr,
            error,
        })
    }
}

/// Copy a stream into the shared log while keeping a copy for the outcome.
async fn pump<R>(mut reader: R, log: Option<Arc<Mutex<File>>>) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf).await.context("Failed to read process output")?;
        if n == 0 {
            break;
        }
        if let Some(log) = &log {
            log.lock().await.write_all(&buf[..n]).await.context("Failed to write log file")?;
        }
        captured.extend_from_slice(&buf[..n]);
    }

    Ok(captured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_missing_binary_is_failed_outcome() {
        let dir = TempDir::new().unwrap();
        let executor = CommandExecutor::new("dupliwatch-no-such-binary");

        let outcome = executor.run(&args(&["backup"]), dir.path(), None).await;

        assert!(!outcome.is_success());
        assert!(outcome.exit_code.is_none());
        assert!(outcome.error.unwrap().contains("Failed to launch"));
    }

    #[tokio::test]
    async fn test_missing_binary_run_with_output_errors() {
        let dir = TempDir::new().unwrap();
        let executor = CommandExecutor::new("dupliwatch-no-such-binary");

        assert!(executor.run_with_output(&args(&["list"]), dir.path()).await.is_err());
    }

    #[test]
    fn test_combined_log_format() {
        let outcome = CommandOutcome {
            exit_code: Some(0),
            stdout: "uploaded 3 files".to_string(),
            stderr: "".to_string(),
            error: None,
        };
        assert_eq!(outcome.combined_log(), "Stderr:\n\n\nStdout:\nuploaded 3 files");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_streams_to_log() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("backup-log.txt");
        std::fs::write(&log, "previous run\n").unwrap();
        let executor = CommandExecutor::new("sh");

        let outcome = executor
            .run(&args(&["-c", "echo out; echo err 1>&2"]), dir.path(), Some(&log))
            .await;

        assert!(outcome.is_success(), "{:?}", outcome);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");

        let logged = std::fs::read_to_string(&log).unwrap();
        assert!(!logged.contains("previous run"));
        assert!(logged.contains("out\n"));
        assert!(logged.contains("err\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_keeps_output() {
        let dir = TempDir::new().unwrap();
        let executor = CommandExecutor::new("sh");

        let outcome = executor
            .run(&args(&["-c", "echo partial; echo storage unreachable 1>&2; exit 3"]), dir.path(), None)
            .await;

        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.error.as_deref(), Some("Exit code: 3"));
        assert_eq!(outcome.stdout, "partial\n");
        assert_eq!(outcome.stderr, "storage unreachable\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "").unwrap();
        let executor = CommandExecutor::new("sh");

        let stdout = executor.run_with_output(&args(&["-c", "ls"]), dir.path()).await.unwrap();
        assert!(stdout.contains("marker.txt"));
    }
}
