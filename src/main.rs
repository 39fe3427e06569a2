use anyhow::{Context, Result};
use dupliwatch::{
    config::ServiceConfig,
    observability::{init_logging, Rotation},
    service::ServiceDaemon,
};
use std::path::{Path, PathBuf};
use tracing::info;

const DEFAULT_CONFIG_PATH: &str = "dupliwatch_config.json";

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if let Some("--help" | "-h") = args.get(1).map(String::as_str) {
        print_help();
        return Ok(());
    }

    run_console_mode()
}

#[tokio::main]
async fn run_console_mode() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(arg) if !arg.starts_with("--") => PathBuf::from(arg),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    };

    let config = load_config(&config_path).await
        .context("Failed to load configuration")?;

    init_logging(
        &config.log_level,
        config.log_directory.as_deref(),
        Rotation::from(&config.log_rotation),
    )?;

    info!("Dupliwatch v{} - Console Mode", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", config_path.display());
    info!("Data directory: {}", config.data_dir.display());

    if let Some(log_dir) = &config.log_directory {
        info!("File logging enabled: {}", log_dir.display());
    } else {
        info!("Console logging only (no log file configured)");
    }

    info!("Press Ctrl+C to stop");

    let daemon = ServiceDaemon::new(config).await?;
    daemon.run().await?;

    Ok(())
}

async fn load_config(path: &Path) -> Result<ServiceConfig> {
    if !path.exists() {
        anyhow::bail!(
            "Configuration file not found: {}\n\nCreate a config file first. Example:\n{}",
            path.display(),
            get_example_config()
        );
    }

    let content = tokio::fs::read_to_string(path).await
        .context("Failed to read config file")?;

    let config: ServiceConfig = serde_json::from_str(&content)
        .context("Failed to parse config file")?;

    Ok(config)
}

fn print_help() {
    println!("Dupliwatch v{} - Scheduled backup runner", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  dupliwatch [CONFIG_FILE]    Run in console mode (default: {})", DEFAULT_CONFIG_PATH);
    println!("  dupliwatch --help           Show this help");
    println!();
    println!("Directories are registered in <data_dir>/directories.json. Each one must");
    println!("already be initialized for the backup tool (contain a .duplicacy folder);");
    println!("its schedule lives in .duplicacy/dupliwatch.json.");
}

fn get_example_config() -> &'static str {
    r#"{
  "data_dir": ".dupliwatch",
  "log_level": "info",
  "log_directory": "./logs",
  "log_rotation": {
    "type": "daily"
  },
  "backup_tool": {
    "binary": "duplicacy",
    "backup_args": ["backup", "--stats"],
    "list_args": ["list"]
  },
  "shutdown_grace_seconds": 300
}"#
}
