pub mod models;

pub use models::{BackupToolConfig, LogRotation, ServiceConfig};
