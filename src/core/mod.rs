pub mod backup;
pub mod command;
pub mod snapshots;
pub mod validation;

pub use backup::{read_backup_log, BackupTool, CliBackupTool};
pub use command::{CommandExecutor, CommandOutcome};
pub use snapshots::{parse_snapshot_list, SnapshotEntry};
pub use validation::{validate_directory_entry, FieldError, FormError};
