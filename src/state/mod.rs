pub mod models;
pub mod notifier;
pub mod store;

pub use models::{
    AppSettings, AppSettingsUpdate, BackupState, CronSchedule, DirectoryConfig, DirectoryConfigUpdate,
    DirectoryEntry, DirectoryList, DirectoryStats,
};
pub use notifier::{EventBus, Observable, StoreEvent, Subscription};
pub use store::ConfigStore;
