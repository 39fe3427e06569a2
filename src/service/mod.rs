pub mod daemon;
pub mod signals;
pub mod recovery;

pub use daemon::ServiceDaemon;
pub use recovery::RecoveryManager;
pub use signals::setup_shutdown_handler;
