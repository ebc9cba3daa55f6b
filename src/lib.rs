pub mod clienv;
pub mod completions;
pub mod config;
pub mod daemon;
pub mod error;

pub use config::LauncherConfig;
pub use daemon::{DaemonClient, Launcher, ServiceInfo, Supervisor};
pub use error::{LauncherError, Result};
