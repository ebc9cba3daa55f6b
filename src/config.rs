use crate::daemon::output::OutputConfig;
use crate::daemon::SupervisorConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Launcher settings, read from `launcher.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Folder scanned for service executables
    pub services_dir: PathBuf,
    /// Optional second folder, scanned after `services_dir`
    pub bindings_dir: Option<PathBuf>,
    /// Folder for per-service `<name>.log` files
    pub logs_dir: PathBuf,
    pub log_services: bool,
    pub attach_stderr: bool,
    pub attach_stdout: bool,
    /// Services started, in order, when the daemon boots
    pub autostart: Vec<String>,
    /// SIGTERM to SIGKILL grace in milliseconds
    pub stop_grace_ms: u64,
    pub stderr_tail_lines: usize,
    /// Re-run discovery when a services folder changes
    pub watch: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            services_dir: crate::clienv::services_dir(),
            bindings_dir: None,
            logs_dir: crate::clienv::logs_dir(),
            log_services: true,
            attach_stderr: true,
            attach_stdout: false,
            autostart: Vec::new(),
            stop_grace_ms: 100,
            stderr_tail_lines: crate::daemon::log_buffer::DEFAULT_TAIL_LINES,
            watch: false,
        }
    }
}

impl LauncherConfig {
    /// Load from `path`, or from `$LAUNCHER_CONFIG` / the default location.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(crate::clienv::config_path);
        tracing::trace!(path = %path.display(), "Loading launcher config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        tracing::trace!(
            services_dir = %config.services_dir.display(),
            autostart = ?config.autostart,
            watch = config.watch,
            "Launcher config loaded"
        );
        Ok(config)
    }

    /// Discovery folders in scan order.
    pub fn folders(&self) -> Vec<PathBuf> {
        std::iter::once(self.services_dir.clone())
            .chain(self.bindings_dir.clone())
            .collect()
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            folders: self.folders(),
            output: OutputConfig {
                logs_dir: self.log_services.then(|| self.logs_dir.clone()),
                attach_stdout: self.attach_stdout,
                attach_stderr: self.attach_stderr,
            },
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            stderr_tail_lines: self.stderr_tail_lines,
            autostart: self.autostart.clone(),
        }
    }
}
