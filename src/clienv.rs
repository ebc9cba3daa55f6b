use std::path::PathBuf;

#[derive(Debug, Clone, Copy)]
pub enum EnvVar {
    LauncherSocket,
    LauncherConfig,
    LauncherLog,
    LauncherTcpPort,
    RustLog,
}

impl EnvVar {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LauncherSocket => "LAUNCHER_SOCKET",
            Self::LauncherConfig => "LAUNCHER_CONFIG",
            Self::LauncherLog => "LAUNCHER_LOG",
            Self::LauncherTcpPort => "LAUNCHER_TCP_PORT",
            Self::RustLog => "RUST_LOG",
        }
    }
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const FALLBACK_DATA_DIR: &str = "~/.local/share";
const LAUNCHER_SUBDIR: &str = "launcher";
const DEFAULT_TCP_PORT: u16 = 14741;
const DEFAULT_LOG_FILTER: &str = "info";

/// Non-empty value of an environment variable.
fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str())
        .ok()
        .filter(|v| !v.trim().is_empty())
}

/// Launcher config directory (~/.config/launcher)
pub fn config_dir() -> PathBuf {
    let dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
        .join(LAUNCHER_SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Launcher data directory (~/.local/share/launcher)
pub fn data_dir() -> PathBuf {
    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
        .join(LAUNCHER_SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Config file path ($LAUNCHER_CONFIG or ~/.config/launcher/launcher.toml)
pub fn config_path() -> PathBuf {
    let path = env_opt(EnvVar::LauncherConfig)
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("launcher.toml"));
    tracing::trace!(path = %path.display(), "Config path");
    path
}

/// Default discovery folder (~/.local/share/launcher/services)
pub fn services_dir() -> PathBuf {
    data_dir().join("services")
}

/// Default per-service log folder (~/.local/share/launcher/logs)
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Daemon socket path ($LAUNCHER_SOCKET or ~/.local/share/launcher/launcher.sock)
pub fn daemon_socket_path() -> PathBuf {
    let path = env_opt(EnvVar::LauncherSocket)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("launcher.sock"));
    tracing::trace!(path = %path.display(), "Daemon socket path");
    path
}

/// Daemon TCP port for non-Unix platforms ($LAUNCHER_TCP_PORT or 14741)
pub fn daemon_tcp_port() -> u16 {
    env_opt(EnvVar::LauncherTcpPort)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_TCP_PORT)
}

/// Log filter directive ($LAUNCHER_LOG, then $RUST_LOG, then "info")
pub fn log_filter() -> String {
    env_opt(EnvVar::LauncherLog)
        .or_else(|| env_opt(EnvVar::RustLog))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}
