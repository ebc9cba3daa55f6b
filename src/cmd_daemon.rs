use anyhow::{Context, Result};
use launcher::daemon::server::DaemonConfig;
use launcher::daemon::watch::spawn_watcher;
use launcher::daemon::{DaemonClient, DaemonServer, Supervisor};
use launcher::LauncherConfig;
use std::path::PathBuf;
use std::sync::Arc;

/// Run discovery, autostart and the socket server until shutdown.
pub(crate) async fn cmd_daemon(socket: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<()> {
    let config = LauncherConfig::load(config_path.as_deref())?;
    let daemon_config = match socket {
        Some(socket_path) => DaemonConfig { socket_path },
        None => DaemonConfig::default(),
    };

    let client = DaemonClient::with_socket(&daemon_config.socket_path);
    if client.is_running().await {
        let (uptime, version) = client.ping().await?;
        anyhow::bail!(
            "Daemon already running (v{}, uptime: {})",
            version,
            format_duration(uptime)
        );
    }

    println!("Running launcher daemon in foreground (Ctrl+C to stop)");
    println!("  Socket:   {}", daemon_config.socket_path.display());
    for folder in config.folders() {
        println!("  Services: {}", folder.display());
    }
    if config.log_services {
        println!("  Logs:     {}", config.logs_dir.display());
    }
    println!();

    let supervisor = Arc::new(
        Supervisor::new(config.supervisor_config())
            .await
            .context("Failed to discover services")?,
    );

    let server = DaemonServer::new(daemon_config, supervisor.clone());
    let shutdown = server.shutdown_token();

    let watcher = if config.watch {
        Some(spawn_watcher(
            &supervisor.config().folders,
            Arc::clone(&supervisor),
            shutdown.clone(),
        )?)
    } else {
        None
    };

    supervisor.start_autostart().await;

    let result = server.run().await;

    shutdown.cancel();
    if let Some(watcher) = watcher {
        let _ = watcher.await;
    }
    supervisor.shutdown().await;
    result
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}
