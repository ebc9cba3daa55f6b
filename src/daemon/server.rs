use super::client::DaemonClient;
use super::protocol::{ArchivedRequest, ErrorKind, MessageFrame, Response};
use super::Launcher;
use crate::clienv;
use crate::error::LauncherError;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, trace};

pub struct DaemonConfig {
    pub socket_path: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: clienv::daemon_socket_path(),
        }
    }
}

/// RPC adapter: translates request frames into [`Launcher`] calls.
pub struct DaemonServer {
    config: DaemonConfig,
    launcher: Arc<dyn Launcher>,
    started_at: Instant,
    version: String,
    shutdown: CancellationToken,
}

impl DaemonServer {
    pub fn new(config: DaemonConfig, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            config,
            launcher,
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the accept loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until a `Shutdown` request, SIGTERM/SIGINT, or the shutdown
    /// token fires; then stop all services and remove the socket.
    pub async fn run(self) -> Result<()> {
        info!("Launcher daemon starting...");

        let client = DaemonClient::with_socket(&self.config.socket_path);
        if client.is_running().await {
            anyhow::bail!(
                "Daemon already listening on {}",
                self.config.socket_path.display()
            );
        }

        if self.config.socket_path.exists() {
            std::fs::remove_file(&self.config.socket_path)?;
        }

        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        #[cfg(unix)]
        let listener = tokio::net::UnixListener::bind(&self.config.socket_path)?;

        #[cfg(not(unix))]
        let listener = {
            let port = clienv::daemon_tcp_port();
            tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?
        };

        info!(
            "IPC server listening on: {}",
            self.config.socket_path.display()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.config.socket_path, perms)?;
        }

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let handle = self.shutdown.clone();

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                        handle.cancel();
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT");
                        handle.cancel();
                    }
                    _ = handle.cancelled() => {}
                }
            });
        }

        #[cfg(not(unix))]
        {
            let handle = self.shutdown.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C");
                        handle.cancel();
                    }
                    _ = handle.cancelled() => {}
                }
            });
        }

        let server = Arc::new(self);
        info!("Launcher daemon ready");

        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("Connection handler error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = server.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        info!("Stopping all services...");
        if let Err(e) = server.launcher.stop_all(&CancellationToken::new()).await {
            error!("Stopping services failed: {}", e);
        }

        if server.config.socket_path.exists() {
            std::fs::remove_file(&server.config.socket_path)?;
        }

        info!("Launcher daemon stopped");
        Ok(())
    }

    async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("New connection accepted");

        let request_buf = MessageFrame::read_body(&mut stream).await?;
        trace!("Request length: {} bytes", request_buf.len());

        let archived = rkyv::access::<ArchivedRequest, rkyv::rancor::Error>(&request_buf)
            .map_err(|e| anyhow::anyhow!("Failed to deserialize request: {}", e))?;

        let cancel = self.shutdown.child_token();
        let response = self.handle_request(archived, &cancel).await;

        let response_bytes = MessageFrame::encode_response(&response)
            .map_err(|e| anyhow::anyhow!("Failed to encode response: {}", e))?;
        stream.write_all(&response_bytes).await?;
        stream.flush().await?;

        trace!("Response sent");
        Ok(())
    }

    async fn handle_request(&self, request: &ArchivedRequest, cancel: &CancellationToken) -> Response {
        match request {
            ArchivedRequest::Ping => {
                debug!("Handling: Ping");
                Response::Pong {
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    version: self.version.clone(),
                }
            }

            ArchivedRequest::Shutdown => {
                info!("Handling: Shutdown");
                self.shutdown.cancel();
                Response::Ok
            }

            ArchivedRequest::ListServices { only_running } => {
                debug!("Handling: ListServices(only_running: {})", only_running);
                reply(self.launcher.list(*only_running, cancel).await, |list| {
                    Response::Services { list }
                })
            }

            ArchivedRequest::StartService { name } => {
                debug!("Handling: StartService({})", name);
                reply(
                    self.launcher.start_service(name.as_str(), cancel).await,
                    |info| Response::Service { info },
                )
            }

            ArchivedRequest::StartAll => {
                debug!("Handling: StartAll");
                reply(self.launcher.start_all(cancel).await, |()| Response::Ok)
            }

            ArchivedRequest::StopService { name } => {
                debug!("Handling: StopService({})", name);
                reply(
                    self.launcher.stop_service(name.as_str(), cancel).await,
                    |info| Response::Service { info },
                )
            }

            ArchivedRequest::StopAll => {
                debug!("Handling: StopAll");
                reply(self.launcher.stop_all(cancel).await, |()| Response::Ok)
            }
        }
    }
}

fn reply<T>(result: crate::error::Result<T>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(e) => error_response(&e),
    }
}

fn error_response(error: &LauncherError) -> Response {
    if error.kind() == ErrorKind::Internal {
        error!("Request failed: {}", error);
    }
    Response::Error {
        error: error.to_wire(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_config_default() {
        let config = DaemonConfig::default();
        assert!(config
            .socket_path
            .to_string_lossy()
            .contains("launcher.sock"));
    }

    #[test]
    fn test_error_response_keeps_kind() {
        let response = error_response(&LauncherError::AlreadyRunning {
            name: "yes".into(),
            pid: 7,
        });
        match response {
            Response::Error { error } => {
                assert_eq!(error.kind, ErrorKind::AlreadyRunning);
                assert_eq!(error.service, "yes");
                assert_eq!(error.pid, 7);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }
}
