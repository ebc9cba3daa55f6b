use super::protocol::{MessageFrame, Request, Response, ServiceInfo};
use super::Launcher;
use crate::clienv;
use crate::error::{LauncherError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Talks to a running daemon over its local socket.
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new() -> Self {
        Self::with_socket(clienv::daemon_socket_path())
    }

    pub fn with_socket(socket_path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// True if a daemon answers `Ping`.
    pub async fn is_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Daemon uptime in seconds and version.
    pub async fn ping(&self) -> Result<(u64, String)> {
        match self.request(&Request::Ping).await? {
            Response::Pong {
                uptime_secs,
                version,
            } => Ok((uptime_secs, version)),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the daemon to stop all services and exit.
    pub async fn shutdown(&self) -> Result<()> {
        match self.request(&Request::Shutdown).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn request(&self, request: &Request) -> Result<Response> {
        trace!("Sending {:?}", request);
        let frame = MessageFrame::encode_request(request)
            .map_err(|e| LauncherError::Protocol(format!("encoding request failed: {}", e)))?;

        let mut stream = self.connect().await?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| LauncherError::io(&self.socket_path, e))?;
        stream
            .flush()
            .await
            .map_err(|e| LauncherError::io(&self.socket_path, e))?;

        let body = MessageFrame::read_body(&mut stream)
            .await
            .map_err(|e| LauncherError::io(&self.socket_path, e))?;
        let response = rkyv::from_bytes::<Response, rkyv::rancor::Error>(&body)
            .map_err(|e| LauncherError::Protocol(format!("decoding response failed: {}", e)))?;

        match response {
            Response::Error { error } => Err(LauncherError::from_wire(error)),
            response => Ok(response),
        }
    }

    /// Run `request` unless `cancel` fires first.
    async fn call(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        tokio::select! {
            _ = cancel.cancelled() => Err(LauncherError::Cancelled),
            response = self.request(&request) => response,
        }
    }

    #[cfg(unix)]
    async fn connect(&self) -> Result<tokio::net::UnixStream> {
        tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| LauncherError::io(&self.socket_path, e))
    }

    #[cfg(not(unix))]
    async fn connect(&self) -> Result<tokio::net::TcpStream> {
        let addr = format!("127.0.0.1:{}", clienv::daemon_tcp_port());
        tokio::net::TcpStream::connect(&addr)
            .await
            .map_err(|e| LauncherError::io(&self.socket_path, e))
    }
}

impl Default for DaemonClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Launcher for DaemonClient {
    async fn list(&self, only_running: bool, cancel: &CancellationToken) -> Result<Vec<ServiceInfo>> {
        match self.call(Request::ListServices { only_running }, cancel).await? {
            Response::Services { list } => Ok(list),
            other => Err(unexpected(other)),
        }
    }

    async fn start_service(&self, name: &str, cancel: &CancellationToken) -> Result<ServiceInfo> {
        let request = Request::StartService {
            name: name.to_string(),
        };
        match self.call(request, cancel).await? {
            Response::Service { info } => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn start_all(&self, cancel: &CancellationToken) -> Result<()> {
        match self.call(Request::StartAll, cancel).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn stop_service(&self, name: &str, cancel: &CancellationToken) -> Result<ServiceInfo> {
        let request = Request::StopService {
            name: name.to_string(),
        };
        match self.call(request, cancel).await? {
            Response::Service { info } => Ok(info),
            other => Err(unexpected(other)),
        }
    }

    async fn stop_all(&self, cancel: &CancellationToken) -> Result<()> {
        match self.call(Request::StopAll, cancel).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> LauncherError {
    LauncherError::Protocol(format!("unexpected response: {:?}", response))
}
