//! Launcher daemon - local process supervisor
//!
//! Discovers service executables in the configured folders and starts,
//! stops and inspects them on request:
//! - Service registry (one record per discovered executable)
//! - Child handle table and per-child exit reapers
//! - IPC server and client speaking the rkyv protocol
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │             launcher daemon              │
//! ├──────────────────────────────────────────┤
//! │  Supervisor   │  IPC Server  │  Watcher  │
//! │ (records +    │  (socket)    │ (rescan)  │
//! │  handles)     │              │           │
//! ├──────────────────────────────────────────┤
//! │  reaper │ reaper │ reaper │ ...          │
//! └──────────────────────────────────────────┘
//! ```

pub mod client;
pub mod discovery;
pub mod log_buffer;
pub mod output;
pub mod protocol;
pub mod reaper;
pub mod server;
pub mod services;
pub mod status;
pub mod watch;

pub use client::DaemonClient;
pub use protocol::{ErrorKind, Request, Response, ServiceInfo};
pub use server::{DaemonConfig, DaemonServer};
pub use services::{Supervisor, SupervisorConfig};

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// The operations a launcher exposes, in-process or over the socket.
///
/// Every call honours `cancel` between its lock-release points.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Services sorted by name; only running ones if `only_running`.
    async fn list(&self, only_running: bool, cancel: &CancellationToken) -> Result<Vec<ServiceInfo>>;

    async fn start_service(&self, name: &str, cancel: &CancellationToken) -> Result<ServiceInfo>;

    async fn start_all(&self, cancel: &CancellationToken) -> Result<()>;

    /// Stopping a service that is not running succeeds and returns its record.
    async fn stop_service(&self, name: &str, cancel: &CancellationToken) -> Result<ServiceInfo>;

    async fn stop_all(&self, cancel: &CancellationToken) -> Result<()>;
}
