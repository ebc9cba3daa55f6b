//! IPC Protocol types using rkyv for zero-copy serialization
//!
//! All request/response types use `#[derive(Archive, Serialize, Deserialize)]`
//! for zero-copy deserialization. The bytes ARE the struct - no parsing needed.

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// IPC request from client to daemon
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Request {
    // Daemon lifecycle
    /// Check if daemon is alive
    Ping,
    /// Stop all services and shut the daemon down
    Shutdown,

    // Service management
    /// List services, optionally only the running ones
    ListServices { only_running: bool },
    /// Start a service
    StartService { name: String },
    /// Start every service that is not running
    StartAll,
    /// Stop a service
    StopService { name: String },
    /// Stop all running services
    StopAll,
}

/// IPC response from daemon to client
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Response {
    /// Response to Ping
    Pong { uptime_secs: u64, version: String },
    /// Generic success
    Ok,
    /// Error occurred
    Error { error: WireError },
    /// List of services
    Services { list: Vec<ServiceInfo> },
    /// A single service after start/stop
    Service { info: ServiceInfo },
}

/// Classification of a failed request
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum ErrorKind {
    NotFound,
    AlreadyRunning,
    /// Handle present but its exit has not been reaped yet; retriable
    Busy,
    Spawn,
    Io,
    Cancelled,
    Internal,
}

/// A failed request in a form the client can rebuild the error from.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub struct WireError {
    pub kind: ErrorKind,
    /// Service the error is about, empty if none
    pub service: String,
    /// PID of the live instance for `AlreadyRunning`, else 0
    pub pid: i32,
    /// Spawn reason for `Spawn`, the rendered error otherwise
    pub message: String,
}

/// Declared and observed state of one service.
///
/// Timestamps are RFC 3339 UTC strings, empty when unset.
#[derive(
    Archive, Deserialize, Serialize, serde::Serialize, Debug, Clone, Default, PartialEq, Eq,
)]
#[rkyv(derive(Debug))]
pub struct ServiceInfo {
    /// Executable base name, unique
    pub name: String,
    /// Absolute path of the executable
    pub path: String,
    /// File size in bytes at last discovery
    pub size: i64,
    /// File mtime at last discovery
    pub modified_time: String,
    /// A live child exists and has not exited
    pub running: bool,
    /// Last known PID, kept after exit; 0 if never started
    pub pid: i32,
    /// Successful spawns since the daemon started
    pub start_count: i32,
    pub start_time: String,
    pub stop_time: String,
    /// Seconds since start while running, else 0
    pub uptime: i32,
    /// CPU share in percent (0-100) while running
    pub cpu: i32,
    /// Resident memory in bytes while running
    pub rss: i64,
    /// Last error line, "stopped by user" or exit description
    pub status: String,
}

impl ServiceInfo {
    /// Create a record for a freshly discovered executable
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Human-readable state name
    pub fn state_str(&self) -> &'static str {
        if self.running {
            "running"
        } else {
            "stopped"
        }
    }
}

/// Message frame for wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    /// Encode a request to bytes with length prefix
    pub fn encode_request(request: &Request) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        Ok(Self::with_prefix(&bytes))
    }

    /// Encode a response to bytes with length prefix
    pub fn encode_response(response: &Response) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        Ok(Self::with_prefix(&bytes))
    }

    fn with_prefix(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    /// Read one frame body from `reader` into a buffer aligned for rkyv access.
    pub async fn read_body<R>(reader: &mut R) -> std::io::Result<AlignedVec>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        use tokio::io::AsyncReadExt;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = Self::read_length(&len_buf);
        if len > MAX_FRAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit", len),
            ));
        }

        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;

        let mut aligned = AlignedVec::<16>::with_capacity(len);
        aligned.extend_from_slice(&body);
        Ok(aligned)
    }
}
