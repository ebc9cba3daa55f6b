//! Live child handles and the per-child exit reaper.
//!
//! The reaper task owns the OS [`Child`]. Everything else talks to it
//! through the [`ChildHandle`] kept in the supervisor's handle table: stop
//! signals go in over a channel, the exit report comes out over a watch.
//! Because only the reaper signals the child, and `Child::id` is gone once
//! the exit has been reaped, a signal can never hit a recycled PID.

use super::discovery::format_timestamp;
use super::log_buffer::LineRing;
use super::services::Registry;
use chrono::Utc;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long to wait for the output tee tasks after the child exited.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

pub const STOPPED_BY_USER: &str = "stopped by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM (graceful)
    Terminate,
    /// SIGKILL
    Kill,
}

/// What the reaper observed when the child terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub wait_error: Option<String>,
    pub stderr_tail: Vec<String>,
}

impl ExitReport {
    fn new(status: &std::io::Result<ExitStatus>, stderr_tail: Vec<String>) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                signal: exit_signal(status),
                wait_error: None,
                stderr_tail,
            },
            Err(e) => Self {
                code: None,
                signal: None,
                wait_error: Some(e.to_string()),
                stderr_tail,
            },
        }
    }

    /// Status text for a spontaneous exit: the last stderr line, else the
    /// exit description.
    pub fn describe(&self) -> String {
        if let Some(line) = self.stderr_tail.iter().rev().find(|l| !l.trim().is_empty()) {
            return line.clone();
        }
        match (self.code, self.signal, &self.wait_error) {
            (Some(code), _, _) => format!("exited code {}", code),
            (None, Some(signal), _) => format!("terminated by signal {}", signal),
            (None, None, Some(error)) => format!("wait failed: {}", error),
            (None, None, None) => "exited".to_string(),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// State shared between a handle and its reaper.
struct ChildShared {
    exited: AtomicBool,
    last_error: StdMutex<Option<String>>,
    stderr_tail: Arc<LineRing>,
}

/// Supervisor-side reference to a live child.
pub struct ChildHandle {
    pid: u32,
    started: Instant,
    stop_requested: bool,
    shared: Arc<ChildShared>,
    signals: mpsc::UnboundedSender<StopSignal>,
    exit: watch::Receiver<Option<ExitReport>>,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// The OS wait returned; the reaper may not have done its bookkeeping yet.
    pub fn has_exited(&self) -> bool {
        self.shared.exited.load(Ordering::Acquire)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn stderr_tail(&self) -> &LineRing {
        &self.shared.stderr_tail
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Resolves to `Some(report)` once the reaper has finished.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitReport>> {
        self.exit.clone()
    }

    /// Mark the child as stopping and ask the reaper to deliver `signal`.
    ///
    /// A child that already exited on its own keeps its crash report.
    pub fn request_stop(&mut self, signal: StopSignal) {
        if !self.has_exited() {
            self.stop_requested = true;
        }
        self.signal(signal);
    }

    pub fn signal(&self, signal: StopSignal) {
        // a closed channel means the child is already gone
        let _ = self.signals.send(signal);
    }
}

/// Background task owning one child until it exits.
pub struct Reaper {
    name: String,
    pid: u32,
    child: Child,
    output: Vec<JoinHandle<()>>,
    shared: Arc<ChildShared>,
    signals: mpsc::UnboundedReceiver<StopSignal>,
    exit: watch::Sender<Option<ExitReport>>,
}

/// Build the handle/reaper pair for a freshly spawned child.
pub fn track(
    name: &str,
    child: Child,
    output: Vec<JoinHandle<()>>,
    stderr_tail: Arc<LineRing>,
) -> (ChildHandle, Reaper) {
    let pid = child.id().unwrap_or(0);
    let shared = Arc::new(ChildShared {
        exited: AtomicBool::new(false),
        last_error: StdMutex::new(None),
        stderr_tail,
    });
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = watch::channel(None);

    let handle = ChildHandle {
        pid,
        started: Instant::now(),
        stop_requested: false,
        shared: Arc::clone(&shared),
        signals: signal_tx,
        exit: exit_rx,
    };
    let reaper = Reaper {
        name: name.to_string(),
        pid,
        child,
        output,
        shared,
        signals: signal_rx,
        exit: exit_tx,
    };
    (handle, reaper)
}

impl Reaper {
    /// Wait for the child to terminate, then update its record and drop its handle.
    ///
    /// Cancelling `shutdown` kills the child instead of abandoning it.
    pub async fn run(mut self, registry: Arc<Mutex<Registry>>, shutdown: CancellationToken) {
        let status = self.wait_for_exit(&shutdown).await;
        self.shared.exited.store(true, Ordering::Release);

        // let the tee tasks flush the final stderr lines into the ring
        for task in self.output.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
                abort.abort();
            }
        }

        let report = ExitReport::new(&status, self.shared.stderr_tail.snapshot());
        let status_text = {
            let mut registry = registry.lock().await;
            let Registry { records, handles } = &mut *registry;

            let stop_requested = match handles.get(&self.name) {
                Some(handle) if handle.pid() == self.pid => {
                    let stop_requested = handle.stop_requested();
                    handles.remove(&self.name);
                    stop_requested
                }
                _ => false,
            };

            let status_text = if stop_requested {
                STOPPED_BY_USER.to_string()
            } else {
                report.describe()
            };
            if let Some(record) = records.get_mut(&self.name) {
                record.running = false;
                record.stop_time = format_timestamp(Utc::now());
                record.uptime = 0;
                record.cpu = 0;
                record.rss = 0;
                record.status = status_text.clone();
            }
            status_text
        };

        info!(
            "Service '{}' (PID {}) has stopped: {}",
            self.name, self.pid, status_text
        );
        let _ = self.exit.send(Some(report));
    }

    async fn wait_for_exit(&mut self, shutdown: &CancellationToken) -> std::io::Result<ExitStatus> {
        let mut killing = false;
        loop {
            tokio::select! {
                status = self.child.wait() => return status,
                Some(signal) = self.signals.recv() => self.deliver(signal),
                _ = shutdown.cancelled(), if !killing => {
                    killing = true;
                    warn!("Killing service '{}' (PID {}) on shutdown", self.name, self.pid);
                    self.deliver(StopSignal::Kill);
                }
            }
        }
    }

    fn deliver(&mut self, signal: StopSignal) {
        let result = match signal {
            StopSignal::Kill => self.child.start_kill(),
            StopSignal::Terminate => terminate(&mut self.child),
        };
        if let Err(e) = result {
            warn!(
                "Sending {:?} to service '{}' (PID {}) failed: {}",
                signal, self.name, self.pid, e
            );
            *self
                .shared
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(format!("{:?} failed: {}", signal, e));
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "PID out of range"))?;
    // SAFETY: plain kill(2) on a PID we own and have not reaped yet
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}
