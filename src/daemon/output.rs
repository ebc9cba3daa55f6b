//! Child output plumbing: per-service log files, optional echo on the
//! launcher's own streams, and the stderr tail ring.

use super::log_buffer::LineRing;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type SharedLog = Arc<Mutex<tokio::fs::File>>;

/// Consecutive read errors after which a tee task gives up.
const MAX_READ_FAILURES: u32 = 16;

/// Where child output goes.
#[derive(Debug, Clone, Default)]
pub struct OutputConfig {
    /// Folder for `<name>.log`; `None` disables log files
    pub logs_dir: Option<PathBuf>,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Echo {
    None,
    Stdout,
    Stderr,
}

/// Output sinks prepared for one spawn.
pub struct ServiceOutput {
    name: String,
    log: Option<SharedLog>,
    pipe_stdout: bool,
    echo_stdout: bool,
    echo_stderr: bool,
}

impl OutputConfig {
    /// Open the service's log file and decide which streams to pipe.
    ///
    /// The file is not truncated until [`ServiceOutput::begin`], so a
    /// rejected start leaves the log of a running instance intact. A log
    /// file that cannot be created is reported and skipped; the service
    /// still starts.
    pub async fn prepare(&self, name: &str) -> ServiceOutput {
        let log = match &self.logs_dir {
            Some(dir) => open_log(dir, name).await,
            None => None,
        };
        ServiceOutput {
            name: name.to_string(),
            pipe_stdout: log.is_some() || self.attach_stdout,
            log,
            echo_stdout: self.attach_stdout,
            echo_stderr: self.attach_stderr,
        }
    }
}

async fn open_log(dir: &std::path::Path, name: &str) -> Option<SharedLog> {
    let path = dir.join(format!("{}.log", name));
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        warn!("Creating log folder {} failed: {}", dir.display(), e);
        return None;
    }
    let opened = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .await;
    match opened {
        Ok(file) => {
            debug!("Logging '{}' to {}", name, path.display());
            Some(Arc::new(Mutex::new(file)))
        }
        Err(e) => {
            warn!("Creating logfile {} failed: {}", path.display(), e);
            None
        }
    }
}

impl ServiceOutput {
    /// Truncate the log file right before the spawn.
    pub async fn begin(&self) {
        let Some(log) = &self.log else {
            return;
        };
        let mut file = log.lock().await;
        let reset = async {
            file.set_len(0).await?;
            file.seek(std::io::SeekFrom::Start(0)).await.map(|_| ())
        }
        .await;
        if let Err(e) = reset {
            warn!("Truncating log for '{}' failed: {}", self.name, e);
        }
    }

    /// Configure the child's stdio before spawning.
    pub fn configure(&self, cmd: &mut Command) {
        cmd.stdin(Stdio::null());
        cmd.stdout(if self.pipe_stdout {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stderr(Stdio::piped());
    }

    /// Start the tee tasks for a spawned child. Stderr lines also land in `ring`.
    pub fn attach(self, child: &mut Child, ring: Arc<LineRing>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let echo = if self.echo_stdout {
                Echo::Stdout
            } else {
                Echo::None
            };
            tasks.push(tokio::spawn(tee_lines(
                stdout,
                self.name.clone(),
                self.log.clone(),
                echo,
                None,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            let echo = if self.echo_stderr {
                Echo::Stderr
            } else {
                Echo::None
            };
            tasks.push(tokio::spawn(tee_lines(
                stderr,
                self.name,
                self.log,
                echo,
                Some(ring),
            )));
        }
        tasks
    }
}

async fn tee_lines<R>(
    reader: R,
    name: String,
    log: Option<SharedLog>,
    echo: Echo,
    ring: Option<Arc<LineRing>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut failures = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => failures = 0,
            Err(e) => {
                failures += 1;
                warn!("Reading output of '{}' failed: {}", name, e);
                // the pipe must stay open while the child lives
                if failures >= MAX_READ_FAILURES {
                    break;
                }
                if buf.is_empty() {
                    continue;
                }
            }
        }
        let line = String::from_utf8_lossy(trim_newline(&buf)).into_owned();
        emit(&name, &log, echo, ring.as_deref(), line).await;
    }
}

fn trim_newline(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

async fn emit(name: &str, log: &Option<SharedLog>, echo: Echo, ring: Option<&LineRing>, line: String) {
    if let Some(log) = log {
        let mut file = log.lock().await;
        let written = async {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!("Writing log for '{}' failed: {}", name, e);
        }
    }
    match echo {
        Echo::Stdout => {
            let _ = writeln!(std::io::stdout().lock(), "[{}] {}", name, line);
        }
        Echo::Stderr => {
            let _ = writeln!(std::io::stderr().lock(), "[{}] {}", name, line);
        }
        Echo::None => {}
    }
    if let Some(ring) = ring {
        ring.push(line);
    }
}
