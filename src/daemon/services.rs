use super::discovery::{self, format_timestamp};
use super::log_buffer::{LineRing, DEFAULT_TAIL_LINES};
use super::output::{OutputConfig, ServiceOutput};
use super::protocol::ServiceInfo;
use super::reaper::{self, ChildHandle, ExitReport, StopSignal};
use super::status::{update_status, ProcessSampler};
use super::Launcher;
use crate::error::{LauncherError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Lower and upper bound of the SIGTERM grace period.
pub const MIN_STOP_GRACE: Duration = Duration::from_millis(10);
pub const MAX_STOP_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for the reaper after escalating to SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(1);

/// Bounded wait for the first exit event right after a spawn.
const STARTUP_SETTLE: Duration = Duration::from_millis(10);

type ExitWatch = watch::Receiver<Option<ExitReport>>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Discovery folders, scanned in order
    pub folders: Vec<PathBuf>,
    pub output: OutputConfig,
    pub stop_grace: Duration,
    pub stderr_tail_lines: usize,
    /// Names started in order by [`Supervisor::start_autostart`]
    pub autostart: Vec<String>,
}

impl SupervisorConfig {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folders: vec![folder.into()],
            output: OutputConfig::default(),
            stop_grace: Duration::from_millis(100),
            stderr_tail_lines: DEFAULT_TAIL_LINES,
            autostart: Vec::new(),
        }
    }
}

/// Service records and live child handles, guarded together.
#[derive(Default)]
pub struct Registry {
    pub(crate) records: BTreeMap<String, ServiceInfo>,
    pub(crate) handles: HashMap<String, ChildHandle>,
}

/// Owner of the service registry and the handle table.
pub struct Supervisor {
    config: SupervisorConfig,
    registry: Arc<Mutex<Registry>>,
    sampler: StdMutex<ProcessSampler>,
    reapers: TaskTracker,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Create a supervisor and run discovery over the configured folders.
    pub async fn new(mut config: SupervisorConfig) -> Result<Self> {
        if config.folders.is_empty() {
            return Err(LauncherError::Config(
                "no service folders configured".to_string(),
            ));
        }
        config.stop_grace = config.stop_grace.clamp(MIN_STOP_GRACE, MAX_STOP_GRACE);
        let supervisor = Self {
            config,
            registry: Arc::new(Mutex::new(Registry::default())),
            sampler: StdMutex::new(ProcessSampler::new()),
            reapers: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        };
        supervisor.rescan().await?;
        Ok(supervisor)
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Re-run discovery. Known records only get path, size and mtime
    /// refreshed; records are never removed.
    pub async fn rescan(&self) -> Result<usize> {
        let mut found = Vec::new();
        for folder in &self.config.folders {
            found.extend(discovery::discover(folder).await?);
        }
        let mut registry = self.registry.lock().await;
        let added = discovery::upsert(&mut registry.records, found);
        if added > 0 {
            info!("Registered {} new services", added);
        }
        Ok(added)
    }

    /// Snapshot of all (or only running) services, sorted by name.
    pub async fn list(&self, only_running: bool) -> Vec<ServiceInfo> {
        let mut registry = self.registry.lock().await;
        let Registry { records, handles } = &mut *registry;
        let usage = self.sample(handles);

        records
            .values_mut()
            .filter_map(|record| {
                let handle = handles.get(&record.name);
                let sample = handle.and_then(|h| usage.get(&h.pid()).copied());
                update_status(record, handle, sample);
                (!only_running || record.running).then(|| record.clone())
            })
            .collect()
    }

    pub async fn start_one(&self, name: &str, cancel: &CancellationToken) -> Result<ServiceInfo> {
        check_cancel(cancel)?;

        {
            let registry = self.registry.lock().await;
            check_startable(&registry, name)?;
        }
        let output = self.config.output.prepare(name).await;
        check_cancel(cancel)?;

        let exit = {
            let mut registry = self.registry.lock().await;
            // another request may have started it while the log was opened
            check_startable(&registry, name)?;
            self.spawn_locked(&mut registry, name, output).await?
        };

        // first status event: catches children that die right away
        wait_exit(exit, STARTUP_SETTLE).await;
        self.snapshot(name).await
    }

    /// Start every service that has no live child, in name order.
    ///
    /// Individual spawn failures land in the record's `status`.
    pub async fn start_all(&self, cancel: &CancellationToken) -> Result<()> {
        info!("Starting all services");
        let names: Vec<String> = {
            let registry = self.registry.lock().await;
            registry.records.keys().cloned().collect()
        };

        for name in names {
            check_cancel(cancel)?;
            if self.registry.lock().await.handles.contains_key(&name) {
                continue;
            }
            let output = self.config.output.prepare(&name).await;

            let mut registry = self.registry.lock().await;
            if registry.handles.contains_key(&name) {
                continue;
            }
            if let Err(e) = self.spawn_locked(&mut registry, &name, output).await {
                debug!("start_all: {}", e);
            }
        }
        Ok(())
    }

    /// Start the configured autostart names in order; failures are logged.
    pub async fn start_autostart(&self) {
        let cancel = CancellationToken::new();
        for name in &self.config.autostart {
            info!("Auto-starting service: {}", name);
            if let Err(e) = self.start_one(name, &cancel).await {
                warn!("Failed to auto-start '{}': {}", name, e);
            }
        }
    }

    /// Stop one service. Stopping a service without a live child is a no-op.
    pub async fn stop_one(&self, name: &str, cancel: &CancellationToken) -> Result<ServiceInfo> {
        check_cancel(cancel)?;
        info!("Stopping service {}", name);

        let exit = {
            let mut registry = self.registry.lock().await;
            let Registry { records, handles } = &mut *registry;
            let Some(record) = records.get_mut(name) else {
                error!("service '{}' not found", name);
                return Err(LauncherError::NotFound(name.to_string()));
            };
            let Some(handle) = handles.get_mut(name) else {
                update_status(record, None, None);
                return Ok(record.clone());
            };
            handle.request_stop(StopSignal::Terminate);
            handle.exit_watch()
        };

        self.await_exit(name, exit, cancel).await?;

        let mut registry = self.registry.lock().await;
        let Registry { records, handles } = &mut *registry;
        let record = records
            .get_mut(name)
            .ok_or_else(|| LauncherError::NotFound(name.to_string()))?;
        update_status(record, handles.get(name), None);
        Ok(record.clone())
    }

    /// Signal every live child, then wait (bounded) for all of them.
    pub async fn stop_all(&self, cancel: &CancellationToken) -> Result<()> {
        check_cancel(cancel)?;

        let exits: Vec<(String, ExitWatch)> = {
            let mut registry = self.registry.lock().await;
            registry
                .handles
                .iter_mut()
                .map(|(name, handle)| {
                    handle.request_stop(StopSignal::Terminate);
                    (name.clone(), handle.exit_watch())
                })
                .collect()
        };
        info!("Stopping all ({}) services", exits.len());

        let deadline = Instant::now() + self.config.stop_grace;
        let mut stragglers = Vec::new();
        for (name, exit) in exits {
            check_cancel(cancel)?;
            if !wait_exit_until(exit.clone(), deadline).await {
                stragglers.push((name, exit));
            }
        }
        if stragglers.is_empty() {
            return Ok(());
        }

        {
            let registry = self.registry.lock().await;
            for (name, _) in &stragglers {
                if let Some(handle) = registry.handles.get(name) {
                    warn!("Service '{}' did not stop in time, force killing", name);
                    handle.signal(StopSignal::Kill);
                }
            }
        }
        let deadline = Instant::now() + KILL_WAIT;
        for (name, exit) in stragglers {
            check_cancel(cancel)?;
            if !wait_exit_until(exit, deadline).await {
                warn!("Service '{}' has not been reaped yet", name);
            }
        }
        Ok(())
    }

    /// Stop all children and wait for their reapers. Children still alive
    /// afterwards are killed by their reapers.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop_all(&CancellationToken::new()).await {
            warn!("Stopping services on shutdown failed: {}", e);
        }
        self.shutdown.cancel();
        self.reapers.close();
        if tokio::time::timeout(MAX_STOP_GRACE, self.reapers.wait())
            .await
            .is_err()
        {
            warn!("Some reapers did not finish before shutdown");
        }
    }

    /// Spawn `name` and install its handle. The registry lock is held by
    /// the caller, so the start is atomic with respect to other requests.
    async fn spawn_locked(
        &self,
        registry: &mut Registry,
        name: &str,
        output: ServiceOutput,
    ) -> Result<ExitWatch> {
        let Some(record) = registry.records.get_mut(name) else {
            return Err(LauncherError::NotFound(name.to_string()));
        };

        info!("Starting service '{}'", name);
        output.begin().await;
        let mut cmd = Command::new(&record.path);
        output.configure(&mut cmd);
        cmd.kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                record.status = format!("failed starting '{}': {}", name, e);
                error!("{}", record.status);
                return Err(LauncherError::Spawn {
                    name: name.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let stderr_tail = Arc::new(LineRing::new(self.config.stderr_tail_lines));
        let tee = output.attach(&mut child, Arc::clone(&stderr_tail));
        let (handle, reaper) = reaper::track(name, child, tee, stderr_tail);
        let exit = handle.exit_watch();

        record.start_count += 1;
        record.start_time = format_timestamp(Utc::now());
        record.stop_time.clear();
        record.status.clear();
        record.pid = handle.pid() as i32;
        record.running = true;
        info!("Started service '{}' with PID {}", name, record.pid);

        registry.handles.insert(name.to_string(), handle);
        self.reapers
            .spawn(reaper.run(Arc::clone(&self.registry), self.shutdown.clone()));
        Ok(exit)
    }

    /// Wait out the grace period, escalate to SIGKILL, then wait once more.
    async fn await_exit(&self, name: &str, exit: ExitWatch, cancel: &CancellationToken) -> Result<()> {
        let exited = tokio::select! {
            _ = cancel.cancelled() => return Err(LauncherError::Cancelled),
            exited = wait_exit(exit.clone(), self.config.stop_grace) => exited,
        };
        if exited {
            return Ok(());
        }

        {
            let registry = self.registry.lock().await;
            if let Some(handle) = registry.handles.get(name) {
                warn!("Service '{}' did not stop in time, force killing", name);
                handle.signal(StopSignal::Kill);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(LauncherError::Cancelled),
            exited = wait_exit(exit, KILL_WAIT) => {
                if !exited {
                    warn!("Service '{}' has not been reaped yet", name);
                }
                Ok(())
            }
        }
    }

    async fn snapshot(&self, name: &str) -> Result<ServiceInfo> {
        let mut registry = self.registry.lock().await;
        let Registry { records, handles } = &mut *registry;
        let record = records
            .get_mut(name)
            .ok_or_else(|| LauncherError::NotFound(name.to_string()))?;
        let handle = handles.get(name);
        let usage = handle.and_then(|h| {
            self.sampler
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .sample(&[h.pid()])
                .get(&h.pid())
                .copied()
        });
        update_status(record, handle, usage);
        Ok(record.clone())
    }

    fn sample(&self, handles: &HashMap<String, ChildHandle>) -> HashMap<u32, super::status::Usage> {
        let pids: Vec<u32> = handles
            .values()
            .filter(|h| !h.has_exited())
            .map(ChildHandle::pid)
            .collect();
        self.sampler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sample(&pids)
    }
}

#[async_trait]
impl Launcher for Supervisor {
    async fn list(&self, only_running: bool, cancel: &CancellationToken) -> Result<Vec<ServiceInfo>> {
        check_cancel(cancel)?;
        Ok(Supervisor::list(self, only_running).await)
    }

    async fn start_service(&self, name: &str, cancel: &CancellationToken) -> Result<ServiceInfo> {
        self.start_one(name, cancel).await
    }

    async fn start_all(&self, cancel: &CancellationToken) -> Result<()> {
        Supervisor::start_all(self, cancel).await
    }

    async fn stop_service(&self, name: &str, cancel: &CancellationToken) -> Result<ServiceInfo> {
        self.stop_one(name, cancel).await
    }

    async fn stop_all(&self, cancel: &CancellationToken) -> Result<()> {
        Supervisor::stop_all(self, cancel).await
    }
}

/// Whether `name` may be spawned now.
fn check_startable(registry: &Registry, name: &str) -> Result<()> {
    if !registry.records.contains_key(name) {
        return Err(LauncherError::NotFound(name.to_string()));
    }
    if let Some(handle) = registry.handles.get(name) {
        if handle.has_exited() {
            return Err(LauncherError::Busy(name.to_string()));
        }
        warn!("Starting service '{}' failed. The service is already running", name);
        return Err(LauncherError::AlreadyRunning {
            name: name.to_string(),
            pid: handle.pid() as i32,
        });
    }
    Ok(())
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(LauncherError::Cancelled);
    }
    Ok(())
}

/// True once the reaper has published the exit (or is gone).
async fn wait_exit(exit: ExitWatch, within: Duration) -> bool {
    wait_exit_until(exit, Instant::now() + within).await
}

async fn wait_exit_until(mut exit: ExitWatch, deadline: Instant) -> bool {
    match tokio::time::timeout_at(deadline, exit.wait_for(Option::is_some)).await {
        Ok(_) => true,
        Err(_) => false,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::daemon::reaper::STOPPED_BY_USER;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn script(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn supervisor_with(scripts: &[(&str, &str)]) -> (tempfile::TempDir, Supervisor) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in scripts {
            script(dir.path(), name, body);
        }
        let supervisor = Supervisor::new(SupervisorConfig::new(dir.path())).await.unwrap();
        (dir, supervisor)
    }

    async fn wait_until_stopped(supervisor: &Supervisor, name: &str) -> ServiceInfo {
        for _ in 0..200 {
            let list = supervisor.list(false).await;
            let record = list.into_iter().find(|r| r.name == name).unwrap();
            // stop_time is written by the reaper together with the status
            if !record.running && !record.stop_time.is_empty() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("service '{}' never stopped", name);
    }

    #[tokio::test]
    async fn empty_folder_lists_nothing() {
        let (_dir, supervisor) = supervisor_with(&[]).await;
        assert!(supervisor.list(false).await.is_empty());
        assert!(supervisor.list(true).await.is_empty());
    }

    #[tokio::test]
    async fn discovery_populates_sorted_records() {
        let (_dir, supervisor) =
            supervisor_with(&[("yes", "exec sleep 30"), ("Beta", "exit 0"), ("alpha", "exit 0")]).await;
        let list = supervisor.list(false).await;
        let names: Vec<_> = list.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Beta", "alpha", "yes"]);

        let yes = &list[2];
        assert!(!yes.running);
        assert!(yes.size > 0);
        assert_eq!(yes.start_count, 0);
        assert_eq!(yes.pid, 0);
    }

    #[tokio::test]
    async fn start_then_stop() {
        let (_dir, supervisor) = supervisor_with(&[("yes", "exec sleep 30")]).await;
        let cancel = CancellationToken::new();

        let started = supervisor.start_one("yes", &cancel).await.unwrap();
        assert!(started.running);
        assert!(started.pid > 0);
        assert!(!started.start_time.is_empty());
        assert_eq!(started.start_count, 1);

        let stopped = supervisor.stop_one("yes", &cancel).await.unwrap();
        assert!(!stopped.running);
        assert!(!stopped.stop_time.is_empty());
        assert_eq!(stopped.pid, started.pid);
        assert_eq!(stopped.start_count, 1);
        assert_eq!(stopped.status, STOPPED_BY_USER);

        // stopping again is idempotent
        let again = supervisor.stop_one("yes", &cancel).await.unwrap();
        assert!(!again.running);
        assert_eq!(again.pid, started.pid);
        assert_eq!(again, supervisor.stop_one("yes", &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (_dir, supervisor) = supervisor_with(&[("yes", "exec sleep 30")]).await;
        let cancel = CancellationToken::new();

        let first = supervisor.start_one("yes", &cancel).await.unwrap();
        let err = supervisor.start_one("yes", &cancel).await.unwrap_err();
        match err {
            LauncherError::AlreadyRunning { pid, .. } => assert_eq!(pid, first.pid),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        let list = supervisor.list(true).await;
        assert_eq!(list[0].pid, first.pid);
        assert_eq!(list[0].start_count, 1);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_names_are_not_found() {
        let (_dir, supervisor) = supervisor_with(&[]).await;
        let cancel = CancellationToken::new();
        assert!(matches!(
            supervisor.start_one("nonexistent", &cancel).await,
            Err(LauncherError::NotFound(_))
        ));
        assert!(matches!(
            supervisor.stop_one("nonexistent", &cancel).await,
            Err(LauncherError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn start_and_stop_all() {
        let (_dir, supervisor) =
            supervisor_with(&[("one", "exec sleep 30"), ("two", "exec sleep 30")]).await;
        let cancel = CancellationToken::new();

        supervisor.stop_all(&cancel).await.unwrap();
        supervisor.start_one("one", &cancel).await.unwrap();
        assert_eq!(supervisor.list(true).await.len(), 1);

        supervisor.start_all(&cancel).await.unwrap();
        assert_eq!(supervisor.list(true).await.len(), 2);

        supervisor.stop_all(&cancel).await.unwrap();
        assert!(supervisor.list(true).await.is_empty());
        let counts: Vec<_> = supervisor.list(false).await.iter().map(|r| r.start_count).collect();
        assert_eq!(counts, vec![1, 1]);
    }

    #[tokio::test]
    async fn term_ignoring_child_is_killed() {
        let (_dir, supervisor) =
            supervisor_with(&[("stubborn", "trap '' TERM\nwhile true; do sleep 1; done")]).await;
        let cancel = CancellationToken::new();

        supervisor.start_one("stubborn", &cancel).await.unwrap();
        // give the shell time to install its trap
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stopped = supervisor.stop_one("stubborn", &cancel).await.unwrap();
        assert!(!stopped.running);
        assert!(supervisor.list(true).await.is_empty());
    }

    #[tokio::test]
    async fn spontaneous_exit_reports_last_stderr_line() {
        let (_dir, supervisor) = supervisor_with(&[
            ("crasher", "sleep 0.05\necho 'fatal: bad config' >&2\nexit 3"),
            ("quitter", "sleep 0.05\nexit 4"),
        ])
        .await;
        let cancel = CancellationToken::new();

        supervisor.start_one("crasher", &cancel).await.unwrap();
        supervisor.start_one("quitter", &cancel).await.unwrap();

        let crasher = wait_until_stopped(&supervisor, "crasher").await;
        assert_eq!(crasher.status, "fatal: bad config");
        assert!(!crasher.stop_time.is_empty());
        assert!(crasher.pid > 0);

        let quitter = wait_until_stopped(&supervisor, "quitter").await;
        assert_eq!(quitter.status, "exited code 4");

        // restart after a crash counts a second spawn
        let again = supervisor.start_one("quitter", &cancel).await.unwrap();
        assert_eq!(again.start_count, 2);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_recorded() {
        let (dir, supervisor) = supervisor_with(&[("gone", "exit 0")]).await;
        std::fs::remove_file(dir.path().join("gone")).unwrap();
        let cancel = CancellationToken::new();

        let err = supervisor.start_one("gone", &cancel).await.unwrap_err();
        assert!(matches!(err, LauncherError::Spawn { .. }));

        supervisor.start_all(&cancel).await.unwrap();
        let record = &supervisor.list(false).await[0];
        assert_eq!(record.start_count, 0);
        assert!(record.status.starts_with("failed starting 'gone'"));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let (_dir, supervisor) = supervisor_with(&[("yes", "exec sleep 30")]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            supervisor.start_one("yes", &cancel).await,
            Err(LauncherError::Cancelled)
        ));
        assert!(matches!(
            supervisor.stop_all(&cancel).await,
            Err(LauncherError::Cancelled)
        ));
        assert_eq!(supervisor.list(false).await[0].start_count, 0);
    }

    #[tokio::test]
    async fn rescan_picks_up_new_files_and_keeps_history() {
        let (dir, supervisor) = supervisor_with(&[("yes", "exec sleep 30")]).await;
        let cancel = CancellationToken::new();
        supervisor.start_one("yes", &cancel).await.unwrap();
        supervisor.stop_one("yes", &cancel).await.unwrap();

        script(dir.path(), "late", "exit 0");
        assert_eq!(supervisor.rescan().await.unwrap(), 1);
        assert_eq!(supervisor.rescan().await.unwrap(), 0);

        let list = supervisor.list(false).await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].name, "yes");
        assert_eq!(list[1].start_count, 1);
    }

    #[tokio::test]
    async fn autostart_starts_listed_services() {
        let dir = tempfile::tempdir().unwrap();
        script(dir.path(), "yes", "exec sleep 30");
        script(dir.path(), "no", "exec sleep 30");
        let mut config = SupervisorConfig::new(dir.path());
        config.autostart = vec!["yes".into(), "missing".into()];
        let supervisor = Supervisor::new(config).await.unwrap();

        supervisor.start_autostart().await;
        let running: Vec<_> = supervisor
            .list(true)
            .await
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(running, vec!["yes"]);
        supervisor.shutdown().await;
        assert!(supervisor.list(true).await.is_empty());
    }

    #[tokio::test]
    async fn grace_period_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SupervisorConfig::new(dir.path());
        config.stop_grace = Duration::from_secs(60);
        let supervisor = Supervisor::new(config).await.unwrap();
        assert_eq!(supervisor.config().stop_grace, MAX_STOP_GRACE);
    }

    #[tokio::test]
    async fn no_folders_is_a_config_error() {
        let mut config = SupervisorConfig::new("/unused");
        config.folders.clear();
        assert!(matches!(
            Supervisor::new(config).await,
            Err(LauncherError::Config(_))
        ));
    }

    #[tokio::test]
    async fn binary_output_does_not_kill_the_child() {
        let (_dir, supervisor) = supervisor_with(&[(
            "binary",
            "printf '\\377\\n' >&2\nsleep 0.2\nwhile true; do echo alive >&2; sleep 0.05; done",
        )])
        .await;
        let cancel = CancellationToken::new();

        supervisor.start_one("binary", &cancel).await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let running = supervisor.list(true).await;
        assert_eq!(running.len(), 1, "child died: {:?}", supervisor.list(false).await);
        assert_eq!(running[0].status, "alive");
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn rejected_start_keeps_the_running_log() {
        let dir = tempfile::tempdir().unwrap();
        let services = dir.path().join("services");
        let logs = dir.path().join("logs");
        std::fs::create_dir(&services).unwrap();
        script(&services, "chatty", "echo hello\nexec sleep 30");
        let mut config = SupervisorConfig::new(&services);
        config.output.logs_dir = Some(logs.clone());
        let supervisor = Supervisor::new(config).await.unwrap();
        let cancel = CancellationToken::new();

        supervisor.start_one("chatty", &cancel).await.unwrap();
        let log_path = logs.join("chatty.log");
        let read_log = || std::fs::read_to_string(&log_path).unwrap_or_default();
        for _ in 0..100 {
            if read_log().contains("hello") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(read_log(), "hello\n");

        assert!(matches!(
            supervisor.start_one("chatty", &cancel).await,
            Err(LauncherError::AlreadyRunning { .. })
        ));
        assert_eq!(read_log(), "hello\n");
        supervisor.shutdown().await;
    }

    /// A script that blocks until `go` exists, then fails with "boom".
    fn gated(dir: &Path, go: &Path) {
        script(
            dir,
            "gated",
            &format!(
                "while [ ! -e '{}' ]; do sleep 0.01; done\necho boom >&2\nexit 2",
                go.display()
            ),
        );
    }

    /// Release the gate while holding the registry lock and wait until
    /// the OS reports the exit. The reaper cannot finish meanwhile.
    async fn exit_under_lock(registry: &Registry, go: &Path) {
        std::fs::write(go, "").unwrap();
        for _ in 0..300 {
            if registry.handles["gated"].has_exited() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("gated child never exited");
    }

    #[tokio::test]
    async fn exited_but_unreaped_child_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let go = dir.path().join("go");
        gated(dir.path(), &go);
        let supervisor = Supervisor::new(SupervisorConfig::new(dir.path())).await.unwrap();
        let cancel = CancellationToken::new();

        let started = supervisor.start_one("gated", &cancel).await.unwrap();
        {
            let registry = supervisor.registry.lock().await;
            exit_under_lock(&registry, &go).await;
            assert!(matches!(
                check_startable(&registry, "gated"),
                Err(LauncherError::Busy(_))
            ));
        }

        let stopped = wait_until_stopped(&supervisor, "gated").await;
        assert_eq!(stopped.status, "boom");
        assert_eq!(stopped.pid, started.pid);

        // once reaped it can be started again
        let again = supervisor.start_one("gated", &cancel).await.unwrap();
        assert_eq!(again.start_count, 2);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn crash_before_stop_keeps_its_report() {
        let dir = tempfile::tempdir().unwrap();
        let go = dir.path().join("go");
        gated(dir.path(), &go);
        let supervisor = Supervisor::new(SupervisorConfig::new(dir.path())).await.unwrap();
        let cancel = CancellationToken::new();

        supervisor.start_one("gated", &cancel).await.unwrap();
        {
            let mut registry = supervisor.registry.lock().await;
            exit_under_lock(&registry, &go).await;
            let handle = registry.handles.get_mut("gated").unwrap();
            handle.request_stop(StopSignal::Terminate);
            assert!(!handle.stop_requested());
        }

        let stopped = supervisor.stop_one("gated", &cancel).await.unwrap();
        assert!(!stopped.running);
        assert_eq!(stopped.status, "boom");
        assert_eq!(wait_until_stopped(&supervisor, "gated").await.status, "boom");
    }

    /// Tiny LCG so the operation sequence is reproducible.
    struct Lcg(u64);

    impl Lcg {
        fn below(&mut self, n: u64) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (self.0 >> 33) % n
        }
    }

    /// Wait until the short-lived services are reaped and no handle
    /// belongs to an exited child.
    async fn quiesce(supervisor: &Supervisor, short_lived: &[&str]) {
        for _ in 0..300 {
            {
                let registry = supervisor.registry.lock().await;
                let settled = short_lived.iter().all(|n| !registry.handles.contains_key(*n))
                    && registry.handles.values().all(|h| !h.has_exited());
                if settled {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("supervisor never settled");
    }

    #[tokio::test]
    async fn records_stay_consistent_over_operation_sequences() {
        let names = ["alpha", "beta", "quick"];
        let (_dir, supervisor) = supervisor_with(&[
            ("alpha", "exec sleep 30"),
            ("beta", "exec sleep 30"),
            ("quick", "exit 0"),
        ])
        .await;
        let cancel = CancellationToken::new();
        let mut rng = Lcg(0x5eed);
        // name -> (successful spawns, last pid)
        let mut expected: HashMap<&str, (i32, i32)> = names.iter().map(|n| (*n, (0, 0))).collect();

        for step in 0..40 {
            let before = supervisor.list(false).await;
            let was_running = |name: &str| before.iter().any(|r| r.name == name && r.running);
            let name = names[rng.below(names.len() as u64) as usize];
            let mut started_by_all = Vec::new();

            match rng.below(5) {
                0 => match supervisor.start_one(name, &cancel).await {
                    Ok(info) => {
                        assert!(!was_running(name), "step {step}: started a live {name}");
                        assert!(info.pid > 0);
                        let entry = expected.get_mut(name).unwrap();
                        *entry = (entry.0 + 1, info.pid);
                    }
                    Err(LauncherError::AlreadyRunning { pid, .. }) => {
                        assert!(was_running(name), "step {step}: {name} not running");
                        assert_eq!(pid, expected[name].1);
                    }
                    Err(e) => panic!("step {step}: start {name}: {e}"),
                },
                1 => {
                    let info = supervisor.stop_one(name, &cancel).await.unwrap();
                    assert!(!info.running, "step {step}: {name} still running");
                }
                2 => {
                    supervisor.start_all(&cancel).await.unwrap();
                    for name in names {
                        if !was_running(name) {
                            expected.get_mut(name).unwrap().0 += 1;
                            started_by_all.push(name);
                        }
                    }
                }
                3 => supervisor.stop_all(&cancel).await.unwrap(),
                _ => {
                    supervisor.list(rng.below(2) == 0).await;
                }
            }

            quiesce(&supervisor, &["quick"]).await;
            let list = supervisor.list(false).await;
            let running: Vec<String> = supervisor.list(true).await.into_iter().map(|r| r.name).collect();
            for record in &list {
                if started_by_all.contains(&record.name.as_str()) {
                    expected.get_mut(record.name.as_str()).unwrap().1 = record.pid;
                }
            }

            assert!(list.windows(2).all(|w| w[0].name < w[1].name), "step {step}: unsorted");
            let registry = supervisor.registry.lock().await;
            for record in &list {
                let (starts, pid) = expected[record.name.as_str()];
                assert_eq!(record.start_count, starts, "step {step}: {}", record.name);
                assert_eq!(record.pid, pid, "step {step}: {}", record.name);
                assert_eq!(
                    record.running,
                    registry.handles.contains_key(&record.name),
                    "step {step}: {}",
                    record.name
                );
                assert_eq!(record.running, running.contains(&record.name));
                if !record.running {
                    assert_eq!((record.uptime, record.cpu, record.rss), (0, 0, 0));
                }
            }
            assert!(list.iter().filter(|r| r.start_count > 0).all(|r| r.pid > 0));
        }
        supervisor.shutdown().await;
    }
}
