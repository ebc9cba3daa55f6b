use super::protocol::ServiceInfo;
use super::reaper::ChildHandle;
use std::collections::HashMap;
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

/// Resource usage of one process at the last sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Percent of one CPU, clamped to 0..=100
    pub cpu: i32,
    /// Resident set size in bytes
    pub rss: i64,
}

/// Best-effort CPU/RSS sampler.
///
/// CPU usage is the delta since the previous refresh of the same PID, so
/// the first sample after a start reads 0.
pub struct ProcessSampler {
    system: System,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    pub fn sample(&mut self, pids: &[u32]) -> HashMap<u32, Usage> {
        if pids.is_empty() {
            return HashMap::new();
        }
        let tracked: Vec<SysPid> = pids.iter().copied().map(SysPid::from_u32).collect();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&tracked), true);

        pids.iter()
            .filter_map(|&pid| {
                let process = self.system.process(SysPid::from_u32(pid))?;
                let usage = Usage {
                    cpu: process.cpu_usage().clamp(0.0, 100.0).round() as i32,
                    rss: i64::try_from(process.memory()).unwrap_or(i64::MAX),
                };
                Some((pid, usage))
            })
            .collect()
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Refresh the derived fields of `record` from its live handle, if any.
///
/// Without a handle the runtime fields are zeroed while `pid`,
/// `start_count`, `start_time`, `stop_time` and `status` are kept for
/// post-mortem display.
pub fn update_status(record: &mut ServiceInfo, handle: Option<&ChildHandle>, usage: Option<Usage>) {
    let Some(handle) = handle else {
        record.running = false;
        record.uptime = 0;
        record.cpu = 0;
        record.rss = 0;
        return;
    };

    record.pid = handle.pid() as i32;
    record.running = record.pid != 0 && !handle.has_exited();

    if record.running {
        let uptime = handle.started().elapsed().as_secs();
        record.uptime = i32::try_from(uptime).unwrap_or(i32::MAX);
        let usage = usage.unwrap_or_default();
        record.cpu = usage.cpu;
        record.rss = usage.rss;
    } else {
        record.uptime = 0;
        record.cpu = 0;
        record.rss = 0;
    }

    if let Some(line) = handle.stderr_tail().last() {
        record.status = line;
    } else if let Some(error) = handle.last_error() {
        record.status = error;
    }
}
