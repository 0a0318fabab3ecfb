//! Memory guardrail for the profiler process itself.

use std::time::Duration;

use anyhow::{anyhow, Result};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// How often the footprint is compared against the configured ceilings.
pub const GUARDRAIL_CHECK_PERIOD: Duration = Duration::from_millis(1000);

/// Reports how much memory the profiler is using.
pub trait FootprintSource: Send {
    fn footprint_kb(&mut self) -> Option<u64>;
}

/// Resident memory of the current process, as seen by sysinfo.
pub struct ProcessFootprint {
    system: System,
    pid: Pid,
}

impl ProcessFootprint {
    pub fn new() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| anyhow!("Failed to get own pid: {e}"))?;
        Ok(ProcessFootprint {
            system: System::new(),
            pid,
        })
    }
}

impl FootprintSource for ProcessFootprint {
    fn footprint_kb(&mut self) -> Option<u64> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system
            .process(self.pid)
            .map(|process| process.memory() / 1024)
    }
}

/// Whether a data source allowing at most `max_kb` must be stopped. A ceiling of 0 means
/// unlimited.
pub fn exceeds_guardrail(footprint_kb: u64, max_kb: u32) -> bool {
    max_kb > 0 && footprint_kb > max_kb as u64
}
