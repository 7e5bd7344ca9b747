//! Memory probe collaborator. The merger reports its allocation estimate to
//! the probe between chunks; the probe folds in process RSS and
//! system-available memory and answers with a pressure level.

use sysinfo::{Pid, ProcessesToUpdate, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    Normal,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryStatus {
    pub allocated_bytes: u64,
    pub process_rss_bytes: Option<u64>,
    pub system_available_bytes: Option<u64>,
}

/// Limits driving the pressure thresholds. All byte values.
#[derive(Debug, Clone, Copy)]
pub struct MemoryLimits {
    pub max_allocator_bytes: u64,
    pub max_process_bytes: Option<u64>,
    pub min_system_available_bytes: u64,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        MemoryLimits {
            max_allocator_bytes: 512 * 1024 * 1024,
            max_process_bytes: None,
            min_system_available_bytes: 128 * 1024 * 1024,
        }
    }
}

pub trait MemoryProbe: Send {
    /// The engine's current allocation estimate for its working set.
    fn set_allocated(&mut self, bytes: u64);
    fn status(&mut self) -> MemoryStatus;
    fn pressure(&mut self) -> MemoryPressure;
}

fn budget_level(used: u64, budget: u64) -> MemoryPressure {
    if budget == 0 {
        return MemoryPressure::Normal;
    }
    if used >= budget {
        MemoryPressure::Emergency
    } else if used * 10 >= budget * 9 {
        MemoryPressure::Critical
    } else if used * 4 >= budget * 3 {
        MemoryPressure::Warning
    } else {
        MemoryPressure::Normal
    }
}

fn floor_level(available: u64, floor: u64) -> MemoryPressure {
    if floor == 0 {
        return MemoryPressure::Normal;
    }
    if available < floor {
        MemoryPressure::Emergency
    } else if available < floor * 2 {
        MemoryPressure::Critical
    } else if available < floor * 4 {
        MemoryPressure::Warning
    } else {
        MemoryPressure::Normal
    }
}

/// Default probe: sysinfo-backed RSS and available-memory readings combined
/// with the engine's own allocation estimate.
pub struct SystemProbe {
    sys: System,
    pid: Option<Pid>,
    limits: MemoryLimits,
    allocated: u64,
}

impl SystemProbe {
    pub fn new(limits: MemoryLimits) -> Self {
        SystemProbe {
            sys: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            limits,
            allocated: 0,
        }
    }

    pub fn limits(&self) -> &MemoryLimits {
        &self.limits
    }
}

impl MemoryProbe for SystemProbe {
    fn set_allocated(&mut self, bytes: u64) {
        self.allocated = bytes;
    }

    fn status(&mut self) -> MemoryStatus {
        self.sys.refresh_memory();
        let process_rss_bytes = self.pid.and_then(|pid| {
            self.sys
                .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            self.sys.process(pid).map(|p| p.memory())
        });
        let available = self.sys.available_memory();
        MemoryStatus {
            allocated_bytes: self.allocated,
            process_rss_bytes,
            system_available_bytes: (available > 0).then_some(available),
        }
    }

    fn pressure(&mut self) -> MemoryPressure {
        let status = self.status();
        let mut level = budget_level(status.allocated_bytes, self.limits.max_allocator_bytes);
        if let (Some(rss), Some(cap)) = (status.process_rss_bytes, self.limits.max_process_bytes) {
            level = level.max(budget_level(rss, cap));
        }
        if let Some(available) = status.system_available_bytes {
            level = level.max(floor_level(
                available,
                self.limits.min_system_available_bytes,
            ));
        }
        level
    }
}
