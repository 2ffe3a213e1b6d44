/*!
# Resources Module

Process resource probes consulted by the worker between jobs.

The worker stops once the resident memory of its process reaches the
configured limit. Measurement goes through the `MemoryProbe` trait so tests
can substitute a fixed reading for the live `sysinfo` probe.
*/

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, System};

/// Source of the current memory usage, in megabytes
pub trait MemoryProbe: Debug + Send + Sync {
    fn used_mb(&self) -> u64;
}

/// Resident memory of the current process, read through `sysinfo`
#[derive(Debug)]
pub struct ProcessMemory {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemory {
    pub fn new() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemory {
    fn used_mb(&self) -> u64 {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return 0,
        };

        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_process(pid);

        system
            .process(pid)
            .map(|process| process.memory() / (1024 * 1024))
            .unwrap_or(0)
    }
}

/// Probe returning a settable reading; clones share the value.
#[derive(Debug, Clone, Default)]
pub struct FixedMemory {
    used_mb: Arc<AtomicU64>,
}

impl FixedMemory {
    pub fn new(used_mb: u64) -> Self {
        Self {
            used_mb: Arc::new(AtomicU64::new(used_mb)),
        }
    }

    pub fn set(&self, used_mb: u64) {
        self.used_mb.store(used_mb, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemory {
    fn used_mb(&self) -> u64 {
        self.used_mb.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_memory_resolves_current_pid() {
        let probe = ProcessMemory::new();
        let _ = probe.used_mb();
        assert!(probe.pid.is_some());
    }

    #[test]
    fn fixed_memory_clones_share_reading() {
        let probe = FixedMemory::new(10);
        let other = probe.clone();

        other.set(256);
        assert_eq!(probe.used_mb(), 256);
    }
}
