//! Resident-memory probing and health classification.

use serde::Serialize;
use sysinfo::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryThresholds {
    pub warning_mb: u64,
    pub critical_mb: u64,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            warning_mb: 512,
            critical_mb: 768,
        }
    }
}

impl MemoryThresholds {
    pub fn classify(&self, resident_mb: Option<u64>) -> HealthStatus {
        match resident_mb {
            Some(mb) if mb >= self.critical_mb => HealthStatus::Critical,
            Some(mb) if mb >= self.warning_mb => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

pub trait MemoryProbe: Send + Sync {
    /// Resident set size of this process in MiB, if the platform reports it.
    fn resident_mb(&self) -> Option<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    fn resident_mb(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut sys = System::new();
        sys.refresh_process(pid);
        sys.process(pid).map(|p| p.memory() / (1024 * 1024))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe(pub Option<u64>);

impl MemoryProbe for FixedMemoryProbe {
    fn resident_mb(&self) -> Option<u64> {
        self.0
    }
}
