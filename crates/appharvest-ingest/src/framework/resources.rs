//! System and process resource probes
//!
//! The orchestrator asks a [`ResourceProbe`] for host memory and load before
//! each scheduling tick; workers ask a [`MemoryProbe`] for their own resident
//! size to decide on early flushes. [`SystemProbe`] backs both with `sysinfo`.

use parking_lot::Mutex;
use sysinfo::{Pid, ProcessExt, System, SystemExt};

/// Host pressure at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSnapshot {
    /// Used memory as a percentage of total, 0..=100
    pub memory_percent: f64,
    /// 1-minute load average divided by logical CPU count
    pub load_per_cpu: f64,
}

pub trait ResourceProbe: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;
}

pub trait MemoryProbe: Send + Sync {
    /// Resident memory of the current process in MiB
    fn process_memory_mb(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Only keep the concurrency floor
    Unhealthy,
    /// Launch nothing, not even to hold the floor
    Severe,
}

/// Thresholds that turn a snapshot into a [`Health`] verdict
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthPolicy {
    pub unhealthy_memory_pct: f64,
    pub severe_memory_pct: f64,
    pub load_per_cpu_limit: f64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            unhealthy_memory_pct: 85.0,
            severe_memory_pct: 95.0,
            load_per_cpu_limit: 2.0,
        }
    }
}

impl HealthPolicy {
    pub fn assess(&self, snapshot: &ResourceSnapshot) -> Health {
        if snapshot.memory_percent > self.severe_memory_pct {
            Health::Severe
        } else if snapshot.memory_percent > self.unhealthy_memory_pct
            || snapshot.load_per_cpu > self.load_per_cpu_limit
        {
            Health::Unhealthy
        } else {
            Health::Healthy
        }
    }
}

/// `sysinfo`-backed probe for the local host and process
pub struct SystemProbe {
    sys: Mutex<System>,
    pid: Option<Pid>,
    cpus: usize,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            sys: Mutex::new(sys),
            pid: sysinfo::get_current_pid().ok(),
            cpus: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

impl ResourceProbe for SystemProbe {
    fn snapshot(&self) -> ResourceSnapshot {
        let mut sys = self.sys.lock();
        sys.refresh_memory();

        let total = sys.total_memory() as f64;
        let available = sys.available_memory() as f64;
        let memory_percent = if total > 0.0 {
            ((total - available) / total * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        ResourceSnapshot {
            memory_percent,
            load_per_cpu: sys.load_average().one / self.cpus as f64,
        }
    }
}

impl MemoryProbe for SystemProbe {
    fn process_memory_mb(&self) -> u64 {
        let Some(pid) = self.pid else {
            return 0;
        };
        let mut sys = self.sys.lock();
        if !sys.refresh_process(pid) {
            return 0;
        }
        sys.process(pid).map_or(0, |p| p.memory() / (1024 * 1024))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(memory_percent: f64, load_per_cpu: f64) -> ResourceSnapshot {
        ResourceSnapshot {
            memory_percent,
            load_per_cpu,
        }
    }

    #[test]
    fn test_health_thresholds() {
        let policy = HealthPolicy::default();
        assert_eq!(policy.assess(&snap(50.0, 0.5)), Health::Healthy);
        assert_eq!(policy.assess(&snap(85.0, 0.5)), Health::Healthy);
        assert_eq!(policy.assess(&snap(90.0, 0.5)), Health::Unhealthy);
        assert_eq!(policy.assess(&snap(50.0, 2.5)), Health::Unhealthy);
        assert_eq!(policy.assess(&snap(96.0, 0.1)), Health::Severe);
    }

    #[test]
    fn test_system_probe_reports_sane_values() {
        let probe = SystemProbe::new();
        let snapshot = probe.snapshot();
        assert!((0.0..=100.0).contains(&snapshot.memory_percent));
        assert!(snapshot.load_per_cpu >= 0.0);
    }
}
