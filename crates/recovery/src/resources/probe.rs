//! Host probing for system-state snapshots.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use sysinfo::{Disks, System};

use crate::model::{ResourceRequirements, SystemState};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Source of [`SystemState`] snapshots
pub trait SystemProbe: Send + Sync {
    fn snapshot(&self) -> anyhow::Result<SystemState>;
}

/// Probe backed by `sysinfo`
pub struct SysinfoProbe {
    sys: Mutex<System>,
    /// Nominal network capacity; sysinfo does not report link speed
    network_mbps: f64,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new(1000.0)
    }
}

impl SysinfoProbe {
    pub fn new(network_mbps: f64) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_all();
        sys.refresh_memory();
        Self {
            sys: Mutex::new(sys),
            network_mbps,
        }
    }
}

impl SystemProbe for SysinfoProbe {
    fn snapshot(&self) -> anyhow::Result<SystemState> {
        let (cpu_usage, cpu_count, total_memory, used_memory, available_memory) = {
            let mut sys = self.sys.lock();
            sys.refresh_cpu_all();
            sys.refresh_memory();
            (
                f64::from(sys.global_cpu_usage()),
                sys.cpus().len().max(1),
                sys.total_memory(),
                sys.used_memory(),
                sys.available_memory(),
            )
        };
        if total_memory == 0 {
            anyhow::bail!("host reported zero total memory");
        }

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(total, avail), d| {
                (total + d.total_space(), avail + d.available_space())
            });
        let disk_usage_percent = if disk_total == 0 {
            0.0
        } else {
            (disk_total - disk_available.min(disk_total)) as f64 / disk_total as f64 * 100.0
        };

        let cpu_usage = cpu_usage.clamp(0.0, 100.0);
        let available = ResourceRequirements {
            cpu_cores: cpu_count as f64 * (1.0 - cpu_usage / 100.0),
            memory_mb: available_memory / BYTES_PER_MB,
            disk_mb: disk_available / BYTES_PER_MB,
            network_mbps: self.network_mbps,
        };

        Ok(SystemState {
            captured_at: Utc::now(),
            cpu_usage_percent: cpu_usage,
            memory_usage_percent: used_memory as f64 / total_memory as f64 * 100.0,
            disk_usage_percent,
            load_average: System::load_average().one,
            available,
            metrics: HashMap::new(),
            observed: true,
        })
    }
}

/// Probe returning a fixed snapshot, for tests and offline planning
#[derive(Debug)]
pub struct StaticProbe {
    state: Mutex<SystemState>,
}

impl StaticProbe {
    pub fn new(state: SystemState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    /// Host with comfortable headroom on every dimension
    pub fn healthy() -> Self {
        Self::new(SystemState {
            captured_at: Utc::now(),
            cpu_usage_percent: 20.0,
            memory_usage_percent: 40.0,
            disk_usage_percent: 30.0,
            load_average: 0.5,
            available: ResourceRequirements::new(8.0, 16 * 1024, 100 * 1024, 1000.0),
            metrics: HashMap::new(),
            observed: true,
        })
    }

    pub fn set(&self, state: SystemState) {
        *self.state.lock() = state;
    }

    pub fn update<F: FnOnce(&mut SystemState)>(&self, f: F) {
        f(&mut *self.state.lock());
    }
}

impl SystemProbe for StaticProbe {
    fn snapshot(&self) -> anyhow::Result<SystemState> {
        let mut state = self.state.lock().clone();
        state.captured_at = Utc::now();
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysinfo_probe_reports_sane_values() {
        let probe = SysinfoProbe::default();
        let state = probe.snapshot().expect("host probe works");
        assert!(state.observed);
        assert!((0.0..=100.0).contains(&state.cpu_usage_percent));
        assert!((0.0..=100.0).contains(&state.memory_usage_percent));
        assert!(state.available.cpu_cores >= 0.0);
    }

    #[test]
    fn test_static_probe_updates() {
        let probe = StaticProbe::healthy();
        probe.update(|s| s.cpu_usage_percent = 99.0);
        assert_eq!(probe.snapshot().expect("static").cpu_usage_percent, 99.0);
    }
}
