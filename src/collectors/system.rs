//! Host snapshot and performance sampling.

use super::{new_event_id, PerformanceSample, Severity, SystemInfo};
use chrono::Utc;
use std::sync::Mutex;
use sysinfo::{Disks, System};

pub struct SystemCollector {
    sys: Mutex<System>,
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCollector {
    pub fn new() -> Self {
        let mut sys = System::new();
        // first CPU reading is a baseline; later refreshes yield real usage
        sys.refresh_cpu();
        Self {
            sys: Mutex::new(sys),
        }
    }

    /// Static and slowly-changing host facts. Unknown fields come back empty or zero.
    pub fn collect(&self, agent_id: &str) -> SystemInfo {
        let mut sys = self.sys.lock().unwrap_or_else(|p| p.into_inner());
        sys.refresh_cpu();
        sys.refresh_memory();
        let now = Utc::now();
        SystemInfo {
            id: new_event_id(),
            agent_id: agent_id.to_string(),
            hostname: System::host_name().unwrap_or_default(),
            os_version: System::long_os_version().unwrap_or_default(),
            architecture: std::env::consts::ARCH.to_string(),
            total_memory: sys.total_memory(),
            available_memory: sys.available_memory(),
            cpu_count: sys.cpus().len(),
            cpu_usage: sys.global_cpu_info().cpu_usage() as f64,
            disk_usage: disk_usage_percent(),
            uptime: System::uptime(),
            timestamp: now,
            created_at: now,
        }
    }

    /// CPU, memory and process-count sample
    pub fn performance(&self, agent_id: &str) -> PerformanceSample {
        let mut sys = self.sys.lock().unwrap_or_else(|p| p.into_inner());
        sys.refresh_cpu();
        sys.refresh_memory();
        sys.refresh_processes();
        let total = sys.total_memory();
        let available = sys.available_memory();
        let used = total.saturating_sub(available);
        let now = Utc::now();
        PerformanceSample {
            id: new_event_id(),
            agent_id: agent_id.to_string(),
            event_type: "performance_metrics".to_string(),
            cpu_usage: sys.global_cpu_info().cpu_usage() as f64,
            memory_total: total,
            memory_used: used,
            memory_available: available,
            memory_usage_percent: if total == 0 {
                0.0
            } else {
                used as f64 / total as f64 * 100.0
            },
            process_count: sys.processes().len(),
            severity: Severity::Info,
            timestamp: now,
            created_at: now,
        }
    }
}

/// Used percentage across all mounted disks
fn disk_usage_percent() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let (total, available) = disks.list().iter().fold((0u64, 0u64), |(t, a), d| {
        (t + d.total_space(), a + d.available_space())
    });
    if total == 0 {
        return 0.0;
    }
    (total - available.min(total)) as f64 / total as f64 * 100.0
}
