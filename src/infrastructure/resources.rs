//! Host resource probe backing the early-fail validator's resource check.

use sysinfo::{Disks, System};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostResources {
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub free_disk_gib: f64,
}

impl HostResources {
    pub fn within(&self, max_cpu_pct: f64, max_memory_pct: f64, min_free_disk_gib: f64) -> bool {
        self.cpu_pct <= max_cpu_pct
            && self.memory_pct <= max_memory_pct
            && self.free_disk_gib >= min_free_disk_gib
    }
}

/// Samples CPU, memory, and free disk. CPU usage needs two measurements a
/// short interval apart to be meaningful.
pub fn probe() -> HostResources {
    let mut system = System::new();
    system.refresh_cpu_usage();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    system.refresh_cpu_usage();
    system.refresh_memory();

    let cpu_pct = system.global_cpu_usage() as f64;
    let memory_pct = if system.total_memory() > 0 {
        system.used_memory() as f64 / system.total_memory() as f64 * 100.0
    } else {
        0.0
    };

    let disks = Disks::new_with_refreshed_list();
    let free_disk_gib = disks
        .list()
        .iter()
        .map(|d| d.available_space())
        .max()
        .unwrap_or(0) as f64
        / (1024.0 * 1024.0 * 1024.0);

    HostResources {
        cpu_pct,
        memory_pct,
        free_disk_gib,
    }
}
