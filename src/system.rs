//! Host and process memory figures for the UI's metrics panel.

use serde::{Deserialize, Serialize};
use sysinfo::{ProcessesToUpdate, System};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Bytes to whole megabytes, rounded.
pub fn bytes_to_mb(bytes: u64) -> u64 {
    (bytes as f64 / BYTES_PER_MB).round() as u64
}

/// System memory in MB.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used: u64,
    pub total: u64,
}

/// Memory of this process in MB.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMemory {
    pub rss: u64,
    pub virtual_memory: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SystemInfo {
    pub platform: String,
    pub arch: String,
    /// Seconds since this process started.
    pub uptime: u64,
    pub memory_usage: MemoryUsage,
    pub process_memory: ProcessMemory,
}

/// Snapshot the host memory and this process's footprint.
pub fn collect() -> Result<SystemInfo, String> {
    let pid = sysinfo::get_current_pid().map_err(|e| format!("Failed to get current pid: {e}"))?;

    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    let process = sys
        .process(pid)
        .ok_or_else(|| format!("Process {pid} not found"))?;

    let total = sys.total_memory();
    // Some hosts report used > total for a moment while refreshing.
    let used = sys.used_memory().min(total);

    Ok(SystemInfo {
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        uptime: process.run_time(),
        memory_usage: MemoryUsage {
            used: bytes_to_mb(used),
            total: bytes_to_mb(total),
        },
        process_memory: ProcessMemory {
            rss: bytes_to_mb(process.memory()),
            virtual_memory: bytes_to_mb(process.virtual_memory()),
        },
    })
}
