//! Small system helpers shared by the producer and the readers.

use std::fs;
use std::path::{Path, PathBuf};

/// Reads a clock via `clock_gettime(2)` and returns nanoseconds.
///
/// Returns 0 if the clock can't be read, which only happens for invalid clock ids.
pub fn get_clock_value(clock_id: libc::clockid_t) -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
        return 0;
    }
    (ts.tv_sec as u64 * 1_000_000_000) + ts.tv_nsec as u64
}

/// Current `CLOCK_BOOTTIME` in nanoseconds, the clock packets without a sample timestamp use.
pub fn boot_time_ns() -> u64 {
    get_clock_value(libc::CLOCK_BOOTTIME)
}

/// Milliseconds since the epoch on the wall clock. Used to align periodic ticks.
pub fn wall_time_ms() -> u64 {
    get_clock_value(libc::CLOCK_REALTIME) / 1_000_000
}

/// The system page size.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Number of CPUs the kernel was configured with, online or not.
pub fn num_configured_cpus() -> u32 {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n <= 0 {
        1
    } else {
        n as u32
    }
}

/// Whether `cpu` is online according to sysfs.
///
/// cpu0 usually has no `online` file because it can't be taken offline, so a missing file means
/// online.
pub fn is_cpu_online(sysfs_cpu_root: &Path, cpu: u32) -> bool {
    let path = sysfs_cpu_root.join(format!("cpu{cpu}")).join("online");
    match fs::read_to_string(path) {
        Ok(contents) => contents.trim() != "0",
        Err(_) => true,
    }
}

/// The CPUs a data source opens events on: every configured CPU, optionally restricted to
/// `target_cpus`, minus the offline ones.
pub fn cpu_mask(sysfs_cpu_root: &Path, num_cpus: u32, target_cpus: &[u32]) -> Vec<u32> {
    (0..num_cpus)
        .filter(|cpu| target_cpus.is_empty() || target_cpus.contains(cpu))
        .filter(|cpu| is_cpu_online(sysfs_cpu_root, *cpu))
        .collect()
}

const TRACEFS_ROOTS: [&str; 2] = ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];

/// Finds the first mounted tracefs by looking for its `events` directory.
pub fn find_tracefs_root() -> Option<PathBuf> {
    TRACEFS_ROOTS
        .iter()
        .map(PathBuf::from)
        .find(|root| root.join("events").is_dir())
}

/// Reads the numeric id of `group:name` from tracefs. Returns 0 if it doesn't exist, 0 is never
/// a valid tracepoint id.
pub fn read_tracepoint_id(tracefs_root: &Path, group: &str, name: &str) -> u32 {
    let path = tracefs_root.join("events").join(group).join(name).join("id");
    fs::read_to_string(path)
        .ok()
        .and_then(|id| id.trim().parse().ok())
        .unwrap_or(0)
}
