//! Acquisition of the `/proc/<pid>/{maps,mem}` descriptors userspace unwinding needs.

use std::fs::File;
use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result};
use tracing::debug;

/// Open descriptors for one process, handed to the unwinder.
#[derive(Debug)]
pub struct ProcDescriptors {
    pub maps: File,
    pub mem: File,
}

/// Receives descriptors once a lookup completes. Lookups that fail never call back, the
/// requester's timeout covers them.
pub type ProcDescriptorCallback = Box<dyn FnMut(i32, u32, ProcDescriptors) + Send>;

pub trait ProcDescriptorGetter: Send {
    /// Starts a lookup for `pid`.
    fn get_descriptors_for_pid(&mut self, pid: i32);

    /// Whether requests should be held back for a moment after a process is first seen.
    fn requires_delayed_request(&self) -> bool {
        false
    }
}

/// Opens the descriptors directly, which needs the privileges to read another process' memory.
pub struct DirectDescriptorGetter {
    procfs_root: String,
    callback: ProcDescriptorCallback,
}

impl DirectDescriptorGetter {
    pub fn new(callback: ProcDescriptorCallback) -> Self {
        Self::with_procfs_root("/proc", callback)
    }

    pub fn with_procfs_root(procfs_root: &str, callback: ProcDescriptorCallback) -> Self {
        DirectDescriptorGetter {
            procfs_root: procfs_root.to_string(),
            callback,
        }
    }

    fn open_descriptors(&self, pid: i32) -> Result<(u32, ProcDescriptors)> {
        let dir = format!("{}/{}", self.procfs_root, pid);
        let uid = std::fs::metadata(&dir)
            .with_context(|| format!("Failed to stat {dir}"))?
            .uid();
        let maps = File::open(format!("{dir}/maps"))
            .with_context(|| format!("Failed to open {dir}/maps"))?;
        let mem =
            File::open(format!("{dir}/mem")).with_context(|| format!("Failed to open {dir}/mem"))?;
        Ok((uid, ProcDescriptors { maps, mem }))
    }
}

impl ProcDescriptorGetter for DirectDescriptorGetter {
    fn get_descriptors_for_pid(&mut self, pid: i32) {
        match self.open_descriptors(pid) {
            Ok((uid, fds)) => (self.callback)(pid, uid, fds),
            Err(e) => debug!("Descriptor lookup for pid {pid} failed: {e:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_direct_getter_fake_procfs() {
        let dir = tempfile::tempdir().unwrap();
        let pid_dir = dir.path().join("42");
        std::fs::create_dir(&pid_dir).unwrap();
        std::fs::write(pid_dir.join("maps"), "").unwrap();
        std::fs::write(pid_dir.join("mem"), "").unwrap();

        let (tx, rx) = channel();
        let mut getter = DirectDescriptorGetter::with_procfs_root(
            dir.path().to_str().unwrap(),
            Box::new(move |pid, _uid, _fds| tx.send(pid).unwrap()),
        );
        getter.get_descriptors_for_pid(42);
        getter.get_descriptors_for_pid(43);
        assert_eq!(rx.try_recv(), Ok(42));
        assert!(rx.try_recv().is_err());
        assert!(!getter.requires_delayed_request());
    }

    #[test]
    fn test_direct_getter_self() {
        let (tx, rx) = channel();
        let mut getter = DirectDescriptorGetter::new(Box::new(move |pid, uid, fds| {
            tx.send((pid, uid, fds.maps.metadata().is_ok())).unwrap()
        }));
        let me = std::process::id() as i32;
        getter.get_descriptors_for_pid(me);
        let (pid, _uid, maps_ok) = rx.try_recv().unwrap();
        assert_eq!(pid, me);
        assert!(maps_ok);
    }
}
