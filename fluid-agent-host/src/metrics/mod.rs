//! Host capacity collection
//!
//! Provides what the kernel needs for placement:
//! - CPU count, minus vCPUs already handed to running sandboxes
//! - Total and available memory
//! - Disk space of the filesystem holding the sandbox work dir

use std::path::Path;
use sysinfo::{Disks, System};
use tracing::debug;

const MB: u64 = 1024 * 1024;

/// Capacity snapshot (sizes in MB)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostCapacity {
    pub total_cpus: u32,
    pub available_cpus: u32,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub total_disk_mb: u64,
    pub available_disk_mb: u64,
}

impl HostCapacity {
    /// Collect capacity; `allocated_vcpus` is the sum over running sandboxes.
    pub fn collect(disk_path: &Path, allocated_vcpus: u32) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let total_cpus = sys.cpus().len() as u32;
        let (total_disk_mb, available_disk_mb) = disk_space(disk_path);

        let capacity = HostCapacity {
            total_cpus,
            available_cpus: total_cpus.saturating_sub(allocated_vcpus),
            total_memory_mb: sys.total_memory() / MB,
            available_memory_mb: sys.available_memory() / MB,
            total_disk_mb,
            available_disk_mb,
        };
        debug!("capacity: {:?}", capacity);
        capacity
    }
}

/// (total, available) MB of the disk whose mount point is the longest
/// prefix of `path`. Zero when nothing matches.
fn disk_space(path: &Path) -> (u64, u64) {
    let disks = Disks::new_with_refreshed_list();
    let mounts = disks
        .list()
        .iter()
        .map(|d| (d.mount_point().to_path_buf(), d.total_space(), d.available_space()));
    best_mount(path, mounts)
}

fn best_mount(path: &Path, mounts: impl Iterator<Item = (std::path::PathBuf, u64, u64)>) -> (u64, u64) {
    mounts
        .filter(|(mount, _, _)| path.starts_with(mount))
        .max_by_key(|(mount, _, _)| mount.components().count())
        .map(|(_, total, available)| (total / MB, available / MB))
        .unwrap_or((0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_collect_reports_machine() {
        let capacity = HostCapacity::collect(Path::new("/"), 0);
        assert!(capacity.total_cpus > 0);
        assert_eq!(capacity.available_cpus, capacity.total_cpus);
        assert!(capacity.total_memory_mb >= capacity.available_memory_mb);

        let busy = HostCapacity::collect(Path::new("/"), u32::MAX);
        assert_eq!(busy.available_cpus, 0);
    }

    #[test]
    fn test_best_mount_prefers_deepest() {
        let mounts = vec![
            (PathBuf::from("/"), 100 * MB, 50 * MB),
            (PathBuf::from("/var/lib"), 400 * MB, 300 * MB),
            (PathBuf::from("/var/lib/other"), 9 * MB, 9 * MB),
        ];
        assert_eq!(best_mount(Path::new("/var/lib/fluid/sandboxes"), mounts.clone().into_iter()), (400, 300));
        assert_eq!(best_mount(Path::new("/home"), mounts.into_iter()), (100, 50));
        assert_eq!(best_mount(Path::new("relative"), std::iter::empty()), (0, 0));
    }
}
