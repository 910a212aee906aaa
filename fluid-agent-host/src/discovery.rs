//! Host discovery: what this machine announces to the kernel
//!
//! This module handles:
//! - Hostname, used as host id until the kernel assigns one
//! - The `Registration` frame (capacity, base images, source VMs, bridges)
//! - The periodic `Heartbeat` frame (capacity and sandbox counts)

use crate::managers::Managers;
use crate::metrics::HostCapacity;
use crate::state::LocalState;
use fluid_protocol::{states, Heartbeat, Registration, SourceVmInfo};
use std::path::Path;
use tracing::{debug, warn};

pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

fn allocated_vcpus(managers: &Managers) -> (u32, u32) {
    let Some(vms) = &managers.vms else { return (0, 0) };
    let running: Vec<_> = vms.list().into_iter().filter(|vm| vm.state == states::RUNNING).collect();
    (running.len() as u32, running.iter().map(|vm| vm.vcpus).sum())
}

async fn source_vms(managers: &Managers) -> Vec<SourceVmInfo> {
    let Some(src) = &managers.source_vms else { return Vec::new() };
    match src.list_vms().await {
        Ok(vms) => vms,
        Err(e) => {
            warn!("failed to list source VMs: {}", e);
            Vec::new()
        }
    }
}

pub async fn build_registration(host_id: &str, managers: &Managers, work_dir: &Path) -> Registration {
    let (_, vcpus) = allocated_vcpus(managers);
    let capacity = HostCapacity::collect(work_dir, vcpus);
    let registration = Registration {
        host_id: host_id.to_string(),
        hostname: hostname(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        total_cpus: capacity.total_cpus,
        total_memory_mb: capacity.total_memory_mb,
        total_disk_mb: capacity.total_disk_mb,
        available_cpus: capacity.available_cpus,
        available_memory_mb: capacity.available_memory_mb,
        available_disk_mb: capacity.available_disk_mb,
        base_images: managers.images.as_ref().map(|i| i.list_names()).unwrap_or_default(),
        source_vms: source_vms(managers).await,
        bridges: managers.network.as_ref().map(|n| n.list_bridges()).unwrap_or_default(),
    };
    debug!(
        "registration: {} images, {} source VMs, {} bridges",
        registration.base_images.len(),
        registration.source_vms.len(),
        registration.bridges.len()
    );
    registration
}

pub async fn build_heartbeat(managers: &Managers, state: &LocalState, work_dir: &Path) -> Heartbeat {
    let (running, vcpus) = allocated_vcpus(managers);
    let capacity = HostCapacity::collect(work_dir, vcpus);
    let active_sandboxes = if managers.vms.is_some() { running } else { state.count() as u32 };
    Heartbeat {
        available_cpus: capacity.available_cpus,
        available_memory_mb: capacity.available_memory_mb,
        available_disk_mb: capacity.available_disk_mb,
        active_sandboxes,
        source_vm_count: source_vms(managers).await.len() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registration_without_managers() {
        let reg = build_registration("host-1", &Managers::default(), Path::new("/")).await;
        assert_eq!(reg.host_id, "host-1");
        assert_eq!(reg.hostname, hostname());
        assert!(reg.total_cpus > 0);
        assert!(reg.base_images.is_empty());
        assert!(reg.source_vms.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_counts_local_state() {
        let state = LocalState::in_memory();
        state.put(crate::state::sample("SBX-1"));
        state.put(crate::state::sample("SBX-2"));
        let hb = build_heartbeat(&Managers::default(), &state, Path::new("/")).await;
        assert_eq!(hb.active_sandboxes, 2);
        assert_eq!(hb.source_vm_count, 0);
    }
}
