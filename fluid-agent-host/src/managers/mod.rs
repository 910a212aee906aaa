//! Local resource managers
//!
//! Narrow contracts the command handlers drive. Each Linux implementation is a
//! thin wrapper over system tools:
//! - `qemu`: microVM processes (pidfile, SIGTERM/SIGKILL)
//! - `network`: tap devices, bridge resolution, IP discovery
//! - `overlay`: copy-on-write qcow2 disks
//! - `image`: base image directory
//! - `sourcevm`: libvirt source VMs reached over SSH

pub mod image;
pub mod network;
pub mod overlay;
pub mod qemu;
pub mod sourcevm;

use crate::config::AgentConfig;
use async_trait::async_trait;
use fluid_protocol::{BridgeInfo, SourceCommandResult, SourceVmInfo, SourceVmPrepared, SourceVmValidation};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Invalid(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

/// Runtime view of a sandbox microVM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInstance {
    pub sandbox_id: String,
    pub name: String,
    pub pid: u32,
    pub state: String,
    pub overlay_path: PathBuf,
    pub tap_device: String,
    pub mac_address: String,
    pub bridge: String,
    pub vcpus: u32,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub sandbox_id: String,
    pub name: String,
    pub overlay_path: PathBuf,
    pub kernel_path: PathBuf,
    pub tap_device: String,
    pub mac_address: String,
    pub bridge: String,
    pub vcpus: u32,
    pub memory_mb: u64,
}

#[async_trait]
pub trait VmManager: Send + Sync {
    async fn launch(&self, spec: LaunchSpec) -> ManagerResult<VmInstance>;
    async fn destroy(&self, sandbox_id: &str) -> ManagerResult<()>;
    async fn stop(&self, sandbox_id: &str, force: bool) -> ManagerResult<()>;
    fn get(&self, sandbox_id: &str) -> ManagerResult<VmInstance>;
    fn list(&self) -> Vec<VmInstance>;
}

#[async_trait]
pub trait NetworkManager: Send + Sync {
    async fn create_tap(&self, tap: &str, bridge: &str) -> ManagerResult<()>;
    async fn destroy_tap(&self, tap: &str) -> ManagerResult<()>;
    /// Bridge for a new sandbox: explicit network first, then the source VM's.
    async fn resolve_bridge(&self, source_vm: &str, requested_network: &str) -> ManagerResult<String>;
    async fn discover_ip(&self, mac: &str, bridge: &str, timeout: Duration) -> ManagerResult<String>;
    /// Bridges announced at registration.
    fn list_bridges(&self) -> Vec<BridgeInfo> {
        Vec::new()
    }
}

pub trait ImageStore: Send + Sync {
    fn image_path(&self, name: &str) -> ManagerResult<PathBuf>;
    fn kernel_path(&self, name: &str) -> ManagerResult<PathBuf>;
    fn list_names(&self) -> Vec<String>;
}

#[async_trait]
pub trait SourceVmManager: Send + Sync {
    async fn prepare_source_vm(&self, vm: &str, ssh_user: &str, ssh_key_path: &str) -> ManagerResult<SourceVmPrepared>;
    async fn run_source_command(&self, vm: &str, command: &str, timeout: Duration) -> ManagerResult<SourceCommandResult>;
    /// Base64 of the file content.
    async fn read_source_file(&self, vm: &str, path: &str) -> ManagerResult<String>;
    async fn list_vms(&self) -> ManagerResult<Vec<SourceVmInfo>>;
    async fn validate_source_vm(&self, vm: &str) -> ManagerResult<SourceVmValidation>;
}

#[async_trait]
pub trait OverlayManager: Send + Sync {
    async fn create_overlay(&self, sandbox_id: &str, base_image: &Path) -> ManagerResult<PathBuf>;
    async fn remove_overlay(&self, sandbox_id: &str) -> ManagerResult<()>;
    /// Internal qcow2 snapshot; returns the snapshot id.
    async fn snapshot(&self, sandbox_id: &str, name: &str) -> ManagerResult<String>;
}

/// Managers available on this host. A missing one turns the commands that
/// need it into error reports.
#[derive(Clone, Default)]
pub struct Managers {
    pub vms: Option<Arc<dyn VmManager>>,
    pub network: Option<Arc<dyn NetworkManager>>,
    pub images: Option<Arc<dyn ImageStore>>,
    pub source_vms: Option<Arc<dyn SourceVmManager>>,
    pub overlays: Option<Arc<dyn OverlayManager>>,
}

impl Managers {
    /// Linux managers from config. One that cannot start is left out with a
    /// warning and its commands answer with an error report.
    pub fn from_config(config: &AgentConfig) -> Self {
        let vms = match qemu::QemuVmManager::new(&config.microvm.qemu_binary, &config.microvm.work_dir) {
            Ok(mgr) => {
                match mgr.recover() {
                    Ok(n) if n > 0 => info!("recovered {} sandbox VMs", n),
                    Ok(_) => {}
                    Err(e) => warn!("VM recovery failed: {}", e),
                }
                Some(Arc::new(mgr) as Arc<dyn VmManager>)
            }
            Err(e) => {
                warn!("microVM manager unavailable: {}", e);
                None
            }
        };
        let images = match image::DirImageStore::new(&config.image.base_dir) {
            Ok(store) => Some(Arc::new(store) as Arc<dyn ImageStore>),
            Err(e) => {
                warn!("image store unavailable: {}", e);
                None
            }
        };

        Self {
            vms,
            network: Some(Arc::new(network::LinuxNetworkManager::new(&config.network, &config.libvirt.uri))),
            images,
            source_vms: Some(Arc::new(sourcevm::LibvirtSourceVmManager::new(&config.libvirt.uri, config.ssh.clone()))),
            overlays: Some(Arc::new(overlay::QcowOverlayManager::new(&config.microvm.work_dir))),
        }
    }
}

/// QEMU locally administered prefix + 3 random bytes
pub fn generate_mac() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

/// `fl-` + first 9 chars of the id (without `SBX-`), lowercased; fits IFNAMSIZ.
pub fn tap_name(sandbox_id: &str) -> String {
    let short: String = sandbox_id
        .strip_prefix("SBX-")
        .unwrap_or(sandbox_id)
        .to_lowercase()
        .chars()
        .take(9)
        .collect();
    format!("fl-{short}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_mac() {
        let mac = generate_mac();
        assert_eq!(mac.len(), 17);
        assert!(mac.starts_with("52:54:00:"));
        assert_ne!(mac, generate_mac());
    }

    #[test]
    fn test_tap_name() {
        assert_eq!(tap_name("SBX-0A1B2C3D"), "fl-0a1b2c3d");
        assert_eq!(tap_name("SBX-ABCDEFGHIJKL"), "fl-abcdefghi");
        assert_eq!(tap_name("custom"), "fl-custom");
        assert!(tap_name("SBX-ABCDEFGHIJKLMNOP").len() <= 15);
    }
}
