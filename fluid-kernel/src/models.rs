use fluid_protocol::{BridgeInfo, Registration, SourceVmInfo};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxState {
    Pending,
    Creating,
    Running,
    Stopped,
    Destroyed,
    Error,
}

impl SandboxState {
    /// Traduit l'état rapporté par l'hôte (inconnu => ERROR)
    pub fn from_wire(state: &str) -> Self {
        match state.trim().to_ascii_uppercase().as_str() {
            "PENDING" => SandboxState::Pending,
            "CREATING" => SandboxState::Creating,
            "RUNNING" => SandboxState::Running,
            "STOPPED" => SandboxState::Stopped,
            "DESTROYED" => SandboxState::Destroyed,
            _ => SandboxState::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Pending => "PENDING",
            SandboxState::Creating => "CREATING",
            SandboxState::Running => "RUNNING",
            SandboxState::Stopped => "STOPPED",
            SandboxState::Destroyed => "DESTROYED",
            SandboxState::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub org_id: String,
    pub host_id: String,
    pub name: String,
    pub agent_id: String,
    pub base_image: String,
    pub bridge: String,
    pub tap_device: String,
    pub mac_address: String,
    pub ip_address: String,
    pub state: SandboxState,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub ttl_seconds: u64,
    pub source_vm: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub sandbox_id: String,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: OffsetDateTime,
}

// Snapshot durable d'un hôte (mis à jour à l'enregistrement et à chaque heartbeat)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub org_id: String,
    pub hostname: String,
    pub version: String,
    pub total_cpus: u32,
    pub total_memory_mb: u64,
    pub total_disk_mb: u64,
    pub available_cpus: u32,
    pub available_memory_mb: u64,
    pub available_disk_mb: u64,
    pub base_images: Vec<String>,
    pub source_vms: Vec<SourceVmInfo>,
    pub bridges: Vec<BridgeInfo>,
    pub status: HostStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_heartbeat: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Host {
    pub fn from_registration(host_id: &str, org_id: &str, reg: &Registration) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: host_id.to_string(),
            org_id: org_id.to_string(),
            hostname: reg.hostname.clone(),
            version: reg.version.clone(),
            total_cpus: reg.total_cpus,
            total_memory_mb: reg.total_memory_mb,
            total_disk_mb: reg.total_disk_mb,
            available_cpus: reg.available_cpus,
            available_memory_mb: reg.available_memory_mb,
            available_disk_mb: reg.available_disk_mb,
            base_images: reg.base_images.clone(),
            source_vms: reg.source_vms.clone(),
            bridges: reg.bridges.clone(),
            status: HostStatus::Online,
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============ VUES RETOURNÉES PAR L'ORCHESTRATEUR ============

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostInfo {
    pub host_id: String,
    pub hostname: String,
    pub status: HostStatus,
    pub active_sandboxes: usize,
    pub available_cpus: u32,
    pub available_memory_mb: u64,
    pub available_disk_mb: u64,
    pub base_images: Vec<String>,
    pub last_heartbeat: String,   // RFC3339
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmInfo {
    pub name: String,
    pub state: String,
    pub ip_address: String,
    pub prepared: bool,
    pub host_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub sandbox_id: String,
    pub snapshot_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceCommandOutput {
    pub source_vm: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceFile {
    pub source_vm: String,
    pub path: String,
    pub content: String,
}
