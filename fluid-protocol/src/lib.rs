//! Fluid host protocol
//!
//! Messages multiplexed over the single WebSocket that links a host agent to
//! the kernel. Every frame is a JSON envelope:
//!
//! ```json
//! { "request_id": "…", "payload": { "type": "create_sandbox", "sandbox_id": "SBX-…", … } }
//! ```
//!
//! - `ControlMessage`: kernel → host commands (plus the registration ack)
//! - `HostMessage`: host → kernel responses, registration and heartbeats
//!
//! A response always carries the `request_id` of the command it answers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default path of the host WebSocket endpoint on the kernel.
pub const CONNECT_PATH: &str = "/v1/hosts/connect";

/// Wire state strings reported by hosts.
pub mod states {
    pub const CREATING: &str = "CREATING";
    pub const RUNNING: &str = "RUNNING";
    pub const STOPPED: &str = "STOPPED";
    pub const ERROR: &str = "ERROR";
}

/// Generates a fresh request identifier.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// `prefix` followed by 8 uppercase hex characters, e.g. `SBX-0A1B2C3D`.
pub fn generate_id(prefix: &str) -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", raw[..8].to_ascii_uppercase())
}

// ============ KERNEL → HOST ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub request_id: String,
    pub payload: ControlPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlPayload {
    RegistrationAck(RegistrationAck),
    CreateSandbox(CreateSandbox),
    DestroySandbox(SandboxRef),
    StartSandbox(SandboxRef),
    StopSandbox(StopSandbox),
    RunCommand(RunCommand),
    CreateSnapshot(CreateSnapshot),
    PrepareSourceVm(PrepareSourceVm),
    RunSourceCommand(RunSourceCommand),
    ReadSourceFile(ReadSourceFile),
    ListSourceVms,
    ValidateSourceVm(SourceVmRef),
    /// Any command type this build does not know about.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrationAck {
    pub accepted: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub assigned_host_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateSandbox {
    pub sandbox_id: String,
    pub base_image: String,
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub agent_id: String,
    /// Explicit network or bridge requested by the caller (may be empty).
    #[serde(default)]
    pub network: String,
    #[serde(default)]
    pub source_vm: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxRef {
    pub sandbox_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopSandbox {
    pub sandbox_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunCommand {
    pub sandbox_id: String,
    pub command: String,
    /// 0 means "use the host default".
    #[serde(default)]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateSnapshot {
    pub sandbox_id: String,
    pub snapshot_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrepareSourceVm {
    pub source_vm: String,
    #[serde(default)]
    pub ssh_user: String,
    #[serde(default)]
    pub ssh_key_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSourceCommand {
    pub source_vm: String,
    pub command: String,
    #[serde(default)]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReadSourceFile {
    pub source_vm: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceVmRef {
    pub source_vm: String,
}

// ============ HOST → KERNEL ============

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMessage {
    #[serde(default)]
    pub request_id: String,
    pub payload: HostPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostPayload {
    Registration(Registration),
    Heartbeat(Heartbeat),
    SandboxCreated(SandboxCreated),
    SandboxDestroyed(SandboxRef),
    SandboxStarted(SandboxStarted),
    SandboxStopped(SandboxStopped),
    CommandResult(CommandResult),
    SnapshotCreated(SnapshotCreated),
    SourceVmPrepared(SourceVmPrepared),
    SourceCommandResult(SourceCommandResult),
    SourceFileResult(SourceFileResult),
    SourceVmsList(SourceVmsList),
    SourceVmValidation(SourceVmValidation),
    ErrorReport(ErrorReport),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceVmInfo {
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub prepared: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeInfo {
    pub name: String,
    #[serde(default)]
    pub subnet: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub host_id: String,
    pub hostname: String,
    #[serde(default)]
    pub version: String,
    pub total_cpus: u32,
    pub total_memory_mb: u64,
    #[serde(default)]
    pub total_disk_mb: u64,
    pub available_cpus: u32,
    pub available_memory_mb: u64,
    #[serde(default)]
    pub available_disk_mb: u64,
    #[serde(default)]
    pub base_images: Vec<String>,
    #[serde(default)]
    pub source_vms: Vec<SourceVmInfo>,
    #[serde(default)]
    pub bridges: Vec<BridgeInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub available_cpus: u32,
    pub available_memory_mb: u64,
    #[serde(default)]
    pub available_disk_mb: u64,
    #[serde(default)]
    pub active_sandboxes: u32,
    #[serde(default)]
    pub source_vm_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxCreated {
    pub sandbox_id: String,
    pub name: String,
    pub state: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub bridge: String,
    #[serde(default)]
    pub tap_device: String,
    #[serde(default)]
    pub pid: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxStarted {
    pub sandbox_id: String,
    pub state: String,
    #[serde(default)]
    pub ip_address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxStopped {
    pub sandbox_id: String,
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub sandbox_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotCreated {
    pub sandbox_id: String,
    pub snapshot_id: String,
    pub snapshot_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceVmPrepared {
    pub source_vm: String,
    #[serde(default)]
    pub ip_address: String,
    pub prepared: bool,
    #[serde(default)]
    pub user_created: bool,
    #[serde(default)]
    pub shell_installed: bool,
    #[serde(default)]
    pub ca_key_installed: bool,
    #[serde(default)]
    pub sshd_configured: bool,
    #[serde(default)]
    pub principals_created: bool,
    #[serde(default)]
    pub sshd_restarted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCommandResult {
    pub source_vm: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceFileResult {
    pub source_vm: String,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceVmsList {
    pub vms: Vec<SourceVmInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceVmValidation {
    pub source_vm: String,
    pub valid: bool,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub has_network: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: String,
    #[serde(default)]
    pub sandbox_id: String,
    #[serde(default)]
    pub context: String,
}

// ============ HELPERS ============

impl ControlMessage {
    /// Builds a command with a freshly generated request id.
    pub fn new(payload: ControlPayload) -> Self {
        Self { request_id: new_request_id(), payload }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl ControlPayload {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlPayload::RegistrationAck(_) => "registration_ack",
            ControlPayload::CreateSandbox(_) => "create_sandbox",
            ControlPayload::DestroySandbox(_) => "destroy_sandbox",
            ControlPayload::StartSandbox(_) => "start_sandbox",
            ControlPayload::StopSandbox(_) => "stop_sandbox",
            ControlPayload::RunCommand(_) => "run_command",
            ControlPayload::CreateSnapshot(_) => "create_snapshot",
            ControlPayload::PrepareSourceVm(_) => "prepare_source_vm",
            ControlPayload::RunSourceCommand(_) => "run_source_command",
            ControlPayload::ReadSourceFile(_) => "read_source_file",
            ControlPayload::ListSourceVms => "list_source_vms",
            ControlPayload::ValidateSourceVm(_) => "validate_source_vm",
            ControlPayload::Unknown => "unknown",
        }
    }
}

impl HostMessage {
    pub fn new(request_id: impl Into<String>, payload: HostPayload) -> Self {
        Self { request_id: request_id.into(), payload }
    }

    /// Builds an `ErrorReport` answering `request_id`.
    pub fn error_report(
        request_id: impl Into<String>,
        sandbox_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(
            request_id,
            HostPayload::ErrorReport(ErrorReport {
                error: error.into(),
                sandbox_id: sandbox_id.into(),
                context: String::new(),
            }),
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

impl HostPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            HostPayload::Registration(_) => "registration",
            HostPayload::Heartbeat(_) => "heartbeat",
            HostPayload::SandboxCreated(_) => "sandbox_created",
            HostPayload::SandboxDestroyed(_) => "sandbox_destroyed",
            HostPayload::SandboxStarted(_) => "sandbox_started",
            HostPayload::SandboxStopped(_) => "sandbox_stopped",
            HostPayload::CommandResult(_) => "command_result",
            HostPayload::SnapshotCreated(_) => "snapshot_created",
            HostPayload::SourceVmPrepared(_) => "source_vm_prepared",
            HostPayload::SourceCommandResult(_) => "source_command_result",
            HostPayload::SourceFileResult(_) => "source_file_result",
            HostPayload::SourceVmsList(_) => "source_vms_list",
            HostPayload::SourceVmValidation(_) => "source_vm_validation",
            HostPayload::ErrorReport(_) => "error_report",
            HostPayload::Unknown => "unknown",
        }
    }
}

/// Best-effort extraction of the request id from a frame that failed to
/// decode, so the sender still gets a terminal answer.
pub fn peek_request_id(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    value
        .get("request_id")
        .and_then(|v| v.as_str())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_wire_shape() {
        let msg = ControlMessage {
            request_id: "req-1".into(),
            payload: ControlPayload::DestroySandbox(SandboxRef { sandbox_id: "SBX-0A1B2C3D".into() }),
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["payload"]["type"], "destroy_sandbox");
        assert_eq!(value["payload"]["sandbox_id"], "SBX-0A1B2C3D");
    }

    #[test]
    fn test_unit_variant_and_unknown_type() {
        let list = ControlMessage::from_json(r#"{"request_id":"r","payload":{"type":"list_source_vms"}}"#).unwrap();
        assert_eq!(list.payload, ControlPayload::ListSourceVms);

        let unknown = ControlMessage::from_json(r#"{"request_id":"r2","payload":{"type":"migrate_sandbox","x":1}}"#).unwrap();
        assert_eq!(unknown.payload, ControlPayload::Unknown);
        assert_eq!(unknown.request_id, "r2");
    }

    #[test]
    fn test_heartbeat_without_request_id() {
        let hb = HostMessage::from_json(
            r#"{"payload":{"type":"heartbeat","available_cpus":4,"available_memory_mb":8192}}"#,
        )
        .unwrap();
        assert!(hb.request_id.is_empty());
        match hb.payload {
            HostPayload::Heartbeat(h) => {
                assert_eq!(h.available_cpus, 4);
                assert_eq!(h.active_sandboxes, 0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_error_report_helper() {
        let msg = HostMessage::error_report("req-9", "SBX-1", "boom");
        assert_eq!(msg.payload.kind(), "error_report");
        let text = msg.to_json().unwrap();
        assert!(text.contains("\"error\":\"boom\""));
    }

    #[test]
    fn test_generate_id_shape() {
        let id = generate_id("SBX-");
        assert_eq!(id.len(), 12);
        assert!(id.starts_with("SBX-"));
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
        assert_ne!(id, generate_id("SBX-"));
    }

    #[test]
    fn test_peek_request_id() {
        assert_eq!(peek_request_id(r#"{"request_id":"abc","payload":42}"#), Some("abc".into()));
        assert_eq!(peek_request_id(r#"{"request_id":""}"#), None);
        assert_eq!(peek_request_id("not json"), None);
    }
}
