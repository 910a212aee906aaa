/**
 * ORCHESTRATOR - Cycle de vie des sandboxes au-dessus du correlator
 *
 * RÔLE :
 * Point d'entrée métier : crée, démarre, arrête, détruit les sandboxes et
 * relaie les opérations sur les VMs source. Chaque appel est filtré par org.
 *
 * FONCTIONNEMENT :
 * - Placement (placement.rs) sur les hôtes connectés de l'org
 * - Enregistrement PENDING optimiste avant l'envoi, confirmé par la réponse
 * - send_and_wait avec un timeout propre à chaque opération
 * - Échec de persistance après succès hôte => destroy compensatoire
 *
 * ERREURS : NotFound, HostUnavailable et Timeout (réessayables),
 * ExecutionFailed (ErrorReport ou réponse inattendue), InvalidArgument,
 * InvalidState, Store.
 */

pub mod placement;

use crate::correlator::{CorrelatorError, SharedCorrelator};
use crate::models::{
    Command, HostInfo, HostStatus, Sandbox, SandboxState, SnapshotInfo, SourceCommandOutput, SourceFile, VmInfo,
};
use crate::mqtt::{EventBus, KernelEvent};
use crate::registry::{ConnectedHost, SharedHostRegistry};
use crate::store::{SharedStore, StoreError};
use fluid_protocol::{
    generate_id, ControlMessage, ControlPayload, CreateSandbox, CreateSnapshot, HostMessage, HostPayload,
    PrepareSourceVm, ReadSourceFile, RunCommand, RunSourceCommand, SandboxRef, SourceVmPrepared, SourceVmRef,
    SourceVmValidation, StopSandbox,
};
use futures::StreamExt;
use placement::{select_host, select_host_for_source_vm, PlacementError};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{error, info, warn};

pub const TIMEOUT_CREATE_SANDBOX: Duration = Duration::from_secs(5 * 60);
pub const TIMEOUT_DESTROY_SANDBOX: Duration = Duration::from_secs(2 * 60);
pub const TIMEOUT_START_STOP: Duration = Duration::from_secs(2 * 60);
pub const TIMEOUT_SNAPSHOT: Duration = Duration::from_secs(5 * 60);
pub const TIMEOUT_LIST_SOURCES: Duration = Duration::from_secs(30);
pub const TIMEOUT_VALIDATE_VM: Duration = Duration::from_secs(30);
pub const TIMEOUT_PREPARE_VM: Duration = Duration::from_secs(5 * 60);
pub const TIMEOUT_READ_FILE: Duration = Duration::from_secs(30);
pub const COMMAND_TIMEOUT_BUFFER: Duration = Duration::from_secs(30);

pub const DEFAULT_VCPUS: u32 = 2;
pub const DEFAULT_MEMORY_MB: u64 = 2048;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SOURCE_COMMAND_TIMEOUT_SECS: u64 = 30;
const LIST_VMS_CONCURRENCY: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("host unavailable: {0}")]
    HostUnavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("host error: {0}")]
    ExecutionFailed(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("store error: {0}")]
    Store(StoreError),
}

impl OrchestratorError {
    /// HostUnavailable et Timeout peuvent réussir sur un nouvel essai
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestratorError::HostUnavailable(_) | OrchestratorError::Timeout(_))
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => OrchestratorError::NotFound(what),
            other => OrchestratorError::Store(other),
        }
    }
}

impl From<CorrelatorError> for OrchestratorError {
    fn from(e: CorrelatorError) -> Self {
        match e {
            CorrelatorError::HostNotConnected(_) | CorrelatorError::Disconnected { .. } => {
                OrchestratorError::HostUnavailable(e.to_string())
            }
            CorrelatorError::Timeout { .. } => OrchestratorError::Timeout(e.to_string()),
            CorrelatorError::MissingRequestId | CorrelatorError::DuplicateRequest(_) => {
                OrchestratorError::InvalidArgument(e.to_string())
            }
        }
    }
}

impl From<PlacementError> for OrchestratorError {
    fn from(e: PlacementError) -> Self {
        OrchestratorError::HostUnavailable(e.to_string())
    }
}

/// ErrorReport => ExecutionFailed avec le message de l'hôte
fn unexpected(payload: HostPayload) -> OrchestratorError {
    match payload {
        HostPayload::ErrorReport(report) => OrchestratorError::ExecutionFailed(report.error),
        other => OrchestratorError::ExecutionFailed(format!("unexpected response type from host: {}", other.kind())),
    }
}

/// Délai d'attente côté kernel : timeout de la commande + marge, saturé
fn command_deadline(timeout_secs: u64) -> Duration {
    Duration::from_secs(timeout_secs).saturating_add(COMMAND_TIMEOUT_BUFFER)
}

/// Nom par défaut : "sbx-" + 8 premiers caractères de l'id
fn short_name(sandbox_id: &str) -> String {
    let short: String = sandbox_id.trim_start_matches("SBX-").chars().take(8).collect();
    format!("sbx-{short}")
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateSandboxRequest {
    pub org_id: String,
    pub agent_id: String,
    pub source_vm: String,
    /// Vide => source_vm
    pub base_image: String,
    pub name: String,
    pub vcpus: u32,
    pub memory_mb: u64,
    pub ttl_seconds: u64,
    pub network: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RunCommandRequest {
    pub command: String,
    pub timeout_seconds: u64,
    pub env: HashMap<String, String>,
}

pub struct Orchestrator {
    registry: SharedHostRegistry,
    correlator: SharedCorrelator,
    store: SharedStore,
    events: EventBus,
    default_ttl: Duration,
    heartbeat_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        registry: SharedHostRegistry,
        correlator: SharedCorrelator,
        store: SharedStore,
        events: EventBus,
        default_ttl: Duration,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self { registry, correlator, store, events, default_ttl, heartbeat_timeout }
    }

    async fn call(&self, host_id: &str, payload: ControlPayload, timeout: Duration) -> Result<HostMessage, OrchestratorError> {
        Ok(self.correlator.send_and_wait(host_id, ControlMessage::new(payload), timeout).await?)
    }

    // ============ SANDBOXES ============

    pub async fn create_sandbox(&self, req: CreateSandboxRequest) -> Result<Sandbox, OrchestratorError> {
        if req.org_id.is_empty() {
            return Err(OrchestratorError::InvalidArgument("org_id is required".into()));
        }
        let base_image = if req.base_image.is_empty() { req.source_vm.clone() } else { req.base_image.clone() };
        if base_image.is_empty() {
            return Err(OrchestratorError::InvalidArgument("source_vm or base_image is required".into()));
        }

        let sandbox_id = generate_id("SBX-");
        let vcpus = if req.vcpus == 0 { DEFAULT_VCPUS } else { req.vcpus };
        let memory_mb = if req.memory_mb == 0 { DEFAULT_MEMORY_MB } else { req.memory_mb };
        let ttl_seconds = if req.ttl_seconds == 0 { self.default_ttl.as_secs() } else { req.ttl_seconds };
        let name = if req.name.is_empty() { short_name(&sandbox_id) } else { req.name.clone() };

        let hosts = self.registry.list_by_org(&req.org_id);
        let host = match select_host(&hosts, &base_image, self.heartbeat_timeout, vcpus, memory_mb) {
            Ok(h) => h,
            Err(image_err) if !req.source_vm.is_empty() => {
                select_host_for_source_vm(&hosts, &req.source_vm, self.heartbeat_timeout, vcpus, memory_mb)
                    .map_err(|fallback| {
                        OrchestratorError::HostUnavailable(format!(
                            "image match: {image_err}; source VM fallback: {fallback}"
                        ))
                    })?
            }
            Err(e) => return Err(e.into()),
        };

        let now = OffsetDateTime::now_utc();
        let mut sandbox = Sandbox {
            id: sandbox_id.clone(),
            org_id: req.org_id.clone(),
            host_id: host.host_id.clone(),
            name: name.clone(),
            agent_id: req.agent_id.clone(),
            base_image: base_image.clone(),
            bridge: String::new(),
            tap_device: String::new(),
            mac_address: String::new(),
            ip_address: String::new(),
            state: SandboxState::Pending,
            vcpus,
            memory_mb,
            ttl_seconds,
            source_vm: req.source_vm.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.store.create_sandbox(&sandbox)?;

        info!(
            "[orchestrator] creating sandbox {} on host {} (org={}, image={})",
            sandbox_id, host.host_id, req.org_id, base_image
        );

        let payload = ControlPayload::CreateSandbox(CreateSandbox {
            sandbox_id: sandbox_id.clone(),
            base_image,
            name,
            vcpus,
            memory_mb,
            ttl_seconds,
            agent_id: req.agent_id.clone(),
            network: req.network.clone(),
            source_vm: req.source_vm.clone(),
        });

        let msg = ControlMessage::new(payload);
        let resp = match self.correlator.send_and_wait(&host.host_id, msg, TIMEOUT_CREATE_SANDBOX).await {
            Ok(resp) => resp,
            Err(e @ (CorrelatorError::Timeout { .. } | CorrelatorError::Disconnected { .. })) => {
                // l'hôte a peut-être reçu la commande : l'enregistrement PENDING reste destructible
                warn!("[orchestrator] create {} on host {} unresolved: {e}", sandbox_id, host.host_id);
                return Err(e.into());
            }
            Err(e) => {
                self.discard_pending(&sandbox);
                return Err(e.into());
            }
        };

        let created = match resp.payload {
            HostPayload::SandboxCreated(created) => created,
            other => {
                self.discard_pending(&sandbox);
                return Err(unexpected(other));
            }
        };

        sandbox.name = created.name;
        sandbox.bridge = created.bridge;
        sandbox.tap_device = created.tap_device;
        sandbox.mac_address = created.mac_address;
        sandbox.ip_address = created.ip_address;
        sandbox.state = SandboxState::from_wire(&created.state);

        if let Err(e) = self.store.update_sandbox(&sandbox) {
            warn!("[orchestrator] persist of {} failed, issuing compensating destroy: {e}", sandbox_id);
            self.compensating_destroy(&host, &sandbox_id).await;
            self.discard_pending(&sandbox);
            return Err(e.into());
        }

        self.events.publish(KernelEvent::SandboxCreated {
            sandbox_id: sandbox_id.clone(),
            org_id: sandbox.org_id.clone(),
            host_id: host.host_id.clone(),
        });
        info!("[orchestrator] sandbox {} created on host {} (ip={})", sandbox_id, host.host_id, sandbox.ip_address);
        Ok(sandbox)
    }

    fn discard_pending(&self, sandbox: &Sandbox) {
        if let Err(e) = self.store.delete_sandbox(&sandbox.id, &sandbox.org_id) {
            warn!("[orchestrator] failed to discard pending record {}: {e}", sandbox.id);
        }
    }

    async fn compensating_destroy(&self, host: &ConnectedHost, sandbox_id: &str) {
        let payload = ControlPayload::DestroySandbox(SandboxRef { sandbox_id: sandbox_id.to_string() });
        if let Err(e) = self.call(&host.host_id, payload, TIMEOUT_DESTROY_SANDBOX).await {
            error!("[orchestrator] compensating destroy of {} failed, VM orphaned on host {}: {e}", sandbox_id, host.host_id);
        }
    }

    pub fn get_sandbox(&self, org_id: &str, sandbox_id: &str) -> Result<Sandbox, OrchestratorError> {
        Ok(self.store.get_sandbox(sandbox_id, org_id)?)
    }

    pub fn list_sandboxes(&self, org_id: &str) -> Result<Vec<Sandbox>, OrchestratorError> {
        Ok(self.store.list_sandboxes(org_id)?)
    }

    pub async fn destroy_sandbox(&self, org_id: &str, sandbox_id: &str) -> Result<(), OrchestratorError> {
        let sandbox = self.store.get_sandbox(sandbox_id, org_id)?;

        let payload = ControlPayload::DestroySandbox(SandboxRef { sandbox_id: sandbox_id.to_string() });
        let resp = self.call(&sandbox.host_id, payload, TIMEOUT_DESTROY_SANDBOX).await?;
        if !matches!(resp.payload, HostPayload::SandboxDestroyed(_)) {
            return Err(unexpected(resp.payload));
        }

        self.store.delete_sandbox(sandbox_id, org_id)?;
        self.events.publish(KernelEvent::SandboxDestroyed {
            sandbox_id: sandbox_id.to_string(),
            org_id: org_id.to_string(),
            host_id: sandbox.host_id.clone(),
        });
        info!("[orchestrator] sandbox {} destroyed", sandbox_id);
        Ok(())
    }

    pub async fn run_command(
        &self,
        org_id: &str,
        sandbox_id: &str,
        req: RunCommandRequest,
    ) -> Result<Command, OrchestratorError> {
        if req.command.trim().is_empty() {
            return Err(OrchestratorError::InvalidArgument("command must not be empty".into()));
        }
        let sandbox = self.store.get_sandbox(sandbox_id, org_id)?;
        if sandbox.state == SandboxState::Destroyed {
            return Err(OrchestratorError::InvalidState("sandbox is destroyed".into()));
        }

        let timeout_secs = if req.timeout_seconds == 0 { DEFAULT_COMMAND_TIMEOUT_SECS } else { req.timeout_seconds };
        let payload = ControlPayload::RunCommand(RunCommand {
            sandbox_id: sandbox_id.to_string(),
            command: req.command.clone(),
            timeout_seconds: timeout_secs,
            env: req.env,
        });

        let started_at = OffsetDateTime::now_utc();
        let resp = self
            .call(&sandbox.host_id, payload, command_deadline(timeout_secs))
            .await?;
        let result = match resp.payload {
            HostPayload::CommandResult(r) => r,
            other => return Err(unexpected(other)),
        };

        let record = Command {
            id: uuid::Uuid::new_v4().to_string(),
            sandbox_id: sandbox_id.to_string(),
            command: req.command,
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
            started_at,
            ended_at: OffsetDateTime::now_utc(),
        };
        // le résultat est rendu même si l'historique échoue
        if let Err(e) = self.store.create_command(&record) {
            error!("[orchestrator] failed to persist command for {}: {e}", sandbox_id);
        }
        Ok(record)
    }

    pub async fn start_sandbox(&self, org_id: &str, sandbox_id: &str) -> Result<Sandbox, OrchestratorError> {
        let mut sandbox = self.store.get_sandbox(sandbox_id, org_id)?;
        match sandbox.state {
            SandboxState::Running => return Err(OrchestratorError::InvalidState("sandbox is already running".into())),
            SandboxState::Destroyed => return Err(OrchestratorError::InvalidState("sandbox is destroyed".into())),
            _ => {}
        }

        let payload = ControlPayload::StartSandbox(SandboxRef { sandbox_id: sandbox_id.to_string() });
        let resp = self.call(&sandbox.host_id, payload, TIMEOUT_START_STOP).await?;
        let started = match resp.payload {
            HostPayload::SandboxStarted(s) => s,
            other => return Err(unexpected(other)),
        };

        sandbox.state = SandboxState::from_wire(&started.state);
        sandbox.ip_address = started.ip_address;
        self.persist_after_host_success(&sandbox)?;
        Ok(sandbox)
    }

    pub async fn stop_sandbox(&self, org_id: &str, sandbox_id: &str, force: bool) -> Result<Sandbox, OrchestratorError> {
        let mut sandbox = self.store.get_sandbox(sandbox_id, org_id)?;
        match sandbox.state {
            SandboxState::Stopped => return Err(OrchestratorError::InvalidState("sandbox is already stopped".into())),
            SandboxState::Destroyed => return Err(OrchestratorError::InvalidState("sandbox is destroyed".into())),
            _ => {}
        }

        let payload = ControlPayload::StopSandbox(StopSandbox { sandbox_id: sandbox_id.to_string(), force });
        let resp = self.call(&sandbox.host_id, payload, TIMEOUT_START_STOP).await?;
        let stopped = match resp.payload {
            HostPayload::SandboxStopped(s) => s,
            other => return Err(unexpected(other)),
        };

        sandbox.state = SandboxState::from_wire(&stopped.state);
        self.persist_after_host_success(&sandbox)?;
        Ok(sandbox)
    }

    fn persist_after_host_success(&self, sandbox: &Sandbox) -> Result<(), OrchestratorError> {
        self.store.update_sandbox(sandbox).map_err(|e| {
            error!("[orchestrator] host operation on {} succeeded but persist failed: {e}", sandbox.id);
            OrchestratorError::Store(e)
        })
    }

    pub async fn create_snapshot(
        &self,
        org_id: &str,
        sandbox_id: &str,
        snapshot_name: &str,
    ) -> Result<SnapshotInfo, OrchestratorError> {
        let sandbox = self.store.get_sandbox(sandbox_id, org_id)?;
        let payload = ControlPayload::CreateSnapshot(CreateSnapshot {
            sandbox_id: sandbox_id.to_string(),
            snapshot_name: snapshot_name.to_string(),
        });
        let resp = self.call(&sandbox.host_id, payload, TIMEOUT_SNAPSHOT).await?;
        let created = match resp.payload {
            HostPayload::SnapshotCreated(s) => s,
            other => return Err(unexpected(other)),
        };
        Ok(SnapshotInfo {
            snapshot_id: created.snapshot_id,
            sandbox_id: sandbox_id.to_string(),
            snapshot_name: created.snapshot_name,
            created_at: OffsetDateTime::now_utc(),
        })
    }

    pub fn list_commands(&self, org_id: &str, sandbox_id: &str) -> Result<Vec<Command>, OrchestratorError> {
        // vérifie l'appartenance à l'org avant tout
        self.store.get_sandbox(sandbox_id, org_id)?;
        Ok(self.store.list_commands(sandbox_id)?)
    }

    // ============ HÔTES ============

    fn host_info(host: &ConnectedHost, active_sandboxes: usize) -> HostInfo {
        let reg = host.registration.clone().unwrap_or_default();
        HostInfo {
            host_id: host.host_id.clone(),
            hostname: host.hostname.clone(),
            status: HostStatus::Online,
            active_sandboxes,
            available_cpus: reg.available_cpus,
            available_memory_mb: reg.available_memory_mb,
            available_disk_mb: reg.available_disk_mb,
            base_images: reg.base_images,
            last_heartbeat: host.last_heartbeat.format(&Rfc3339).unwrap_or_default(),
        }
    }

    pub fn list_hosts(&self, org_id: &str) -> Vec<HostInfo> {
        let mut connected = self.registry.list_by_org(org_id);
        connected.sort_by(|a, b| a.host_id.cmp(&b.host_id));
        let ids: Vec<String> = connected.iter().map(|h| h.host_id.clone()).collect();
        let counts = self.store.count_sandboxes_by_host(&ids).unwrap_or_else(|e| {
            warn!("[orchestrator] failed to count sandboxes by host: {e}");
            HashMap::new()
        });
        connected
            .iter()
            .map(|h| Self::host_info(h, counts.get(&h.host_id).copied().unwrap_or(0)))
            .collect()
    }

    pub fn get_host(&self, host_id: &str, org_id: &str) -> Result<HostInfo, OrchestratorError> {
        let host = self
            .registry
            .lookup(host_id)
            .filter(|h| h.org_id == org_id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("host {host_id}")))?;
        let count = match self.store.count_sandboxes_by_host(&[host.host_id.clone()]) {
            Ok(counts) => counts.get(&host.host_id).copied().unwrap_or(0),
            Err(e) => {
                warn!("[orchestrator] failed to count sandboxes for host {}: {e}", host_id);
                0
            }
        };
        Ok(Self::host_info(&host, count))
    }

    // ============ VMS SOURCE ============

    /// Interroge tous les hôtes de l'org en parallèle. Un hôte en échec est
    /// remplacé par les VMs connues à son enregistrement.
    pub async fn list_vms(&self, org_id: &str) -> Vec<VmInfo> {
        let hosts: Vec<ConnectedHost> = self
            .registry
            .list_by_org(org_id)
            .into_iter()
            .filter(|h| h.registration.is_some())
            .collect();

        let per_host: Vec<Vec<VmInfo>> = futures::stream::iter(hosts)
            .map(|host| async move {
                let vms = match self.call(&host.host_id, ControlPayload::ListSourceVms, TIMEOUT_LIST_SOURCES).await {
                    Ok(HostMessage { payload: HostPayload::SourceVmsList(list), .. }) => list.vms,
                    Ok(other) => {
                        warn!("[orchestrator] unexpected {} listing VMs on {}", other.payload.kind(), host.host_id);
                        Vec::new()
                    }
                    Err(e) => {
                        warn!("[orchestrator] failed to list VMs from host {}: {e}", host.host_id);
                        host.registration.as_ref().map(|r| r.source_vms.clone()).unwrap_or_default()
                    }
                };
                vms.into_iter()
                    .map(|vm| VmInfo {
                        name: vm.name,
                        state: vm.state,
                        ip_address: vm.ip_address,
                        prepared: vm.prepared,
                        host_id: host.host_id.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .buffer_unordered(LIST_VMS_CONCURRENCY)
            .collect()
            .await;

        per_host.into_iter().flatten().collect()
    }

    fn source_vm_host(&self, org_id: &str, source_vm: &str) -> Result<ConnectedHost, OrchestratorError> {
        if source_vm.is_empty() {
            return Err(OrchestratorError::InvalidArgument("source VM name is required".into()));
        }
        let hosts = self.registry.list_by_org(org_id);
        Ok(select_host_for_source_vm(&hosts, source_vm, self.heartbeat_timeout, 0, 0)?)
    }

    pub async fn prepare_source_vm(
        &self,
        org_id: &str,
        source_vm: &str,
        ssh_user: &str,
        ssh_key_path: &str,
    ) -> Result<SourceVmPrepared, OrchestratorError> {
        let host = self.source_vm_host(org_id, source_vm)?;
        let payload = ControlPayload::PrepareSourceVm(PrepareSourceVm {
            source_vm: source_vm.to_string(),
            ssh_user: ssh_user.to_string(),
            ssh_key_path: ssh_key_path.to_string(),
        });
        match self.call(&host.host_id, payload, TIMEOUT_PREPARE_VM).await?.payload {
            HostPayload::SourceVmPrepared(p) => Ok(p),
            other => Err(unexpected(other)),
        }
    }

    pub async fn validate_source_vm(&self, org_id: &str, source_vm: &str) -> Result<SourceVmValidation, OrchestratorError> {
        let host = self.source_vm_host(org_id, source_vm)?;
        let payload = ControlPayload::ValidateSourceVm(SourceVmRef { source_vm: source_vm.to_string() });
        match self.call(&host.host_id, payload, TIMEOUT_VALIDATE_VM).await?.payload {
            HostPayload::SourceVmValidation(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    pub async fn run_source_command(
        &self,
        org_id: &str,
        source_vm: &str,
        command: &str,
        timeout_seconds: u64,
    ) -> Result<SourceCommandOutput, OrchestratorError> {
        if command.trim().is_empty() {
            return Err(OrchestratorError::InvalidArgument("command must not be empty".into()));
        }
        let host = self.source_vm_host(org_id, source_vm)?;
        let timeout_secs = if timeout_seconds == 0 { DEFAULT_SOURCE_COMMAND_TIMEOUT_SECS } else { timeout_seconds };
        let payload = ControlPayload::RunSourceCommand(RunSourceCommand {
            source_vm: source_vm.to_string(),
            command: command.to_string(),
            timeout_seconds: timeout_secs,
        });
        let resp = self
            .call(&host.host_id, payload, command_deadline(timeout_secs))
            .await?;
        match resp.payload {
            HostPayload::SourceCommandResult(r) => Ok(SourceCommandOutput {
                source_vm: source_vm.to_string(),
                exit_code: r.exit_code,
                stdout: r.stdout,
                stderr: r.stderr,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn read_source_file(&self, org_id: &str, source_vm: &str, path: &str) -> Result<SourceFile, OrchestratorError> {
        if path.is_empty() {
            return Err(OrchestratorError::InvalidArgument("path is required".into()));
        }
        let host = self.source_vm_host(org_id, source_vm)?;
        let payload = ControlPayload::ReadSourceFile(ReadSourceFile {
            source_vm: source_vm.to_string(),
            path: path.to_string(),
        });
        match self.call(&host.host_id, payload, TIMEOUT_READ_FILE).await?.payload {
            HostPayload::SourceFileResult(r) => Ok(SourceFile {
                source_vm: source_vm.to_string(),
                path: r.path,
                content: r.content,
            }),
            other => Err(unexpected(other)),
        }
    }
}

pub type SharedOrchestrator = std::sync::Arc<Orchestrator>;
