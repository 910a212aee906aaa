//! Command handlers
//!
//! Every `ControlMessage` yields exactly one `HostMessage` carrying the same
//! request id. Failures become `ErrorReport`s; nothing escapes the dispatch
//! boundary.
//!
//! Create provisions in order (bridge, image, overlay, tap, VM) and unwinds
//! what it built when a later step fails. Destroy is best-effort and always
//! answers `SandboxDestroyed`.

use crate::config::{AgentConfig, SshConfig};
use crate::execution::{run_ssh, ExecutionResult, SshTarget};
use crate::managers::{generate_mac, tap_name, LaunchSpec, ManagerError, ManagerResult, Managers};
use crate::state::{LocalSandbox, LocalState};
use async_trait::async_trait;
use chrono::Utc;
use fluid_protocol::{
    states, CommandResult, ControlMessage, ControlPayload, CreateSandbox, CreateSnapshot, HostMessage, HostPayload,
    PrepareSourceVm, ReadSourceFile, RunCommand, RunSourceCommand, SandboxCreated, SandboxRef, SandboxStarted,
    SandboxStopped, SnapshotCreated, SourceFileResult, SourceVmRef, SourceVmsList, StopSandbox,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const START_IP_TIMEOUT: Duration = Duration::from_secs(30);
const RUN_IP_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs a command inside a sandbox. SSH in production.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, target: &SshTarget, command: &str, timeout: Duration) -> ManagerResult<ExecutionResult>;
}

pub struct SshRunner;

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, target: &SshTarget, command: &str, timeout: Duration) -> ManagerResult<ExecutionResult> {
        run_ssh(target, command, timeout).await
    }
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub default_vcpus: u32,
    pub default_memory_mb: u64,
    pub command_timeout: Duration,
    pub ip_discovery_timeout: Duration,
    pub ssh: SshConfig,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self::from_agent(&AgentConfig::default())
    }
}

impl HandlerConfig {
    pub fn from_agent(config: &AgentConfig) -> Self {
        Self {
            default_vcpus: config.microvm.default_vcpus,
            default_memory_mb: config.microvm.default_memory_mb,
            command_timeout: config.command_timeout(),
            ip_discovery_timeout: config.ip_discovery_timeout(),
            ssh: config.ssh.clone(),
        }
    }
}

struct Failure {
    sandbox_id: String,
    message: String,
}

fn fail(sandbox_id: &str, message: impl Into<String>) -> Failure {
    Failure { sandbox_id: sandbox_id.to_string(), message: message.into() }
}

type Outcome = Result<HostPayload, Failure>;

fn require<'a, T: ?Sized>(manager: &'a Option<Arc<T>>, what: &str, sandbox_id: &str) -> Result<&'a Arc<T>, Failure> {
    manager.as_ref().ok_or_else(|| fail(sandbox_id, format!("{what} manager not available")))
}

/// `export K='v'; ` prefix for each env var, sorted for stable output.
pub fn env_prefix(env: &HashMap<String, String>) -> Result<String, String> {
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    let mut prefix = String::new();
    for key in keys {
        let valid = key.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(format!("invalid environment variable name {key:?}"));
        }
        prefix.push_str(&format!("export {}='{}'; ", key, env[key].replace('\'', r"'\''")));
    }
    Ok(prefix)
}

#[derive(Clone)]
pub struct CommandHandler {
    managers: Managers,
    state: Arc<LocalState>,
    runner: Arc<dyn CommandRunner>,
    config: HandlerConfig,
}

impl CommandHandler {
    pub fn new(managers: Managers, state: Arc<LocalState>, config: HandlerConfig) -> Self {
        Self { managers, state, runner: Arc::new(SshRunner), config }
    }

    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn managers(&self) -> &Managers {
        &self.managers
    }

    pub fn state(&self) -> &Arc<LocalState> {
        &self.state
    }

    pub async fn handle(&self, msg: ControlMessage) -> HostMessage {
        let request_id = msg.request_id;
        let kind = msg.payload.kind();
        debug!("handling {} ({})", kind, request_id);

        let outcome = match msg.payload {
            ControlPayload::CreateSandbox(cmd) => self.create_sandbox(cmd).await,
            ControlPayload::DestroySandbox(cmd) => Ok(self.destroy_sandbox(cmd).await),
            ControlPayload::StartSandbox(cmd) => self.start_sandbox(cmd).await,
            ControlPayload::StopSandbox(cmd) => self.stop_sandbox(cmd).await,
            ControlPayload::RunCommand(cmd) => self.run_command(cmd).await,
            ControlPayload::CreateSnapshot(cmd) => self.create_snapshot(cmd).await,
            ControlPayload::PrepareSourceVm(cmd) => self.prepare_source_vm(cmd).await,
            ControlPayload::RunSourceCommand(cmd) => self.run_source_command(cmd).await,
            ControlPayload::ReadSourceFile(cmd) => self.read_source_file(cmd).await,
            ControlPayload::ListSourceVms => self.list_source_vms().await,
            ControlPayload::ValidateSourceVm(cmd) => self.validate_source_vm(cmd).await,
            ControlPayload::RegistrationAck(_) | ControlPayload::Unknown => Err(fail("", "unknown command type")),
        };

        match outcome {
            Ok(payload) => HostMessage::new(request_id, payload),
            Err(f) => {
                warn!("{} ({}) failed: {}", kind, request_id, f.message);
                HostMessage::error_report(request_id, f.sandbox_id, f.message)
            }
        }
    }

    // ============ SANDBOXES ============

    async fn create_sandbox(&self, cmd: CreateSandbox) -> Outcome {
        let id = cmd.sandbox_id.as_str();
        if id.is_empty() {
            return Err(fail(id, "sandbox_id is required"));
        }
        let vms = require(&self.managers.vms, "microVM", id)?;
        let net = require(&self.managers.network, "network", id)?;
        let images = require(&self.managers.images, "image", id)?;
        let overlays = require(&self.managers.overlays, "overlay", id)?;

        let vcpus = if cmd.vcpus == 0 { self.config.default_vcpus } else { cmd.vcpus };
        let memory_mb = if cmd.memory_mb == 0 { self.config.default_memory_mb } else { cmd.memory_mb };
        let name = if cmd.name.is_empty() { format!("sbx-{}", &tap_name(id)[3..]) } else { cmd.name.clone() };

        info!("creating sandbox {} ({}, {} vcpus, {} MB)", id, cmd.base_image, vcpus, memory_mb);

        let bridge = net
            .resolve_bridge(&cmd.source_vm, &cmd.network)
            .await
            .map_err(|e| fail(id, format!("resolve bridge: {e}")))?;
        let image_path = images.image_path(&cmd.base_image).map_err(|e| fail(id, format!("base image: {e}")))?;
        let kernel_path = images.kernel_path(&cmd.base_image).map_err(|e| fail(id, format!("kernel: {e}")))?;

        let overlay_path = overlays
            .create_overlay(id, &image_path)
            .await
            .map_err(|e| fail(id, format!("create overlay: {e}")))?;

        let mac = generate_mac();
        let tap = tap_name(id);
        if let Err(e) = net.create_tap(&tap, &bridge).await {
            if let Err(cleanup) = overlays.remove_overlay(id).await {
                warn!("rollback of {}: overlay removal failed: {}", id, cleanup);
            }
            return Err(fail(id, format!("create tap: {e}")));
        }

        let spec = LaunchSpec {
            sandbox_id: id.to_string(),
            name: name.clone(),
            overlay_path: overlay_path.clone(),
            kernel_path: kernel_path.clone(),
            tap_device: tap.clone(),
            mac_address: mac.clone(),
            bridge: bridge.clone(),
            vcpus,
            memory_mb,
        };
        let vm = match vms.launch(spec).await {
            Ok(vm) => vm,
            Err(e) => {
                if let Err(cleanup) = net.destroy_tap(&tap).await {
                    warn!("rollback of {}: tap removal failed: {}", id, cleanup);
                }
                if let Err(cleanup) = overlays.remove_overlay(id).await {
                    warn!("rollback of {}: overlay removal failed: {}", id, cleanup);
                }
                return Err(fail(id, format!("launch microVM: {e}")));
            }
        };

        let ip_address = match net.discover_ip(&mac, &bridge, self.config.ip_discovery_timeout).await {
            Ok(ip) => ip,
            Err(e) => {
                warn!("IP discovery for {} failed: {}", id, e);
                String::new()
            }
        };

        self.state.put(LocalSandbox {
            sandbox_id: id.to_string(),
            name: name.clone(),
            agent_id: cmd.agent_id.clone(),
            base_image: cmd.base_image.clone(),
            state: states::RUNNING.to_string(),
            ip_address: ip_address.clone(),
            mac_address: mac.clone(),
            tap_device: tap.clone(),
            bridge: bridge.clone(),
            overlay_path,
            kernel_path,
            vcpus,
            memory_mb,
            ttl_seconds: cmd.ttl_seconds,
            created_at: Utc::now(),
        });

        info!("sandbox {} running (pid {}, ip {:?})", id, vm.pid, ip_address);
        Ok(HostPayload::SandboxCreated(SandboxCreated {
            sandbox_id: id.to_string(),
            name,
            state: states::RUNNING.to_string(),
            ip_address,
            mac_address: mac,
            bridge,
            tap_device: tap,
            pid: vm.pid,
        }))
    }

    async fn destroy_sandbox(&self, cmd: SandboxRef) -> HostPayload {
        let id = cmd.sandbox_id.as_str();
        if let Err(e) = self.release(id).await {
            warn!("destroy {}: VM: {}", id, e);
        }
        self.state.remove(id);

        info!("sandbox {} destroyed", id);
        HostPayload::SandboxDestroyed(SandboxRef { sandbox_id: id.to_string() })
    }

    /// Destroys a sandbox whose TTL ran out. The local record is kept when
    /// the VM could not be stopped, so the next sweep tries again.
    pub async fn expire(&self, sandbox_id: &str) -> ManagerResult<()> {
        self.release(sandbox_id).await?;
        self.state.remove(sandbox_id);
        info!("expired sandbox {} destroyed", sandbox_id);
        Ok(())
    }

    /// Tears down tap, VM and overlay, each step attempted. Only the VM error
    /// is returned: the sandbox may still be running.
    async fn release(&self, id: &str) -> ManagerResult<()> {
        let local = self.state.get(id);
        let tracked = self.managers.vms.as_ref().and_then(|vms| vms.get(id).ok());
        let tap = tracked
            .map(|vm| vm.tap_device)
            .or_else(|| local.map(|l| l.tap_device))
            .unwrap_or_else(|| tap_name(id));

        if let Some(net) = &self.managers.network {
            if let Err(e) = net.destroy_tap(&tap).await {
                debug!("destroy {}: tap {}: {}", id, tap, e);
            }
        }
        let vm = match &self.managers.vms {
            Some(vms) => match vms.destroy(id).await {
                Err(ManagerError::NotFound(_)) => Ok(()),
                other => other,
            },
            None => Ok(()),
        };
        if let Some(overlays) = &self.managers.overlays {
            if let Err(e) = overlays.remove_overlay(id).await {
                warn!("destroy {}: overlay: {}", id, e);
            }
        }
        vm
    }

    async fn start_sandbox(&self, cmd: SandboxRef) -> Outcome {
        let id = cmd.sandbox_id.as_str();
        let vms = require(&self.managers.vms, "microVM", id)?;
        let mut vm = vms.get(id).map_err(|e| fail(id, format!("get sandbox: {e}")))?;

        if vm.state != states::RUNNING {
            let local = self.state.get(id).ok_or_else(|| fail(id, "no local state to restart sandbox"))?;
            vm = vms
                .launch(LaunchSpec {
                    sandbox_id: id.to_string(),
                    name: vm.name.clone(),
                    overlay_path: vm.overlay_path.clone(),
                    kernel_path: local.kernel_path,
                    tap_device: vm.tap_device.clone(),
                    mac_address: vm.mac_address.clone(),
                    bridge: vm.bridge.clone(),
                    vcpus: vm.vcpus,
                    memory_mb: vm.memory_mb,
                })
                .await
                .map_err(|e| fail(id, format!("relaunch microVM: {e}")))?;
        }

        let ip_address = match &self.managers.network {
            Some(net) => net.discover_ip(&vm.mac_address, &vm.bridge, START_IP_TIMEOUT).await.unwrap_or_default(),
            None => String::new(),
        };
        self.state.update(id, |s| {
            s.state = states::RUNNING.to_string();
            if !ip_address.is_empty() {
                s.ip_address = ip_address.clone();
            }
        });

        Ok(HostPayload::SandboxStarted(SandboxStarted {
            sandbox_id: id.to_string(),
            state: states::RUNNING.to_string(),
            ip_address,
        }))
    }

    async fn stop_sandbox(&self, cmd: StopSandbox) -> Outcome {
        let id = cmd.sandbox_id.as_str();
        let vms = require(&self.managers.vms, "microVM", id)?;
        vms.stop(id, cmd.force).await.map_err(|e| fail(id, format!("stop: {e}")))?;
        self.state.update(id, |s| s.state = states::STOPPED.to_string());
        Ok(HostPayload::SandboxStopped(SandboxStopped {
            sandbox_id: id.to_string(),
            state: states::STOPPED.to_string(),
        }))
    }

    async fn sandbox_ip(&self, id: &str) -> Result<String, Failure> {
        let vms = require(&self.managers.vms, "microVM", id)?;
        let vm = vms.get(id).map_err(|e| fail(id, format!("get sandbox: {e}")))?;

        if let Some(ip) = self.state.get(id).map(|s| s.ip_address).filter(|ip| !ip.is_empty()) {
            return Ok(ip);
        }
        let ip = match &self.managers.network {
            Some(net) => net.discover_ip(&vm.mac_address, &vm.bridge, RUN_IP_TIMEOUT).await.unwrap_or_default(),
            None => String::new(),
        };
        if ip.is_empty() {
            return Err(fail(id, "unable to discover sandbox IP for SSH"));
        }
        self.state.update(id, |s| s.ip_address = ip.clone());
        Ok(ip)
    }

    async fn run_command(&self, cmd: RunCommand) -> Outcome {
        let id = cmd.sandbox_id.as_str();
        if cmd.command.trim().is_empty() {
            return Err(fail(id, "command is required"));
        }
        let prefix = env_prefix(&cmd.env).map_err(|e| fail(id, e))?;
        let ip = self.sandbox_ip(id).await?;

        let timeout = if cmd.timeout_seconds == 0 {
            self.config.command_timeout
        } else {
            Duration::from_secs(cmd.timeout_seconds)
        };
        let target = SshTarget {
            user: self.config.ssh.default_user.clone(),
            host: ip,
            key_path: self.config.ssh.key_path.clone(),
            proxy_jump: self.config.ssh.proxy_jump.clone(),
        };

        info!("running command in {}: {}", id, cmd.command);
        let result = self
            .runner
            .run(&target, &format!("{prefix}{}", cmd.command), timeout)
            .await
            .map_err(|e| fail(id, format!("run command: {e}")))?;

        Ok(HostPayload::CommandResult(CommandResult {
            sandbox_id: id.to_string(),
            stdout: result.stdout,
            stderr: result.stderr,
            exit_code: result.exit_code,
            duration_ms: result.duration_ms,
        }))
    }

    async fn create_snapshot(&self, cmd: CreateSnapshot) -> Outcome {
        let id = cmd.sandbox_id.as_str();
        let vms = require(&self.managers.vms, "microVM", id)?;
        let overlays = require(&self.managers.overlays, "overlay", id)?;
        vms.get(id).map_err(|e| fail(id, format!("get sandbox: {e}")))?;

        let snapshot_id = overlays
            .snapshot(id, &cmd.snapshot_name)
            .await
            .map_err(|e| fail(id, format!("snapshot: {e}")))?;
        Ok(HostPayload::SnapshotCreated(SnapshotCreated {
            sandbox_id: id.to_string(),
            snapshot_id,
            snapshot_name: cmd.snapshot_name,
        }))
    }

    // ============ SOURCE VMS ============

    async fn prepare_source_vm(&self, cmd: PrepareSourceVm) -> Outcome {
        let src = require(&self.managers.source_vms, "source VM", "")?;
        src.prepare_source_vm(&cmd.source_vm, &cmd.ssh_user, &cmd.ssh_key_path)
            .await
            .map(HostPayload::SourceVmPrepared)
            .map_err(|e| fail("", format!("prepare source VM {}: {e}", cmd.source_vm)))
    }

    async fn run_source_command(&self, cmd: RunSourceCommand) -> Outcome {
        let src = require(&self.managers.source_vms, "source VM", "")?;
        src.run_source_command(&cmd.source_vm, &cmd.command, Duration::from_secs(cmd.timeout_seconds))
            .await
            .map(HostPayload::SourceCommandResult)
            .map_err(|e| fail("", format!("run source command on {}: {e}", cmd.source_vm)))
    }

    async fn read_source_file(&self, cmd: ReadSourceFile) -> Outcome {
        let src = require(&self.managers.source_vms, "source VM", "")?;
        let content = src
            .read_source_file(&cmd.source_vm, &cmd.path)
            .await
            .map_err(|e| fail("", format!("read {} on {}: {e}", cmd.path, cmd.source_vm)))?;
        Ok(HostPayload::SourceFileResult(SourceFileResult { source_vm: cmd.source_vm, path: cmd.path, content }))
    }

    async fn list_source_vms(&self) -> Outcome {
        let src = require(&self.managers.source_vms, "source VM", "")?;
        let vms = src.list_vms().await.map_err(|e| fail("", format!("list source VMs: {e}")))?;
        Ok(HostPayload::SourceVmsList(SourceVmsList { vms }))
    }

    async fn validate_source_vm(&self, cmd: SourceVmRef) -> Outcome {
        let src = require(&self.managers.source_vms, "source VM", "")?;
        src.validate_source_vm(&cmd.source_vm)
            .await
            .map(HostPayload::SourceVmValidation)
            .map_err(|e| fail("", format!("validate source VM {}: {e}", cmd.source_vm)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluid_protocol::ErrorReport;

    fn bare_handler() -> CommandHandler {
        CommandHandler::new(Managers::default(), Arc::new(LocalState::in_memory()), HandlerConfig::default())
    }

    fn error_of(msg: &HostMessage) -> &ErrorReport {
        match &msg.payload {
            HostPayload::ErrorReport(e) => e,
            other => panic!("expected error report, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_command_reports_error() {
        let handler = bare_handler();
        let reply = handler.handle(ControlMessage { request_id: "r-1".into(), payload: ControlPayload::Unknown }).await;
        assert_eq!(reply.request_id, "r-1");
        assert_eq!(error_of(&reply).error, "unknown command type");

        let stray = ControlPayload::RegistrationAck(Default::default());
        let reply = handler.handle(ControlMessage { request_id: "r-2".into(), payload: stray }).await;
        assert_eq!(error_of(&reply).error, "unknown command type");
    }

    #[tokio::test]
    async fn test_missing_manager_reports_error() {
        let handler = bare_handler();
        let create = ControlPayload::CreateSandbox(CreateSandbox {
            sandbox_id: "SBX-1".into(),
            base_image: "ubuntu".into(),
            ..Default::default()
        });
        let reply = handler.handle(ControlMessage { request_id: "r-3".into(), payload: create }).await;
        let err = error_of(&reply);
        assert_eq!(err.error, "microVM manager not available");
        assert_eq!(err.sandbox_id, "SBX-1");

        let reply = handler
            .handle(ControlMessage { request_id: "r-4".into(), payload: ControlPayload::ListSourceVms })
            .await;
        assert_eq!(error_of(&reply).error, "source VM manager not available");
    }

    #[tokio::test]
    async fn test_destroy_without_managers_still_succeeds() {
        let handler = bare_handler();
        handler.state().put(crate::state::sample("SBX-9"));
        let destroy = ControlPayload::DestroySandbox(SandboxRef { sandbox_id: "SBX-9".into() });
        for _ in 0..2 {
            let reply = handler
                .handle(ControlMessage { request_id: "r-5".into(), payload: destroy.clone() })
                .await;
            assert_eq!(reply.payload, HostPayload::SandboxDestroyed(SandboxRef { sandbox_id: "SBX-9".into() }));
        }
        assert!(handler.state().get("SBX-9").is_none());
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let handler = bare_handler();
        let run = ControlPayload::RunCommand(RunCommand { sandbox_id: "SBX-1".into(), command: "  ".into(), ..Default::default() });
        let reply = handler.handle(ControlMessage { request_id: "r-6".into(), payload: run }).await;
        assert_eq!(error_of(&reply).error, "command is required");
    }

    #[test]
    fn test_env_prefix() {
        let mut env = HashMap::new();
        env.insert("B".to_string(), "two words".to_string());
        env.insert("A_1".to_string(), "it's".to_string());
        assert_eq!(env_prefix(&env).unwrap(), r"export A_1='it'\''s'; export B='two words'; ");

        env.insert("1BAD".to_string(), "x".to_string());
        assert!(env_prefix(&env).is_err());
        assert_eq!(env_prefix(&HashMap::new()).unwrap(), "");
    }
}
