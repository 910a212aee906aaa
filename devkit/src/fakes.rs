/*!
Faux managers pour tester l'agent sans QEMU ni libvirt

Chaque faux manager :
- enregistre ses appels dans un `CallLog` partagé ("create_tap fl-xxx", ...)
- échoue sur demande via `Failures::inject("launch")`
- peut ralentir le lancement (`set_launch_delay`) pour couper une création en vol
- garde un état minimal (taps, overlays, VMs) pour vérifier les rollbacks
*/

use async_trait::async_trait;
use fluid_agent_host::execution::{ExecutionResult, SshTarget};
use fluid_agent_host::handlers::{CommandHandler, CommandRunner, HandlerConfig};
use fluid_agent_host::managers::{
    ImageStore, LaunchSpec, ManagerError, ManagerResult, Managers, NetworkManager, OverlayManager, SourceVmManager,
    VmInstance, VmManager,
};
use fluid_agent_host::state::LocalState;
use fluid_protocol::{
    generate_id, states, BridgeInfo, SourceCommandResult, SourceVmInfo, SourceVmPrepared, SourceVmValidation,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const FAKE_IP: &str = "192.168.122.10";
pub const FAKE_BRIDGE: &str = "virbr0";

/// Journal des appels, partagé entre tous les faux managers d'un hôte
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn record(&self, call: impl Into<String>) {
        self.0.lock().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Nombre d'appels commençant par `op`
    pub fn count(&self, op: &str) -> usize {
        self.0.lock().iter().filter(|c| c.split_whitespace().next() == Some(op)).count()
    }
}

/// Opérations qui doivent échouer
#[derive(Clone, Default)]
pub struct Failures(Arc<Mutex<HashSet<String>>>);

impl Failures {
    pub fn inject(&self, op: &str) {
        self.0.lock().insert(op.to_string());
    }

    pub fn clear(&self, op: &str) {
        self.0.lock().remove(op);
    }

    fn check(&self, op: &str) -> ManagerResult<()> {
        if self.0.lock().contains(op) {
            Err(ManagerError::CommandFailed { command: op.to_string(), stderr: "injected failure".into() })
        } else {
            Ok(())
        }
    }
}

// ============ VM ============

pub struct FakeVmManager {
    log: CallLog,
    failures: Failures,
    vms: Mutex<HashMap<String, VmInstance>>,
    next_pid: AtomicU32,
    launch_delay: Mutex<Duration>,
}

impl FakeVmManager {
    pub fn set_launch_delay(&self, delay: Duration) {
        *self.launch_delay.lock() = delay;
    }

    pub fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.vms.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl VmManager for FakeVmManager {
    async fn launch(&self, spec: LaunchSpec) -> ManagerResult<VmInstance> {
        self.log.record(format!("launch {}", spec.sandbox_id));
        let delay = *self.launch_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.failures.check("launch")?;
        let vm = VmInstance {
            sandbox_id: spec.sandbox_id.clone(),
            name: spec.name,
            pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
            state: states::RUNNING.to_string(),
            overlay_path: spec.overlay_path,
            tap_device: spec.tap_device,
            mac_address: spec.mac_address,
            bridge: spec.bridge,
            vcpus: spec.vcpus,
            memory_mb: spec.memory_mb,
        };
        self.vms.lock().insert(spec.sandbox_id, vm.clone());
        Ok(vm)
    }

    async fn destroy(&self, sandbox_id: &str) -> ManagerResult<()> {
        self.log.record(format!("destroy_vm {sandbox_id}"));
        self.failures.check("destroy_vm")?;
        self.vms.lock().remove(sandbox_id);
        Ok(())
    }

    async fn stop(&self, sandbox_id: &str, force: bool) -> ManagerResult<()> {
        self.log.record(format!("stop {sandbox_id} force={force}"));
        self.failures.check("stop")?;
        let mut vms = self.vms.lock();
        let vm = vms.get_mut(sandbox_id).ok_or_else(|| ManagerError::NotFound(format!("sandbox {sandbox_id}")))?;
        vm.state = states::STOPPED.to_string();
        Ok(())
    }

    fn get(&self, sandbox_id: &str) -> ManagerResult<VmInstance> {
        self.vms.lock().get(sandbox_id).cloned().ok_or_else(|| ManagerError::NotFound(format!("sandbox {sandbox_id}")))
    }

    fn list(&self) -> Vec<VmInstance> {
        self.vms.lock().values().cloned().collect()
    }
}

// ============ RÉSEAU ============

pub struct FakeNetworkManager {
    log: CallLog,
    failures: Failures,
    taps: Mutex<HashSet<String>>,
}

impl FakeNetworkManager {
    pub fn taps(&self) -> Vec<String> {
        let mut taps: Vec<String> = self.taps.lock().iter().cloned().collect();
        taps.sort();
        taps
    }
}

#[async_trait]
impl NetworkManager for FakeNetworkManager {
    async fn create_tap(&self, tap: &str, bridge: &str) -> ManagerResult<()> {
        self.log.record(format!("create_tap {tap} {bridge}"));
        self.failures.check("create_tap")?;
        self.taps.lock().insert(tap.to_string());
        Ok(())
    }

    async fn destroy_tap(&self, tap: &str) -> ManagerResult<()> {
        self.log.record(format!("destroy_tap {tap}"));
        if self.taps.lock().remove(tap) {
            Ok(())
        } else {
            Err(ManagerError::NotFound(format!("tap {tap}")))
        }
    }

    async fn resolve_bridge(&self, _source_vm: &str, requested_network: &str) -> ManagerResult<String> {
        self.failures.check("resolve_bridge")?;
        Ok(if requested_network.is_empty() { FAKE_BRIDGE.to_string() } else { requested_network.to_string() })
    }

    async fn discover_ip(&self, mac: &str, _bridge: &str, timeout: Duration) -> ManagerResult<String> {
        self.log.record(format!("discover_ip {mac}"));
        if self.failures.check("discover_ip").is_err() {
            return Err(ManagerError::Timeout(timeout));
        }
        Ok(FAKE_IP.to_string())
    }

    fn list_bridges(&self) -> Vec<BridgeInfo> {
        vec![BridgeInfo { name: FAKE_BRIDGE.into(), subnet: "192.168.122.0/24".into() }]
    }
}

// ============ IMAGES / OVERLAYS ============

pub struct FakeImageStore {
    images: Vec<String>,
}

impl ImageStore for FakeImageStore {
    fn image_path(&self, name: &str) -> ManagerResult<PathBuf> {
        if self.images.iter().any(|i| i == name) {
            Ok(PathBuf::from(format!("/images/{name}.qcow2")))
        } else {
            Err(ManagerError::NotFound(format!("image {name}")))
        }
    }

    fn kernel_path(&self, name: &str) -> ManagerResult<PathBuf> {
        self.image_path(name).map(|p| p.with_extension("vmlinux"))
    }

    fn list_names(&self) -> Vec<String> {
        self.images.clone()
    }
}

pub struct FakeOverlayManager {
    log: CallLog,
    failures: Failures,
    overlays: Mutex<HashSet<String>>,
}

impl FakeOverlayManager {
    pub fn overlays(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.overlays.lock().iter().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl OverlayManager for FakeOverlayManager {
    async fn create_overlay(&self, sandbox_id: &str, _base_image: &Path) -> ManagerResult<PathBuf> {
        self.log.record(format!("create_overlay {sandbox_id}"));
        self.failures.check("create_overlay")?;
        self.overlays.lock().insert(sandbox_id.to_string());
        Ok(PathBuf::from(format!("/work/{sandbox_id}/disk.qcow2")))
    }

    async fn remove_overlay(&self, sandbox_id: &str) -> ManagerResult<()> {
        self.log.record(format!("remove_overlay {sandbox_id}"));
        self.overlays.lock().remove(sandbox_id);
        Ok(())
    }

    async fn snapshot(&self, sandbox_id: &str, name: &str) -> ManagerResult<String> {
        self.log.record(format!("snapshot {sandbox_id} {name}"));
        if !self.overlays.lock().contains(sandbox_id) {
            return Err(ManagerError::NotFound(format!("overlay of {sandbox_id}")));
        }
        Ok(generate_id("SNP-"))
    }
}

// ============ VMS SOURCES ============

pub struct FakeSourceVmManager {
    log: CallLog,
    vms: Mutex<Vec<SourceVmInfo>>,
}

impl FakeSourceVmManager {
    pub fn add(&self, name: &str) {
        self.vms.lock().push(SourceVmInfo {
            name: name.to_string(),
            state: "running".into(),
            ip_address: "192.168.122.3".into(),
            prepared: true,
        });
    }
}

#[async_trait]
impl SourceVmManager for FakeSourceVmManager {
    async fn prepare_source_vm(&self, vm: &str, _ssh_user: &str, _ssh_key_path: &str) -> ManagerResult<SourceVmPrepared> {
        self.log.record(format!("prepare {vm}"));
        Ok(SourceVmPrepared {
            source_vm: vm.to_string(),
            ip_address: "192.168.122.2".into(),
            prepared: true,
            user_created: true,
            shell_installed: true,
            ca_key_installed: true,
            sshd_configured: true,
            principals_created: false,
            sshd_restarted: true,
        })
    }

    async fn run_source_command(&self, vm: &str, command: &str, _timeout: Duration) -> ManagerResult<SourceCommandResult> {
        self.log.record(format!("source_command {vm} {command}"));
        Ok(SourceCommandResult { source_vm: vm.to_string(), exit_code: 0, stdout: format!("ran {command}"), stderr: String::new() })
    }

    async fn read_source_file(&self, vm: &str, path: &str) -> ManagerResult<String> {
        self.log.record(format!("read_file {vm} {path}"));
        Ok("aGVsbG8K".to_string())
    }

    async fn list_vms(&self) -> ManagerResult<Vec<SourceVmInfo>> {
        Ok(self.vms.lock().clone())
    }

    async fn validate_source_vm(&self, vm: &str) -> ManagerResult<SourceVmValidation> {
        let known = self.vms.lock().iter().any(|v| v.name == vm);
        Ok(SourceVmValidation {
            source_vm: vm.to_string(),
            valid: known,
            state: if known { "running".into() } else { String::new() },
            has_network: known,
            errors: if known { Vec::new() } else { vec![format!("VM {vm} not found")] },
            ..Default::default()
        })
    }
}

// ============ COMMANDES ============

/// Exécuteur de commandes sans SSH ; `delay` simule une commande lente
pub struct FakeRunner {
    log: CallLog,
    delay: Mutex<Duration>,
}

impl FakeRunner {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, target: &SshTarget, command: &str, _timeout: Duration) -> ManagerResult<ExecutionResult> {
        self.log.record(format!("ssh {}@{} {}", target.user, target.host, command));
        // le timeout est ignoré : simule une sandbox qui ne répond plus
        let delay = *self.delay.lock();
        tokio::time::sleep(delay).await;
        Ok(ExecutionResult {
            stdout: format!("ran: {command}"),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: delay.as_millis() as u64,
        })
    }
}

/// Un hôte complet en faux managers
pub struct FakeHost {
    pub log: CallLog,
    pub failures: Failures,
    pub vms: Arc<FakeVmManager>,
    pub network: Arc<FakeNetworkManager>,
    pub images: Arc<FakeImageStore>,
    pub overlays: Arc<FakeOverlayManager>,
    pub source_vms: Arc<FakeSourceVmManager>,
    pub runner: Arc<FakeRunner>,
}

impl FakeHost {
    pub fn new(images: &[&str]) -> Self {
        let log = CallLog::default();
        let failures = Failures::default();
        Self {
            vms: Arc::new(FakeVmManager {
                log: log.clone(),
                failures: failures.clone(),
                vms: Mutex::new(HashMap::new()),
                next_pid: AtomicU32::new(1000),
                launch_delay: Mutex::new(Duration::ZERO),
            }),
            network: Arc::new(FakeNetworkManager { log: log.clone(), failures: failures.clone(), taps: Mutex::new(HashSet::new()) }),
            images: Arc::new(FakeImageStore { images: images.iter().map(|s| s.to_string()).collect() }),
            overlays: Arc::new(FakeOverlayManager {
                log: log.clone(),
                failures: failures.clone(),
                overlays: Mutex::new(HashSet::new()),
            }),
            source_vms: Arc::new(FakeSourceVmManager {
                log: log.clone(),
                vms: Mutex::new(vec![SourceVmInfo {
                    name: "golden".into(),
                    state: "running".into(),
                    ip_address: "192.168.122.2".into(),
                    prepared: true,
                }]),
            }),
            runner: Arc::new(FakeRunner { log: log.clone(), delay: Mutex::new(Duration::ZERO) }),
            log,
            failures,
        }
    }

    pub fn managers(&self) -> Managers {
        Managers {
            vms: Some(self.vms.clone()),
            network: Some(self.network.clone()),
            images: Some(self.images.clone()),
            source_vms: Some(self.source_vms.clone()),
            overlays: Some(self.overlays.clone()),
        }
    }

    /// Handler branché sur ces faux managers et le faux exécuteur
    pub fn handler(&self, state: Arc<LocalState>) -> CommandHandler {
        let config = HandlerConfig { ip_discovery_timeout: Duration::from_secs(1), ..HandlerConfig::default() };
        CommandHandler::new(self.managers(), state, config).with_runner(self.runner.clone())
    }
}
