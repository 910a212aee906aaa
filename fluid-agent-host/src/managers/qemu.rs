//! QEMU microVM launcher
//!
//! Each sandbox lives in `work_dir/<sandbox_id>/` with its overlay disk,
//! `qemu.pid` and a `vm.json` metadata file used to recover tracked VMs
//! after an agent restart. QEMU daemonizes itself; liveness is checked with
//! signal 0.

use super::{LaunchSpec, ManagerError, ManagerResult, VmInstance, VmManager};
use crate::execution::run_tool;
use async_trait::async_trait;
use fluid_protocol::states;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const PID_READ_ATTEMPTS: u32 = 10;
const PID_READ_DELAY: Duration = Duration::from_millis(100);
const KILL_WAIT: Duration = Duration::from_secs(5);

pub struct QemuVmManager {
    qemu_binary: String,
    work_dir: PathBuf,
    vms: RwLock<HashMap<String, VmInstance>>,
}

impl QemuVmManager {
    pub fn new(qemu_binary: &str, work_dir: impl Into<PathBuf>) -> ManagerResult<Self> {
        let work_dir = work_dir.into();
        std::fs::create_dir_all(&work_dir)?;
        Ok(Self { qemu_binary: qemu_binary.to_string(), work_dir, vms: RwLock::new(HashMap::new()) })
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.work_dir.join(sandbox_id)
    }

    /// Rebuilds the VM table from `vm.json` files whose process is still alive.
    pub fn recover(&self) -> ManagerResult<usize> {
        let entries = match std::fs::read_dir(&self.work_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut recovered = 0;
        let mut vms = self.vms.write();
        for entry in entries.filter_map(|e| e.ok()) {
            let meta_path = entry.path().join("vm.json");
            let Ok(raw) = std::fs::read_to_string(&meta_path) else { continue };
            let mut vm: VmInstance = match serde_json::from_str(&raw) {
                Ok(vm) => vm,
                Err(e) => {
                    warn!("invalid metadata {}: {}", meta_path.display(), e);
                    continue;
                }
            };
            if let Some(pid) = read_pid(&entry.path().join("qemu.pid")) {
                vm.pid = pid;
            }
            if !is_alive(vm.pid) {
                vm.state = states::STOPPED.to_string();
            }
            info!("recovered sandbox {} (pid {}, {})", vm.sandbox_id, vm.pid, vm.state);
            vms.insert(vm.sandbox_id.clone(), vm);
            recovered += 1;
        }
        Ok(recovered)
    }
}

pub fn qemu_args(spec: &LaunchSpec, pid_file: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-M", "microvm", "-enable-kvm", "-cpu", "host"].iter().map(|s| s.to_string()).collect();
    args.extend([
        "-m".into(),
        spec.memory_mb.to_string(),
        "-smp".into(),
        spec.vcpus.to_string(),
        "-kernel".into(),
        spec.kernel_path.display().to_string(),
        "-append".into(),
        "console=ttyS0 root=/dev/vda rw quiet".into(),
        "-drive".into(),
        format!("id=root,file={},format=qcow2,if=none", spec.overlay_path.display()),
        "-device".into(),
        "virtio-blk-device,drive=root".into(),
        "-netdev".into(),
        format!("tap,id=net0,ifname={},script=no,downscript=no", spec.tap_device),
        "-device".into(),
        format!("virtio-net-device,netdev=net0,mac={}", spec.mac_address),
        "-serial".into(),
        "stdio".into(),
        "-nographic".into(),
        "-nodefaults".into(),
        "-daemonize".into(),
        "-pidfile".into(),
        pid_file.display().to_string(),
    ]);
    args
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_alive(pid: u32) -> bool {
    pid != 0 && kill(Pid::from_raw(pid as i32), None).is_ok()
}

fn signal(pid: u32, sig: Signal) -> ManagerResult<()> {
    kill(Pid::from_raw(pid as i32), sig)
        .map_err(|e| ManagerError::Io(std::io::Error::from_raw_os_error(e as i32)))
}

#[async_trait]
impl VmManager for QemuVmManager {
    async fn launch(&self, spec: LaunchSpec) -> ManagerResult<VmInstance> {
        if let Some(existing) = self.vms.read().get(&spec.sandbox_id) {
            if existing.state == states::RUNNING && is_alive(existing.pid) {
                return Err(ManagerError::Invalid(format!("sandbox {} already running", spec.sandbox_id)));
            }
        }

        let dir = self.sandbox_dir(&spec.sandbox_id);
        tokio::fs::create_dir_all(&dir).await?;
        let pid_file = dir.join("qemu.pid");
        let _ = tokio::fs::remove_file(&pid_file).await;

        info!(
            "launching microVM {} (tap {}, mac {}, {} vcpus, {} MB)",
            spec.sandbox_id, spec.tap_device, spec.mac_address, spec.vcpus, spec.memory_mb
        );
        let args = qemu_args(&spec, &pid_file);
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_tool(&self.qemu_binary, &arg_refs).await?;

        // QEMU writes the pidfile after daemonizing
        let mut pid = None;
        for _ in 0..PID_READ_ATTEMPTS {
            pid = read_pid(&pid_file);
            if pid.is_some() {
                break;
            }
            tokio::time::sleep(PID_READ_DELAY).await;
        }
        let pid = pid.ok_or_else(|| ManagerError::NotFound(format!("QEMU pid in {}", pid_file.display())))?;

        let vm = VmInstance {
            sandbox_id: spec.sandbox_id.clone(),
            name: spec.name,
            pid,
            state: states::RUNNING.to_string(),
            overlay_path: spec.overlay_path,
            tap_device: spec.tap_device,
            mac_address: spec.mac_address,
            bridge: spec.bridge,
            vcpus: spec.vcpus,
            memory_mb: spec.memory_mb,
        };
        if let Ok(json) = serde_json::to_string_pretty(&vm) {
            if let Err(e) = tokio::fs::write(dir.join("vm.json"), json).await {
                warn!("cannot persist metadata for {}: {}", vm.sandbox_id, e);
            }
        }
        self.vms.write().insert(vm.sandbox_id.clone(), vm.clone());
        info!("microVM {} launched (pid {})", vm.sandbox_id, pid);
        Ok(vm)
    }

    async fn destroy(&self, sandbox_id: &str) -> ManagerResult<()> {
        let Some(vm) = self.vms.write().remove(sandbox_id) else {
            return Ok(());
        };

        if is_alive(vm.pid) {
            let _ = signal(vm.pid, Signal::SIGKILL);
            let deadline = tokio::time::Instant::now() + KILL_WAIT;
            while is_alive(vm.pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(PID_READ_DELAY).await;
            }
            if is_alive(vm.pid) {
                warn!("process {} of {} did not exit after SIGKILL", vm.pid, sandbox_id);
            }
        }
        let _ = tokio::fs::remove_file(self.sandbox_dir(sandbox_id).join("vm.json")).await;
        info!("microVM {} destroyed", sandbox_id);
        Ok(())
    }

    async fn stop(&self, sandbox_id: &str, force: bool) -> ManagerResult<()> {
        let pid = self
            .vms
            .read()
            .get(sandbox_id)
            .map(|vm| vm.pid)
            .ok_or_else(|| ManagerError::NotFound(format!("sandbox {sandbox_id}")))?;

        let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        if is_alive(pid) {
            signal(pid, sig)?;
        }
        if let Some(vm) = self.vms.write().get_mut(sandbox_id) {
            vm.state = states::STOPPED.to_string();
        }
        info!("microVM {} stopped (force={})", sandbox_id, force);
        Ok(())
    }

    fn get(&self, sandbox_id: &str) -> ManagerResult<VmInstance> {
        let mut vms = self.vms.write();
        let vm = vms
            .get_mut(sandbox_id)
            .ok_or_else(|| ManagerError::NotFound(format!("sandbox {sandbox_id}")))?;
        if vm.state == states::RUNNING && !is_alive(vm.pid) {
            vm.state = states::STOPPED.to_string();
        }
        Ok(vm.clone())
    }

    fn list(&self) -> Vec<VmInstance> {
        self.vms.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            sandbox_id: "SBX-0A1B2C3D".into(),
            name: "sbx-0a1b2c3d".into(),
            overlay_path: PathBuf::from("/work/SBX-0A1B2C3D/disk.qcow2"),
            kernel_path: PathBuf::from("/images/ubuntu.vmlinux"),
            tap_device: "fl-0a1b2c3d".into(),
            mac_address: "52:54:00:01:02:03".into(),
            bridge: "virbr0".into(),
            vcpus: 2,
            memory_mb: 2048,
        }
    }

    #[test]
    fn test_qemu_args() {
        let args = qemu_args(&spec(), Path::new("/work/SBX-0A1B2C3D/qemu.pid"));
        let joined = args.join(" ");
        assert!(joined.starts_with("-M microvm -enable-kvm -cpu host -m 2048 -smp 2"));
        assert!(joined.contains("-kernel /images/ubuntu.vmlinux"));
        assert!(joined.contains("-append console=ttyS0 root=/dev/vda rw quiet"));
        assert!(joined.contains("id=root,file=/work/SBX-0A1B2C3D/disk.qcow2,format=qcow2,if=none"));
        assert!(joined.contains("tap,id=net0,ifname=fl-0a1b2c3d,script=no,downscript=no"));
        assert!(joined.contains("virtio-net-device,netdev=net0,mac=52:54:00:01:02:03"));
        assert!(joined.ends_with("-daemonize -pidfile /work/SBX-0A1B2C3D/qemu.pid"));
    }

    #[tokio::test]
    async fn test_unknown_sandbox() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = QemuVmManager::new("qemu-system-x86_64", tmp.path()).unwrap();
        assert!(matches!(mgr.get("SBX-MISSING"), Err(ManagerError::NotFound(_))));
        assert!(matches!(mgr.stop("SBX-MISSING", false).await, Err(ManagerError::NotFound(_))));
        mgr.destroy("SBX-MISSING").await.unwrap();
        assert!(mgr.list().is_empty());
    }

    #[test]
    fn test_recover_marks_dead_process_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("SBX-0A1B2C3D");
        std::fs::create_dir_all(&dir).unwrap();
        let vm = VmInstance {
            sandbox_id: "SBX-0A1B2C3D".into(),
            name: "sbx".into(),
            pid: 0,
            state: states::RUNNING.into(),
            overlay_path: dir.join("disk.qcow2"),
            tap_device: "fl-0a1b2c3d".into(),
            mac_address: "52:54:00:01:02:03".into(),
            bridge: "virbr0".into(),
            vcpus: 1,
            memory_mb: 512,
        };
        std::fs::write(dir.join("vm.json"), serde_json::to_string(&vm).unwrap()).unwrap();
        std::fs::create_dir_all(tmp.path().join("no-metadata")).unwrap();

        let mgr = QemuVmManager::new("qemu-system-x86_64", tmp.path()).unwrap();
        assert_eq!(mgr.recover().unwrap(), 1);
        assert_eq!(mgr.get("SBX-0A1B2C3D").unwrap().state, states::STOPPED);
    }
}
