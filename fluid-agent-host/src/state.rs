//! Local sandbox state
//!
//! What actually exists on this host, kept in a JSON file so destroy and
//! run-command still work after an agent restart.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSandbox {
    pub sandbox_id: String,
    pub name: String,
    #[serde(default)]
    pub agent_id: String,
    pub base_image: String,
    pub state: String,
    #[serde(default)]
    pub ip_address: String,
    pub mac_address: String,
    pub tap_device: String,
    pub bridge: String,
    pub overlay_path: PathBuf,
    pub kernel_path: PathBuf,
    pub vcpus: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub ttl_seconds: u64,
    pub created_at: DateTime<Utc>,
}

pub struct LocalState {
    path: Option<PathBuf>,
    sandboxes: Mutex<HashMap<String, LocalSandbox>>,
}

impl LocalState {
    pub fn in_memory() -> Self {
        Self { path: None, sandboxes: Mutex::new(HashMap::new()) }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let sandboxes = if path.exists() {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            if raw.trim().is_empty() {
                HashMap::new()
            } else {
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
            }
        } else {
            HashMap::new()
        };
        Ok(Self { path: Some(path), sandboxes: Mutex::new(sandboxes) })
    }

    fn persist(&self, sandboxes: &HashMap<String, LocalSandbox>) {
        let Some(path) = &self.path else { return };
        let write = || -> Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, serde_json::to_vec_pretty(sandboxes)?)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        };
        // Non fatal: the VM is already up, only recovery after restart is at stake
        if let Err(e) = write() {
            warn!("cannot persist local state to {}: {:#}", path.display(), e);
        }
    }

    pub fn put(&self, sandbox: LocalSandbox) {
        let mut sandboxes = self.sandboxes.lock();
        sandboxes.insert(sandbox.sandbox_id.clone(), sandbox);
        self.persist(&sandboxes);
    }

    pub fn get(&self, sandbox_id: &str) -> Option<LocalSandbox> {
        self.sandboxes.lock().get(sandbox_id).cloned()
    }

    pub fn remove(&self, sandbox_id: &str) -> Option<LocalSandbox> {
        let mut sandboxes = self.sandboxes.lock();
        let removed = sandboxes.remove(sandbox_id);
        if removed.is_some() {
            self.persist(&sandboxes);
        }
        removed
    }

    /// Applies `f` to a stored sandbox; false when unknown.
    pub fn update(&self, sandbox_id: &str, f: impl FnOnce(&mut LocalSandbox)) -> bool {
        let mut sandboxes = self.sandboxes.lock();
        let Some(sandbox) = sandboxes.get_mut(sandbox_id) else { return false };
        f(sandbox);
        self.persist(&sandboxes);
        true
    }

    pub fn list(&self) -> Vec<LocalSandbox> {
        self.sandboxes.lock().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.sandboxes.lock().len()
    }
}

#[cfg(test)]
pub(crate) fn sample(sandbox_id: &str) -> LocalSandbox {
    LocalSandbox {
        sandbox_id: sandbox_id.to_string(),
        name: "sbx-test".into(),
        agent_id: String::new(),
        base_image: "ubuntu".into(),
        state: fluid_protocol::states::RUNNING.into(),
        ip_address: "10.0.0.9".into(),
        mac_address: "52:54:00:00:00:01".into(),
        tap_device: "fl-test".into(),
        bridge: "virbr0".into(),
        overlay_path: PathBuf::from("/work/disk.qcow2"),
        kernel_path: PathBuf::from("/images/ubuntu.vmlinux"),
        vcpus: 1,
        memory_mb: 512,
        ttl_seconds: 0,
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/agent.json");

        let state = LocalState::open(&path).unwrap();
        state.put(sample("SBX-1"));
        state.put(sample("SBX-2"));
        assert!(state.update("SBX-1", |s| s.ip_address = "10.0.0.42".into()));
        assert!(!state.update("SBX-404", |_| {}));
        state.remove("SBX-2");

        let reopened = LocalState::open(&path).unwrap();
        assert_eq!(reopened.count(), 1);
        assert_eq!(reopened.get("SBX-1").unwrap().ip_address, "10.0.0.42");
        assert!(reopened.get("SBX-2").is_none());
    }

    #[test]
    fn test_in_memory_never_touches_disk() {
        let state = LocalState::in_memory();
        state.put(sample("SBX-1"));
        assert_eq!(state.list().len(), 1);
        assert!(state.remove("SBX-1").is_some());
        assert!(state.remove("SBX-1").is_none());
    }
}
