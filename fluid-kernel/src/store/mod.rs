/**
 * STORE - Persistance durable des sandboxes, commandes et hôtes
 *
 * RÔLE :
 * Le store décrit ce qui DOIT exister. L'état local des hôtes décrit ce qui
 * existe réellement ; l'orchestrateur réconcilie les deux à chaque appel.
 *
 * FONCTIONNEMENT :
 * - Store trait = interface commune (synchrone, verrous jamais tenus sur un .await)
 * - Toutes les lectures de sandbox sont filtrées par organisation
 * - Suppression logique : deleted_at + état DESTROYED, invisible ensuite
 * - MemoryStore : tout en mémoire (tests, kernel sans data_dir)
 * - FileStore : même contenu sérialisé en JSON (voir file.rs)
 */

mod file;

pub use file::FileStore;

use crate::models::{Command, Host, HostStatus, Sandbox, SandboxState};
use fluid_protocol::Heartbeat;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait Store: Send + Sync {
    fn create_sandbox(&self, sandbox: &Sandbox) -> Result<(), StoreError>;
    fn update_sandbox(&self, sandbox: &Sandbox) -> Result<(), StoreError>;
    /// NotFound si la sandbox appartient à une autre org ou est supprimée
    fn get_sandbox(&self, id: &str, org_id: &str) -> Result<Sandbox, StoreError>;
    fn list_sandboxes(&self, org_id: &str) -> Result<Vec<Sandbox>, StoreError>;
    fn delete_sandbox(&self, id: &str, org_id: &str) -> Result<(), StoreError>;
    /// Nombre de sandboxes non supprimées par hôte
    fn count_sandboxes_by_host(&self, host_ids: &[String]) -> Result<HashMap<String, usize>, StoreError>;

    fn create_command(&self, command: &Command) -> Result<(), StoreError>;
    fn list_commands(&self, sandbox_id: &str) -> Result<Vec<Command>, StoreError>;

    fn upsert_host(&self, host: &Host) -> Result<(), StoreError>;
    fn get_host(&self, id: &str) -> Result<Host, StoreError>;
    fn list_hosts(&self, org_id: &str) -> Result<Vec<Host>, StoreError>;
    fn update_host_heartbeat(&self, id: &str, heartbeat: &Heartbeat) -> Result<(), StoreError>;
    fn mark_host_offline(&self, id: &str) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn Store>;

/// Contenu complet du store (sérialisé tel quel par FileStore)
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct StoreData {
    #[serde(default)]
    sandboxes: HashMap<String, Sandbox>,
    #[serde(default)]
    commands: Vec<Command>,
    #[serde(default)]
    hosts: HashMap<String, Host>,
}

impl StoreData {
    fn live_sandbox(&self, id: &str, org_id: &str) -> Option<&Sandbox> {
        self.sandboxes
            .get(id)
            .filter(|s| s.org_id == org_id && s.deleted_at.is_none())
    }

    fn create_sandbox(&mut self, sandbox: &Sandbox) -> Result<(), StoreError> {
        if self.sandboxes.contains_key(&sandbox.id) {
            return Err(StoreError::Conflict(format!("sandbox {}", sandbox.id)));
        }
        self.sandboxes.insert(sandbox.id.clone(), sandbox.clone());
        Ok(())
    }

    fn update_sandbox(&mut self, sandbox: &Sandbox) -> Result<(), StoreError> {
        if self.live_sandbox(&sandbox.id, &sandbox.org_id).is_none() {
            return Err(StoreError::NotFound(format!("sandbox {}", sandbox.id)));
        }
        let mut updated = sandbox.clone();
        updated.updated_at = OffsetDateTime::now_utc();
        self.sandboxes.insert(updated.id.clone(), updated);
        Ok(())
    }

    fn get_sandbox(&self, id: &str, org_id: &str) -> Result<Sandbox, StoreError> {
        self.live_sandbox(id, org_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("sandbox {id}")))
    }

    fn list_sandboxes(&self, org_id: &str) -> Vec<Sandbox> {
        let mut list: Vec<Sandbox> = self
            .sandboxes
            .values()
            .filter(|s| s.org_id == org_id && s.deleted_at.is_none())
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    fn delete_sandbox(&mut self, id: &str, org_id: &str) -> Result<(), StoreError> {
        let sandbox = self
            .sandboxes
            .get_mut(id)
            .filter(|s| s.org_id == org_id && s.deleted_at.is_none())
            .ok_or_else(|| StoreError::NotFound(format!("sandbox {id}")))?;
        let now = OffsetDateTime::now_utc();
        sandbox.state = SandboxState::Destroyed;
        sandbox.deleted_at = Some(now);
        sandbox.updated_at = now;
        Ok(())
    }

    fn count_sandboxes_by_host(&self, host_ids: &[String]) -> HashMap<String, usize> {
        let mut counts: HashMap<String, usize> = host_ids.iter().map(|id| (id.clone(), 0)).collect();
        for sandbox in self.sandboxes.values().filter(|s| s.deleted_at.is_none()) {
            if let Some(n) = counts.get_mut(&sandbox.host_id) {
                *n += 1;
            }
        }
        counts
    }

    fn create_command(&mut self, command: &Command) {
        self.commands.push(command.clone());
    }

    fn list_commands(&self, sandbox_id: &str) -> Vec<Command> {
        let mut list: Vec<Command> = self
            .commands
            .iter()
            .filter(|c| c.sandbox_id == sandbox_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        list
    }

    fn upsert_host(&mut self, host: &Host) {
        let mut host = host.clone();
        // created_at conservé sur ré-enregistrement
        if let Some(existing) = self.hosts.get(&host.id) {
            host.created_at = existing.created_at;
        }
        host.updated_at = OffsetDateTime::now_utc();
        self.hosts.insert(host.id.clone(), host);
    }

    fn get_host(&self, id: &str) -> Result<Host, StoreError> {
        self.hosts
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("host {id}")))
    }

    fn list_hosts(&self, org_id: &str) -> Vec<Host> {
        let mut list: Vec<Host> = self.hosts.values().filter(|h| h.org_id == org_id).cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    fn update_host_heartbeat(&mut self, id: &str, hb: &Heartbeat) -> Result<(), StoreError> {
        let host = self
            .hosts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("host {id}")))?;
        let now = OffsetDateTime::now_utc();
        host.available_cpus = hb.available_cpus;
        host.available_memory_mb = hb.available_memory_mb;
        host.available_disk_mb = hb.available_disk_mb;
        host.status = HostStatus::Online;
        host.last_heartbeat = now;
        host.updated_at = now;
        Ok(())
    }

    fn mark_host_offline(&mut self, id: &str) -> Result<(), StoreError> {
        let host = self
            .hosts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("host {id}")))?;
        host.status = HostStatus::Offline;
        host.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }
}

/// Store purement en mémoire
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn create_sandbox(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
        self.data.lock().create_sandbox(sandbox)
    }

    fn update_sandbox(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
        self.data.lock().update_sandbox(sandbox)
    }

    fn get_sandbox(&self, id: &str, org_id: &str) -> Result<Sandbox, StoreError> {
        self.data.lock().get_sandbox(id, org_id)
    }

    fn list_sandboxes(&self, org_id: &str) -> Result<Vec<Sandbox>, StoreError> {
        Ok(self.data.lock().list_sandboxes(org_id))
    }

    fn delete_sandbox(&self, id: &str, org_id: &str) -> Result<(), StoreError> {
        self.data.lock().delete_sandbox(id, org_id)
    }

    fn count_sandboxes_by_host(&self, host_ids: &[String]) -> Result<HashMap<String, usize>, StoreError> {
        Ok(self.data.lock().count_sandboxes_by_host(host_ids))
    }

    fn create_command(&self, command: &Command) -> Result<(), StoreError> {
        self.data.lock().create_command(command);
        Ok(())
    }

    fn list_commands(&self, sandbox_id: &str) -> Result<Vec<Command>, StoreError> {
        Ok(self.data.lock().list_commands(sandbox_id))
    }

    fn upsert_host(&self, host: &Host) -> Result<(), StoreError> {
        self.data.lock().upsert_host(host);
        Ok(())
    }

    fn get_host(&self, id: &str) -> Result<Host, StoreError> {
        self.data.lock().get_host(id)
    }

    fn list_hosts(&self, org_id: &str) -> Result<Vec<Host>, StoreError> {
        Ok(self.data.lock().list_hosts(org_id))
    }

    fn update_host_heartbeat(&self, id: &str, heartbeat: &Heartbeat) -> Result<(), StoreError> {
        self.data.lock().update_host_heartbeat(id, heartbeat)
    }

    fn mark_host_offline(&self, id: &str) -> Result<(), StoreError> {
        self.data.lock().mark_host_offline(id)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sandbox(id: &str, org: &str, host: &str) -> Sandbox {
        let now = OffsetDateTime::now_utc();
        Sandbox {
            id: id.into(),
            org_id: org.into(),
            host_id: host.into(),
            name: format!("sbx-{id}"),
            agent_id: String::new(),
            base_image: "ubuntu".into(),
            bridge: String::new(),
            tap_device: String::new(),
            mac_address: String::new(),
            ip_address: String::new(),
            state: SandboxState::Pending,
            vcpus: 2,
            memory_mb: 2048,
            ttl_seconds: 0,
            source_vm: String::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    #[test]
    fn test_sandbox_lookups_are_org_scoped() {
        let store = MemoryStore::new();
        store.create_sandbox(&sandbox("SBX-1", "org-a", "h1")).unwrap();

        assert!(store.get_sandbox("SBX-1", "org-a").is_ok());
        assert!(matches!(store.get_sandbox("SBX-1", "org-b"), Err(StoreError::NotFound(_))));
        assert!(store.list_sandboxes("org-b").unwrap().is_empty());
        assert!(matches!(store.delete_sandbox("SBX-1", "org-b"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_hides_sandbox() {
        let store = MemoryStore::new();
        store.create_sandbox(&sandbox("SBX-1", "org", "h1")).unwrap();
        store.create_sandbox(&sandbox("SBX-2", "org", "h1")).unwrap();
        store.delete_sandbox("SBX-1", "org").unwrap();

        assert!(store.get_sandbox("SBX-1", "org").is_err());
        assert_eq!(store.list_sandboxes("org").unwrap().len(), 1);
        let counts = store.count_sandboxes_by_host(&["h1".into(), "h2".into()]).unwrap();
        assert_eq!(counts["h1"], 1);
        assert_eq!(counts["h2"], 0);
        // deuxième suppression : NotFound
        assert!(store.delete_sandbox("SBX-1", "org").is_err());
    }

    #[test]
    fn test_duplicate_sandbox_conflicts() {
        let store = MemoryStore::new();
        store.create_sandbox(&sandbox("SBX-1", "org", "h1")).unwrap();
        assert!(matches!(
            store.create_sandbox(&sandbox("SBX-1", "org", "h1")),
            Err(StoreError::Conflict(_))
        ));
    }

    #[test]
    fn test_host_lifecycle() {
        let store = MemoryStore::new();
        let reg = fluid_protocol::Registration {
            host_id: "h1".into(),
            hostname: "box".into(),
            available_cpus: 8,
            ..Default::default()
        };
        store.upsert_host(&Host::from_registration("h1", "org", &reg)).unwrap();
        store
            .update_host_heartbeat("h1", &Heartbeat { available_cpus: 3, ..Default::default() })
            .unwrap();
        assert_eq!(store.get_host("h1").unwrap().available_cpus, 3);

        store.mark_host_offline("h1").unwrap();
        assert_eq!(store.get_host("h1").unwrap().status, HostStatus::Offline);
        assert_eq!(store.list_hosts("org").unwrap().len(), 1);
        assert!(store.mark_host_offline("ghost").is_err());
    }
}
