/**
 * FILE STORE - Store durable sur fichier JSON
 *
 * FONCTIONNEMENT :
 * - Cache mémoire protégé par un Mutex, chargé au démarrage
 * - Chaque mutation réécrit le fichier (écriture dans un .tmp puis rename)
 * - Le cache n'est modifié qu'après une écriture réussie
 * - Fichier absent => store vide, créé à la première écriture
 */

use super::{Store, StoreData, StoreError};
use crate::models::{Command, Host, Sandbox};
use fluid_protocol::Heartbeat;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct FileStore {
    storage_path: PathBuf,
    cache: Mutex<StoreData>,
}

impl FileStore {
    pub fn open<P: Into<PathBuf>>(storage_path: P) -> Result<Self, StoreError> {
        let path = storage_path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = Self::load_from_disk(&path)?;
        info!(
            "[store] opened {:?} ({} sandboxes, {} hosts)",
            path,
            data.sandboxes.len(),
            data.hosts.len()
        );
        Ok(Self { storage_path: path, cache: Mutex::new(data) })
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    fn load_from_disk(path: &Path) -> Result<StoreData, StoreError> {
        if !path.exists() {
            return Ok(StoreData::default());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(StoreData::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn save_to_disk(&self, data: &StoreData) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(data)?;
        let tmp = self.storage_path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.storage_path)?;
        Ok(())
    }

    /// Applique la mutation sur une copie, persiste, puis remplace le cache.
    /// Une écriture ratée laisse le cache identique au fichier.
    fn mutate<R>(&self, f: impl FnOnce(&mut StoreData) -> Result<R, StoreError>) -> Result<R, StoreError> {
        let mut cache = self.cache.lock();
        let mut next = cache.clone();
        let out = f(&mut next)?;
        self.save_to_disk(&next)?;
        *cache = next;
        Ok(out)
    }
}

impl Store for FileStore {
    fn create_sandbox(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
        self.mutate(|d| d.create_sandbox(sandbox))
    }

    fn update_sandbox(&self, sandbox: &Sandbox) -> Result<(), StoreError> {
        self.mutate(|d| d.update_sandbox(sandbox))
    }

    fn get_sandbox(&self, id: &str, org_id: &str) -> Result<Sandbox, StoreError> {
        self.cache.lock().get_sandbox(id, org_id)
    }

    fn list_sandboxes(&self, org_id: &str) -> Result<Vec<Sandbox>, StoreError> {
        Ok(self.cache.lock().list_sandboxes(org_id))
    }

    fn delete_sandbox(&self, id: &str, org_id: &str) -> Result<(), StoreError> {
        self.mutate(|d| d.delete_sandbox(id, org_id))
    }

    fn count_sandboxes_by_host(&self, host_ids: &[String]) -> Result<HashMap<String, usize>, StoreError> {
        Ok(self.cache.lock().count_sandboxes_by_host(host_ids))
    }

    fn create_command(&self, command: &Command) -> Result<(), StoreError> {
        self.mutate(|d| {
            d.create_command(command);
            Ok(())
        })
    }

    fn list_commands(&self, sandbox_id: &str) -> Result<Vec<Command>, StoreError> {
        Ok(self.cache.lock().list_commands(sandbox_id))
    }

    fn upsert_host(&self, host: &Host) -> Result<(), StoreError> {
        self.mutate(|d| {
            d.upsert_host(host);
            Ok(())
        })
    }

    fn get_host(&self, id: &str) -> Result<Host, StoreError> {
        self.cache.lock().get_host(id)
    }

    fn list_hosts(&self, org_id: &str) -> Result<Vec<Host>, StoreError> {
        Ok(self.cache.lock().list_hosts(org_id))
    }

    fn update_host_heartbeat(&self, id: &str, heartbeat: &Heartbeat) -> Result<(), StoreError> {
        self.mutate(|d| d.update_host_heartbeat(id, heartbeat))
    }

    fn mark_host_offline(&self, id: &str) -> Result<(), StoreError> {
        self.mutate(|d| d.mark_host_offline(id))
    }
}
