/**
 * HOST REGISTRY - Table en mémoire des hôtes actuellement connectés
 *
 * RÔLE : Autorité unique pour "cet hôte est-il joignable ?". Chaque entrée
 * possède le lien d'envoi (HostLink) de la connexion active de l'hôte.
 *
 * FONCTIONNEMENT :
 * - register : ajoute ou remplace l'entrée (reconnexion), renvoie l'ancienne
 * - unregister_if_current : ne supprime que si la connexion est toujours la même
 * - lookup / list / list_by_org : copies des entrées, jamais de verrou exposé
 *
 * Pas de persistance : un hôte absent du registry est "offline".
 */

use fluid_protocol::{ControlMessage, Heartbeat, Registration};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Taille du tampon d'écriture d'une connexion
pub const LINK_BUFFER: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("host id must not be empty")]
    EmptyHostId,
}

#[derive(Debug, thiserror::Error)]
#[error("connection {0} is closed")]
pub struct LinkClosed(pub u64);

/// Handle d'envoi vers une connexion hôte. Toutes les écritures passent par
/// un seul canal consommé par l'unique writer de la connexion.
#[derive(Debug, Clone)]
pub struct HostLink {
    conn_id: u64,
    tx: mpsc::Sender<ControlMessage>,
    cancel: CancellationToken,
}

impl HostLink {
    pub fn new(conn_id: u64, tx: mpsc::Sender<ControlMessage>, cancel: CancellationToken) -> Self {
        Self { conn_id, tx, cancel }
    }

    /// Crée un lien et le récepteur que le writer de la connexion doit drainer
    pub fn channel(conn_id: u64) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(LINK_BUFFER);
        (Self::new(conn_id, tx, CancellationToken::new()), rx)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Attend une place dans le tampon. La fermeture du lien débloque l'envoi.
    pub async fn send(&self, msg: ControlMessage) -> Result<(), LinkClosed> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LinkClosed(self.conn_id)),
            sent = self.tx.send(msg) => sent.map_err(|_| LinkClosed(self.conn_id)),
        }
    }

    /// Demande la fermeture de la connexion
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectedHost {
    pub host_id: String,
    pub org_id: String,
    pub hostname: String,
    pub link: HostLink,
    pub registration: Option<Registration>,
    pub last_heartbeat: OffsetDateTime,
    pub connected_at: OffsetDateTime,
    pub active_sandboxes: u32,
    pub source_vm_count: u32,
}

impl ConnectedHost {
    pub fn new(host_id: &str, org_id: &str, hostname: &str, link: HostLink) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            host_id: host_id.to_string(),
            org_id: org_id.to_string(),
            hostname: hostname.to_string(),
            link,
            registration: None,
            last_heartbeat: now,
            connected_at: now,
            active_sandboxes: 0,
            source_vm_count: 0,
        }
    }

    pub fn with_registration(mut self, reg: Registration) -> Self {
        self.source_vm_count = reg.source_vms.len() as u32;
        self.registration = Some(reg);
        self
    }
}

#[derive(Default)]
pub struct HostRegistry {
    hosts: RwLock<HashMap<String, ConnectedHost>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute ou remplace un hôte. Renvoie l'entrée remplacée (connexion périmée).
    pub fn register(&self, host: ConnectedHost) -> Result<Option<ConnectedHost>, RegistryError> {
        if host.host_id.is_empty() {
            return Err(RegistryError::EmptyHostId);
        }
        let previous = self.hosts.write().insert(host.host_id.clone(), host);
        Ok(previous)
    }

    pub fn unregister(&self, host_id: &str) -> Option<ConnectedHost> {
        self.hosts.write().remove(host_id)
    }

    /// Supprime l'hôte seulement si conn_id correspond encore à la connexion enregistrée
    pub fn unregister_if_current(&self, host_id: &str, conn_id: u64) -> bool {
        let mut hosts = self.hosts.write();
        match hosts.get(host_id) {
            Some(h) if h.link.conn_id() == conn_id => {
                hosts.remove(host_id);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, host_id: &str) -> Option<ConnectedHost> {
        self.hosts.read().get(host_id).cloned()
    }

    pub fn link(&self, host_id: &str) -> Option<HostLink> {
        self.hosts.read().get(host_id).map(|h| h.link.clone())
    }

    pub fn contains(&self, host_id: &str) -> bool {
        self.hosts.read().contains_key(host_id)
    }

    pub fn list(&self) -> Vec<ConnectedHost> {
        self.hosts.read().values().cloned().collect()
    }

    pub fn list_by_org(&self, org_id: &str) -> Vec<ConnectedHost> {
        self.hosts
            .read()
            .values()
            .filter(|h| h.org_id == org_id)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn set_registration(&self, host_id: &str, reg: Registration) {
        if let Some(h) = self.hosts.write().get_mut(host_id) {
            h.source_vm_count = reg.source_vms.len() as u32;
            h.registration = Some(reg);
            h.last_heartbeat = OffsetDateTime::now_utc();
        }
    }

    /// Met à jour horodatage, compteurs et ressources disponibles depuis un heartbeat
    pub fn record_heartbeat(&self, host_id: &str, hb: &Heartbeat) -> bool {
        let mut hosts = self.hosts.write();
        let Some(h) = hosts.get_mut(host_id) else {
            return false;
        };
        h.last_heartbeat = OffsetDateTime::now_utc();
        h.active_sandboxes = hb.active_sandboxes;
        h.source_vm_count = hb.source_vm_count;
        if let Some(reg) = h.registration.as_mut() {
            reg.available_cpus = hb.available_cpus;
            reg.available_memory_mb = hb.available_memory_mb;
            reg.available_disk_mb = hb.available_disk_mb;
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn set_last_heartbeat(&self, host_id: &str, at: OffsetDateTime) {
        if let Some(h) = self.hosts.write().get_mut(host_id) {
            h.last_heartbeat = at;
        }
    }
}

pub type SharedHostRegistry = Arc<HostRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn host(id: &str, org: &str, conn_id: u64) -> (ConnectedHost, mpsc::Receiver<ControlMessage>) {
        let (link, rx) = HostLink::channel(conn_id);
        (ConnectedHost::new(id, org, "box", link), rx)
    }

    #[test]
    fn test_register_lookup_list() {
        let registry = HostRegistry::new();
        let (a, _ra) = host("h1", "org-a", 1);
        let (b, _rb) = host("h2", "org-b", 2);
        assert!(registry.register(a).unwrap().is_none());
        assert!(registry.register(b).unwrap().is_none());

        assert_eq!(registry.count(), 2);
        assert_eq!(registry.lookup("h1").unwrap().org_id, "org-a");
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.list_by_org("org-b").len(), 1);
        assert!(registry.list_by_org("org-c").is_empty());
    }

    #[test]
    fn test_empty_host_id_rejected() {
        let registry = HostRegistry::new();
        let (h, _rx) = host("", "org", 1);
        assert_eq!(registry.register(h).unwrap_err(), RegistryError::EmptyHostId);
    }

    #[test]
    fn test_reconnect_replaces_and_stale_cleanup_is_noop() {
        let registry = HostRegistry::new();
        let (old, _r1) = host("h1", "org", 1);
        let (new, _r2) = host("h1", "org", 2);
        registry.register(old).unwrap();
        let replaced = registry.register(new).unwrap().expect("previous entry");
        assert_eq!(replaced.link.conn_id(), 1);

        // nettoyage de l'ancienne connexion : ne doit pas supprimer la nouvelle
        assert!(!registry.unregister_if_current("h1", 1));
        assert_eq!(registry.link("h1").unwrap().conn_id(), 2);
        assert!(registry.unregister_if_current("h1", 2));
        assert!(!registry.contains("h1"));
    }

    #[test]
    fn test_record_heartbeat_updates_resources() {
        let registry = HostRegistry::new();
        let (h, _rx) = host("h1", "org", 1);
        registry.register(h.with_registration(Registration {
            host_id: "h1".into(),
            available_cpus: 8,
            available_memory_mb: 16384,
            ..Default::default()
        })).unwrap();

        let hb = Heartbeat {
            available_cpus: 2,
            available_memory_mb: 1024,
            available_disk_mb: 10,
            active_sandboxes: 3,
            source_vm_count: 1,
        };
        assert!(registry.record_heartbeat("h1", &hb));
        assert!(!registry.record_heartbeat("ghost", &hb));

        let h = registry.lookup("h1").unwrap();
        assert_eq!(h.active_sandboxes, 3);
        assert_eq!(h.registration.unwrap().available_cpus, 2);
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let registry = Arc::new(HostRegistry::new());
        let mut tasks = Vec::new();
        for i in 0..32u64 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (link, _rx) = HostLink::channel(i);
                registry.register(ConnectedHost::new(&format!("h{i}"), "org", "box", link)).unwrap();
                registry.lookup(&format!("h{i}")).is_some()
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap());
        }
        assert_eq!(registry.count(), 32);
    }

    #[tokio::test]
    async fn test_link_send_after_close_fails() {
        let (link, mut rx) = HostLink::channel(7);
        link.send(ControlMessage::new(fluid_protocol::ControlPayload::ListSourceVms)).await.unwrap();
        assert!(rx.recv().await.is_some());
        link.close();
        assert!(link.is_closed());
        assert!(link.send(ControlMessage::new(fluid_protocol::ControlPayload::ListSourceVms)).await.is_err());
    }

    #[tokio::test]
    async fn test_close_releases_blocked_send() {
        let (link, _rx) = HostLink::channel(8);
        for _ in 0..LINK_BUFFER {
            link.send(ControlMessage::new(fluid_protocol::ControlPayload::ListSourceVms)).await.unwrap();
        }

        let blocked = {
            let link = link.clone();
            tokio::spawn(async move {
                link.send(ControlMessage::new(fluid_protocol::ControlPayload::ListSourceVms)).await
            })
        };
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        link.close();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), blocked)
            .await
            .expect("send must return once the link is closed")
            .unwrap();
        assert!(result.is_err());
    }
}
