/**
 * REQUEST CORRELATOR - Appel/réponse au-dessus du flux d'un hôte
 *
 * RÔLE :
 * Transforme la connexion orientée flux en abstraction requête/réponse :
 * chaque ControlMessage porte un request_id, un waiter est parqué, et la
 * réponse HostMessage portant le même request_id le débloque.
 *
 * FONCTIONNEMENT :
 * - send_and_wait : résout le lien via le registry (échec immédiat si absent),
 *   parque un oneshot, envoie sur le lien puis attend la réponse. L'envoi et
 *   l'attente partagent la même échéance : un lien saturé finit en Timeout
 * - resolve : appelé par la boucle de réception de la connexion
 * - fail_host : échoue tous les waiters d'un hôte déconnecté
 *
 * GARANTIE : exactement un résultat par appel. L'entrée en attente est retirée
 * une seule fois (réponse, timeout, déconnexion ou abandon de l'appelant).
 */

use crate::registry::SharedHostRegistry;
use fluid_protocol::{ControlMessage, HostMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CorrelatorError {
    #[error("host {0} is not connected")]
    HostNotConnected(String),
    #[error("control message must have a request_id")]
    MissingRequestId,
    #[error("request {0} is already in flight")]
    DuplicateRequest(String),
    #[error("host {host_id} disconnected before answering request {request_id}")]
    Disconnected { host_id: String, request_id: String },
    #[error("timeout waiting for response from host {host_id} (request_id={request_id})")]
    Timeout { host_id: String, request_id: String },
}

struct Pending {
    seq: u64,
    host_id: String,
    conn_id: u64,
    tx: oneshot::Sender<HostMessage>,
}

type PendingMap = Arc<Mutex<HashMap<String, Pending>>>;

pub struct Correlator {
    registry: SharedHostRegistry,
    /// Map des requêtes en attente : request_id -> waiter
    pending: PendingMap,
    next_seq: AtomicU64,
}

/// Retire l'entrée en attente si elle appartient encore à cet appel
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    request_id: String,
    seq: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        if pending.get(&self.request_id).map(|p| p.seq) == Some(self.seq) {
            pending.remove(&self.request_id);
        }
    }
}

impl Correlator {
    pub fn new(registry: SharedHostRegistry) -> Self {
        Self {
            registry,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &SharedHostRegistry {
        &self.registry
    }

    /// Envoie une commande à un hôte et attend la réponse corrélée
    pub async fn send_and_wait(
        &self,
        host_id: &str,
        msg: ControlMessage,
        timeout: Duration,
    ) -> Result<HostMessage, CorrelatorError> {
        let link = self
            .registry
            .link(host_id)
            .ok_or_else(|| CorrelatorError::HostNotConnected(host_id.to_string()))?;

        if msg.request_id.is_empty() {
            return Err(CorrelatorError::MissingRequestId);
        }
        let request_id = msg.request_id.clone();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&request_id) {
                return Err(CorrelatorError::DuplicateRequest(request_id));
            }
            pending.insert(
                request_id.clone(),
                Pending { seq, host_id: host_id.to_string(), conn_id: link.conn_id(), tx },
            );
        }
        let _guard = PendingGuard { pending: &self.pending, request_id: request_id.clone(), seq };

        debug!("[correlator] sending {} to host {} (request_id={})", msg.payload.kind(), host_id, request_id);
        let exchange = async {
            // lien fermé ou sender abandonné (fail_host) : même issue
            link.send(msg).await.map_err(|_| ())?;
            rx.await.map_err(|_| ())
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(())) => Err(CorrelatorError::Disconnected {
                host_id: host_id.to_string(),
                request_id,
            }),
            Err(_) => {
                warn!("[correlator] timeout waiting for host {} (request_id={})", host_id, request_id);
                Err(CorrelatorError::Timeout {
                    host_id: host_id.to_string(),
                    request_id,
                })
            }
        }
    }

    /// Livre une réponse reçue de `host_id`. Renvoie false si personne n'attendait.
    pub fn resolve(&self, host_id: &str, msg: HostMessage) -> bool {
        if msg.request_id.is_empty() {
            warn!("[correlator] {} from host {} without request_id, dropping", msg.payload.kind(), host_id);
            return false;
        }

        let waiter = {
            let mut pending = self.pending.lock();
            match pending.get(&msg.request_id) {
                Some(p) if p.host_id == host_id => pending.remove(&msg.request_id),
                Some(p) => {
                    warn!(
                        "[correlator] host {} answered request {} owned by host {}, dropping",
                        host_id, msg.request_id, p.host_id
                    );
                    return false;
                }
                None => None,
            }
        };

        match waiter {
            Some(p) => {
                let request_id = msg.request_id.clone();
                if p.tx.send(msg).is_err() {
                    debug!("[correlator] waiter for {} already gone", request_id);
                }
                true
            }
            None => {
                warn!(
                    "[correlator] no pending request for {} from host {} (request_id={}), discarding",
                    msg.payload.kind(), host_id, msg.request_id
                );
                false
            }
        }
    }

    /// Échoue toutes les requêtes en attente d'un hôte (déconnexion)
    pub fn fail_host(&self, host_id: &str) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        // drop des senders => les waiters reçoivent une erreur de canal
        pending.retain(|_, p| p.host_id != host_id);
        let failed = before - pending.len();
        if failed > 0 {
            warn!("[correlator] failed {} pending request(s) for disconnected host {}", failed, host_id);
        }
        failed
    }

    /// Échoue les requêtes envoyées sur une connexion précise. Une reconnexion
    /// de l'hôte n'est pas affectée par le nettoyage de l'ancienne connexion.
    pub fn fail_connection(&self, host_id: &str, conn_id: u64) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, p| !(p.host_id == host_id && p.conn_id == conn_id));
        let failed = before - pending.len();
        if failed > 0 {
            warn!(
                "[correlator] failed {} pending request(s) for host {} (connection {})",
                failed, host_id, conn_id
            );
        }
        failed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_for(&self, host_id: &str) -> usize {
        self.pending.lock().values().filter(|p| p.host_id == host_id).count()
    }
}

pub type SharedCorrelator = Arc<Correlator>;
