/**
 * HOST STREAM - Côté kernel de la connexion WebSocket d'un hôte
 *
 * RÔLE :
 * Accepte la connexion d'un agent, l'authentifie, l'enregistre dans le
 * registry puis pompe ses messages jusqu'à la déconnexion.
 *
 * FONCTIONNEMENT :
 * - Token Bearer -> identité (org, host_id épinglé éventuel)
 * - Premier frame = Registration obligatoire, réponse RegistrationAck
 * - Une connexion plus ancienne du même hôte est annulée
 * - Un seul writer par connexion (HostLink -> frames texte)
 * - Boucle de réception : heartbeat -> registry, réponses -> correlator
 * - Snapshot du heartbeat dans le store : le premier, puis au plus un par
 *   HEARTBEAT_SNAPSHOT_INTERVAL, écrit hors du runtime (spawn_blocking)
 * - Moniteur heartbeat : vérification toutes les timeout/3 (min 10s),
 *   déconnexion après 3 retards consécutifs
 *
 * ORDRE DU NETTOYAGE : writer arrêté (même bloqué sur le socket), hôte retiré du registry s'il est encore
 * courant, requêtes en attente de la connexion échouées, hôte OFFLINE.
 */

use crate::config::{HostTokenConf, KernelConfig};
use crate::correlator::SharedCorrelator;
use crate::models::Host;
use crate::mqtt::{EventBus, KernelEvent};
use crate::registry::{ConnectedHost, HostLink, SharedHostRegistry};
use crate::store::SharedStore;
use axum::extract::ws::{Message, WebSocket};
use axum::http::HeaderMap;
use fluid_protocol::{ControlMessage, ControlPayload, Heartbeat, HostMessage, HostPayload, Registration, RegistrationAck};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Délai max pour recevoir le frame Registration
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_MISSED_HEARTBEATS: u32 = 3;
const MIN_HEARTBEAT_CHECK: Duration = Duration::from_secs(10);
/// Écart minimal entre deux écritures du heartbeat dans le store
pub const HEARTBEAT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
/// Délai accordé à la fermeture du socket par le writer
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct StreamHandler {
    registry: SharedHostRegistry,
    correlator: SharedCorrelator,
    store: SharedStore,
    events: EventBus,
    host_tokens: Arc<HashMap<String, HostTokenConf>>,
    heartbeat_timeout: Duration,
    next_conn_id: Arc<AtomicU64>,
}

/// Extrait le token de `Authorization: Bearer <token>`
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

impl StreamHandler {
    pub fn new(
        registry: SharedHostRegistry,
        correlator: SharedCorrelator,
        store: SharedStore,
        events: EventBus,
        config: &KernelConfig,
    ) -> Self {
        Self {
            registry,
            correlator,
            store,
            events,
            host_tokens: Arc::new(config.host_tokens.clone()),
            heartbeat_timeout: config.heartbeat_timeout(),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn heartbeat_check_interval(&self) -> Duration {
        (self.heartbeat_timeout / 3).max(MIN_HEARTBEAT_CHECK)
    }

    /// Adapte un WebSocket axum en flux de frames texte
    pub async fn handle_socket(self, socket: WebSocket, token: String) {
        let (sink, stream) = socket.split();
        let outbound = Box::pin(sink.with(|text: String| {
            future::ready(Ok::<Message, axum::Error>(Message::Text(text.into())))
        }));
        let inbound = Box::pin(
            stream
                .take_while(|m| future::ready(matches!(m, Ok(msg) if !matches!(msg, Message::Close(_)))))
                .filter_map(|m| {
                    future::ready(match m {
                        Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                        _ => None,
                    })
                }),
        );
        self.serve_connection(&token, outbound, inbound).await;
    }

    /// Sert une connexion hôte jusqu'à sa fermeture
    pub async fn serve_connection<S, R>(&self, token: &str, mut outbound: S, mut inbound: R)
    where
        S: Sink<String> + Unpin + Send + 'static,
        R: Stream<Item = String> + Unpin + Send,
    {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

        let first = match tokio::time::timeout(REGISTRATION_TIMEOUT, inbound.next()).await {
            Ok(Some(text)) => text,
            Ok(None) => {
                debug!("[stream] connection {} closed before registration", conn_id);
                return;
            }
            Err(_) => {
                warn!("[stream] connection {} sent no registration within {:?}", conn_id, REGISTRATION_TIMEOUT);
                return;
            }
        };

        let (request_id, registration) = match HostMessage::from_json(&first) {
            Ok(HostMessage { request_id, payload: HostPayload::Registration(reg) }) => (request_id, reg),
            Ok(other) => {
                warn!("[stream] first frame must be registration, got {}", other.payload.kind());
                return;
            }
            Err(e) => {
                warn!("[stream] invalid registration frame: {e}");
                return;
            }
        };

        let Some(identity) = self.host_tokens.get(token).filter(|_| !token.is_empty()).cloned() else {
            warn!("[stream] rejected host {} ({}): invalid host token", registration.host_id, registration.hostname);
            reject(&mut outbound, &request_id, "invalid host token").await;
            return;
        };

        // l'identité du token prime sur celle annoncée par l'agent
        let host_id = match identity.host_id.as_deref().filter(|id| !id.is_empty()) {
            Some(pinned) => {
                if pinned != registration.host_id {
                    warn!("[stream] host announced id {} but token pins {}, overriding", registration.host_id, pinned);
                }
                pinned.to_string()
            }
            None => registration.host_id.clone(),
        };
        if host_id.is_empty() {
            reject(&mut outbound, &request_id, "missing host id").await;
            return;
        }

        let ack = ControlMessage {
            request_id,
            payload: ControlPayload::RegistrationAck(RegistrationAck {
                accepted: true,
                reason: String::new(),
                assigned_host_id: host_id.clone(),
            }),
        };
        if send_frame(&mut outbound, &ack).await.is_err() {
            warn!("[stream] failed to send registration ack to {}", host_id);
            return;
        }

        let (link, mut link_rx) = HostLink::channel(conn_id);
        let cancel = link.cancellation();
        let connected = ConnectedHost::new(&host_id, &identity.org_id, &registration.hostname, link)
            .with_registration(registration.clone());
        match self.registry.register(connected) {
            Ok(Some(previous)) => {
                info!("[stream] host {} reconnected, closing connection {}", host_id, previous.link.conn_id());
                previous.link.close();
            }
            Ok(None) => {}
            Err(e) => {
                error!("[stream] failed to register host: {e}");
                return;
            }
        }
        self.persist_registration(&host_id, &identity.org_id, &registration);
        self.events.publish(KernelEvent::HostConnected {
            host_id: host_id.clone(),
            org_id: identity.org_id.clone(),
            hostname: registration.hostname.clone(),
        });
        info!(
            "[stream] host {} registered (org={}, cpus={}, memory={}MB, images={:?})",
            host_id, identity.org_id, registration.total_cpus, registration.total_memory_mb, registration.base_images
        );

        // writer unique de la connexion
        let writer_cancel = cancel.clone();
        let writer_host = host_id.clone();
        let writer = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    next = link_rx.recv() => match next {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                // un hôte qui ne lit plus ne doit pas bloquer le nettoyage
                let written = tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    written = send_frame(&mut outbound, &msg) => written,
                };
                if written.is_err() {
                    warn!("[stream] write to host {} failed", writer_host);
                    break;
                }
            }
            if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, outbound.close()).await.is_err() {
                debug!("[stream] closing socket of host {} timed out", writer_host);
            }
            writer_cancel.cancel();
        });

        let check_interval = self.heartbeat_check_interval();
        let mut check = tokio::time::interval_at(Instant::now() + check_interval, check_interval);
        let mut last_heartbeat = Instant::now();
        let mut last_snapshot: Option<Instant> = None;
        let mut missed = 0u32;

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break "connection closed by kernel",
                frame = inbound.next() => {
                    let Some(text) = frame else { break "stream closed by host" };
                    if let Some(hb) = self.handle_frame(&host_id, &text) {
                        last_heartbeat = Instant::now();
                        if last_snapshot.map_or(true, |at| at.elapsed() >= HEARTBEAT_SNAPSHOT_INTERVAL) {
                            last_snapshot = Some(last_heartbeat);
                            self.snapshot_heartbeat(&host_id, hb).await;
                        }
                    }
                }
                _ = check.tick() => {
                    let since = last_heartbeat.elapsed();
                    if since > self.heartbeat_timeout {
                        missed += 1;
                        warn!("[stream] host {} heartbeat overdue by {:?} ({} consecutive)",
                              host_id, since - self.heartbeat_timeout, missed);
                        if missed >= MAX_MISSED_HEARTBEATS {
                            error!("[stream] host {} missed {} heartbeats, disconnecting", host_id, missed);
                            break "heartbeat timeout";
                        }
                    } else {
                        missed = 0;
                    }
                }
            }
        };

        cancel.cancel();
        let _ = writer.await;

        let current = self.registry.unregister_if_current(&host_id, conn_id);
        self.correlator.fail_connection(&host_id, conn_id);
        if current {
            if let Err(e) = self.store.mark_host_offline(&host_id) {
                warn!("[stream] failed to mark host {} offline: {e}", host_id);
            }
            self.events.publish(KernelEvent::HostDisconnected {
                host_id: host_id.clone(),
                reason: reason.to_string(),
            });
            info!("[stream] host {} disconnected: {}", host_id, reason);
        } else {
            info!("[stream] connection {} of host {} replaced, skipping stale cleanup", conn_id, host_id);
        }
    }

    /// Traite un frame reçu. Renvoie le heartbeat s'il s'agissait d'un heartbeat.
    fn handle_frame(&self, host_id: &str, text: &str) -> Option<Heartbeat> {
        let msg = match HostMessage::from_json(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("[stream] undecodable frame from host {}: {e}", host_id);
                return None;
            }
        };

        match &msg.payload {
            HostPayload::Heartbeat(hb) => {
                self.registry.record_heartbeat(host_id, hb);
                Some(hb.clone())
            }
            HostPayload::Registration(_) => {
                warn!("[stream] host {} sent a second registration, ignoring", host_id);
                None
            }
            HostPayload::ErrorReport(report) if msg.request_id.is_empty() => {
                error!(
                    "[stream] host {} reported error: {} (sandbox={}, context={})",
                    host_id, report.error, report.sandbox_id, report.context
                );
                None
            }
            _ => {
                self.correlator.resolve(host_id, msg);
                None
            }
        }
    }

    /// Écrit le heartbeat dans le store sans bloquer le runtime. Attendu par
    /// la boucle de réception : il précède toujours le passage OFFLINE.
    async fn snapshot_heartbeat(&self, host_id: &str, hb: Heartbeat) {
        let store = self.store.clone();
        let id = host_id.to_string();
        let written = tokio::task::spawn_blocking(move || store.update_host_heartbeat(&id, &hb)).await;
        match written {
            Ok(Ok(())) => debug!("[stream] heartbeat snapshot of {} stored", host_id),
            Ok(Err(e)) => warn!("[stream] failed to persist heartbeat of {}: {e}", host_id),
            Err(e) => warn!("[stream] heartbeat snapshot task of {} failed: {e}", host_id),
        }
    }

    fn persist_registration(&self, host_id: &str, org_id: &str, reg: &Registration) {
        let host = Host::from_registration(host_id, org_id, reg);
        if let Err(e) = self.store.upsert_host(&host) {
            error!("[stream] failed to persist host {}: {e}", host_id);
        }
    }
}

async fn send_frame<S>(outbound: &mut S, msg: &ControlMessage) -> Result<(), ()>
where
    S: Sink<String> + Unpin,
{
    let text = msg.to_json().map_err(|e| error!("[stream] failed to encode {}: {e}", msg.payload.kind()))?;
    outbound.send(text).await.map_err(|_| ())
}

async fn reject<S>(outbound: &mut S, request_id: &str, reason: &str)
where
    S: Sink<String> + Unpin,
{
    let nack = ControlMessage {
        request_id: request_id.to_string(),
        payload: ControlPayload::RegistrationAck(RegistrationAck {
            accepted: false,
            reason: reason.to_string(),
            assigned_host_id: String::new(),
        }),
    };
    let _ = send_frame(outbound, &nack).await;
    let _ = outbound.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::correlator::{Correlator, CorrelatorError};
    use crate::models::HostStatus;
    use crate::registry::HostRegistry;
    use crate::store::{MemoryStore, Store};
    use fluid_protocol::SandboxRef;
    use futures::channel::mpsc;

    struct Kernel {
        handler: StreamHandler,
        registry: SharedHostRegistry,
        correlator: SharedCorrelator,
        store: Arc<MemoryStore>,
    }

    fn kernel(heartbeat_timeout_secs: u64) -> Kernel {
        let cfg = parse_config(&format!(
            "heartbeat_timeout_secs: {heartbeat_timeout_secs}\nhost_tokens:\n  tok:\n    org_id: org-1\n  pinned:\n    org_id: org-1\n    host_id: host-pinned\n"
        ))
        .unwrap();
        let registry = Arc::new(HostRegistry::new());
        let correlator = Arc::new(Correlator::new(registry.clone()));
        let store = Arc::new(MemoryStore::new());
        let handler = StreamHandler::new(registry.clone(), correlator.clone(), store.clone(), EventBus::disabled(), &cfg);
        Kernel { handler, registry, correlator, store }
    }

    struct FakeHost {
        to_kernel: mpsc::UnboundedSender<String>,
        from_kernel: mpsc::UnboundedReceiver<String>,
    }

    impl FakeHost {
        fn send(&self, msg: &HostMessage) {
            self.to_kernel.unbounded_send(msg.to_json().unwrap()).unwrap();
        }

        async fn recv(&mut self) -> Option<ControlMessage> {
            let text = self.from_kernel.next().await?;
            Some(ControlMessage::from_json(&text).unwrap())
        }
    }

    fn registration_frame(host_id: &str) -> String {
        HostMessage::new(
            "reg-1",
            HostPayload::Registration(Registration {
                host_id: host_id.into(),
                hostname: "box".into(),
                total_cpus: 8,
                total_memory_mb: 16384,
                available_cpus: 8,
                available_memory_mb: 16384,
                base_images: vec!["ubuntu".into()],
                ..Default::default()
            }),
        )
        .to_json()
        .unwrap()
    }

    fn spawn_connection(k: &Kernel, token: &str, host_id: &str) -> (FakeHost, tokio::task::JoinHandle<()>) {
        let (to_kernel, inbound) = mpsc::unbounded::<String>();
        let (outbound, from_kernel) = mpsc::unbounded::<String>();
        let handler = k.handler.clone();
        let token = token.to_string();
        let task = tokio::spawn(async move { handler.serve_connection(&token, outbound, inbound).await });
        let host = FakeHost { to_kernel, from_kernel };
        host.to_kernel.unbounded_send(registration_frame(host_id)).unwrap();
        (host, task)
    }

    fn heartbeat(cpus: u32, active: u32) -> HostMessage {
        HostMessage::new(
            "",
            HostPayload::Heartbeat(Heartbeat {
                available_cpus: cpus,
                available_memory_mb: 4096,
                available_disk_mb: 100,
                active_sandboxes: active,
                source_vm_count: 1,
            }),
        )
    }

    async fn wait_stored_cpus(k: &Kernel, host_id: &str, cpus: u32) {
        while k.store.get_host(host_id).unwrap().available_cpus != cpus {
            tokio::task::yield_now().await;
        }
    }

    fn ack(msg: &ControlMessage) -> &RegistrationAck {
        match &msg.payload {
            ControlPayload::RegistrationAck(ack) => ack,
            other => panic!("expected ack, got {:?}", other),
        }
    }

    async fn wait_registered(k: &Kernel, host_id: &str) {
        while !k.registry.contains(host_id) {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_registration_accepted_and_persisted() {
        let k = kernel(90);
        let (mut host, _task) = spawn_connection(&k, "tok", "host-a");

        let reply = host.recv().await.unwrap();
        assert_eq!(reply.request_id, "reg-1");
        assert!(ack(&reply).accepted);
        assert_eq!(ack(&reply).assigned_host_id, "host-a");

        wait_registered(&k, "host-a").await;
        assert_eq!(k.registry.lookup("host-a").unwrap().org_id, "org-1");
        assert_eq!(k.store.get_host("host-a").unwrap().status, HostStatus::Online);
    }

    #[tokio::test]
    async fn test_pinned_host_id_overrides_announced_one() {
        let k = kernel(90);
        let (mut host, _task) = spawn_connection(&k, "pinned", "whatever");
        let reply = host.recv().await.unwrap();
        assert_eq!(ack(&reply).assigned_host_id, "host-pinned");
        wait_registered(&k, "host-pinned").await;
        assert!(!k.registry.contains("whatever"));
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let k = kernel(90);
        let (mut host, task) = spawn_connection(&k, "bad-token", "host-a");
        let reply = host.recv().await.unwrap();
        assert!(!ack(&reply).accepted);
        assert!(!ack(&reply).reason.is_empty());
        task.await.unwrap();
        assert_eq!(k.registry.count(), 0);
        // connexion fermée par le kernel
        assert!(host.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_first_frame_must_be_registration() {
        let k = kernel(90);
        let (to_kernel, inbound) = mpsc::unbounded::<String>();
        let (outbound, mut from_kernel) = mpsc::unbounded::<String>();
        to_kernel
            .unbounded_send(HostMessage::new("", HostPayload::Heartbeat(Heartbeat::default())).to_json().unwrap())
            .unwrap();
        k.handler.serve_connection("tok", outbound, inbound).await;
        assert_eq!(k.registry.count(), 0);
        assert!(from_kernel.next().await.is_none());
    }

    #[tokio::test]
    async fn test_responses_resolve_and_close_tears_down() {
        let k = kernel(90);
        let (mut host, task) = spawn_connection(&k, "tok", "host-a");
        host.recv().await.unwrap();
        wait_registered(&k, "host-a").await;

        let call = {
            let correlator = k.correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send_and_wait(
                        "host-a",
                        ControlMessage::new(ControlPayload::DestroySandbox(SandboxRef { sandbox_id: "SBX-1".into() })),
                        Duration::from_secs(5),
                    )
                    .await
            })
        };
        let cmd = host.recv().await.unwrap();
        host.send(&HostMessage::new(
            cmd.request_id.clone(),
            HostPayload::SandboxDestroyed(SandboxRef { sandbox_id: "SBX-1".into() }),
        ));
        assert_eq!(call.await.unwrap().unwrap().payload.kind(), "sandbox_destroyed");

        // requête en vol puis fermeture du flux côté hôte
        let pending = {
            let correlator = k.correlator.clone();
            tokio::spawn(async move {
                correlator
                    .send_and_wait(
                        "host-a",
                        ControlMessage::new(ControlPayload::ListSourceVms),
                        Duration::from_secs(30),
                    )
                    .await
            })
        };
        host.recv().await.unwrap();
        drop(host);
        task.await.unwrap();

        assert!(matches!(pending.await.unwrap(), Err(CorrelatorError::Disconnected { .. })));
        assert!(!k.registry.contains("host-a"));
        assert_eq!(k.store.get_host("host-a").unwrap().status, HostStatus::Offline);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_old_connection() {
        let k = kernel(90);
        let (mut first, first_task) = spawn_connection(&k, "tok", "host-a");
        first.recv().await.unwrap();
        wait_registered(&k, "host-a").await;
        let first_conn = k.registry.link("host-a").unwrap().conn_id();

        let (mut second, _second_task) = spawn_connection(&k, "tok", "host-a");
        second.recv().await.unwrap();
        first_task.await.unwrap();

        // l'ancienne connexion n'a pas supprimé la nouvelle
        let current = k.registry.lookup("host-a").unwrap();
        assert_ne!(current.link.conn_id(), first_conn);
        assert_eq!(k.store.get_host("host-a").unwrap().status, HostStatus::Online);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_registry_and_store() {
        let k = kernel(90);
        let (mut host, _task) = spawn_connection(&k, "tok", "host-a");
        host.recv().await.unwrap();
        wait_registered(&k, "host-a").await;

        host.send(&heartbeat(3, 2));
        while k.registry.lookup("host-a").unwrap().active_sandboxes != 2 {
            tokio::task::yield_now().await;
        }
        // le premier heartbeat est toujours persisté
        wait_stored_cpus(&k, "host-a", 3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_snapshots_are_throttled() {
        let k = kernel(90);
        let (mut host, _task) = spawn_connection(&k, "tok", "host-a");
        host.recv().await.unwrap();
        wait_registered(&k, "host-a").await;

        host.send(&heartbeat(3, 1));
        wait_stored_cpus(&k, "host-a", 3).await;

        // deuxième heartbeat dans la fenêtre : registry à jour, store inchangé
        host.send(&heartbeat(5, 2));
        while k.registry.lookup("host-a").unwrap().active_sandboxes != 2 {
            tokio::task::yield_now().await;
        }
        assert_eq!(k.store.get_host("host-a").unwrap().available_cpus, 3);

        tokio::time::advance(HEARTBEAT_SNAPSHOT_INTERVAL + Duration::from_secs(1)).await;
        host.send(&heartbeat(7, 3));
        wait_stored_cpus(&k, "host-a", 7).await;
        assert_eq!(k.store.get_host("host-a").unwrap().status, HostStatus::Online);
    }

    #[tokio::test]
    async fn test_stalled_writer_does_not_block_teardown() {
        let k = kernel(90);
        let (to_kernel, inbound) = mpsc::unbounded::<String>();
        // canal sans tampon : le writer bloque dès que l'hôte arrête de lire
        let (outbound, mut from_kernel) = mpsc::channel::<String>(0);
        let handler = k.handler.clone();
        let task = tokio::spawn(async move { handler.serve_connection("tok", outbound, inbound).await });
        to_kernel.unbounded_send(registration_frame("host-a")).unwrap();
        assert!(from_kernel.next().await.is_some());
        wait_registered(&k, "host-a").await;

        let mut calls = Vec::new();
        for i in 0..3 {
            let correlator = k.correlator.clone();
            calls.push(tokio::spawn(async move {
                correlator
                    .send_and_wait(
                        "host-a",
                        ControlMessage::new(ControlPayload::DestroySandbox(SandboxRef { sandbox_id: format!("SBX-{i}") })),
                        Duration::from_secs(30),
                    )
                    .await
            }));
        }
        while k.correlator.pending_for("host-a") < 3 {
            tokio::task::yield_now().await;
        }

        // l'hôte ferme son flux sans jamais lire les commandes
        drop(to_kernel);
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("teardown must not wait on a stalled writer")
            .unwrap();

        assert!(!k.registry.contains("host-a"));
        assert_eq!(k.store.get_host("host-a").unwrap().status, HostStatus::Offline);
        for call in calls {
            assert!(matches!(call.await.unwrap(), Err(CorrelatorError::Disconnected { .. })));
        }
        drop(from_kernel);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeats_disconnect_host() {
        let k = kernel(30);
        assert_eq!(k.handler.heartbeat_check_interval(), Duration::from_secs(10));
        let (mut host, task) = spawn_connection(&k, "tok", "host-a");
        host.recv().await.unwrap();

        // aucun heartbeat : 3 vérifications en retard puis déconnexion
        task.await.unwrap();
        assert!(!k.registry.contains("host-a"));
        assert_eq!(k.store.get_host("host-a").unwrap().status, HostStatus::Offline);
    }
}
