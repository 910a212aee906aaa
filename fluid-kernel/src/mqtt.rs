/**
 * EVENTS MQTT - Publication des événements de cycle de vie du kernel
 *
 * RÔLE :
 * Diffuse hôtes connectés/déconnectés et sandboxes créées/détruites, plus le
 * health kernel périodique, vers un broker MQTT optionnel.
 *
 * FONCTIONNEMENT :
 * - EventBus (Clone) : émission non bloquante depuis stream et orchestrateur
 * - Sans broker configuré : bus désactivé, les événements sont ignorés
 * - Une seule task possède le client rumqttc : select! sur événements,
 *   intervalle health (30s) et poll de l'eventloop
 */

use crate::config::MqttConf;
use crate::correlator::SharedCorrelator;
use crate::health::HealthTracker;
use crate::registry::SharedHostRegistry;
use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 256;
pub const HEALTH_TOPIC: &str = "fluid/kernel/health@v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KernelEvent {
    HostConnected { host_id: String, org_id: String, hostname: String },
    HostDisconnected { host_id: String, reason: String },
    SandboxCreated { sandbox_id: String, org_id: String, host_id: String },
    SandboxDestroyed { sandbox_id: String, org_id: String, host_id: String },
}

impl KernelEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            KernelEvent::HostConnected { .. } => "fluid/hosts/connected@v1",
            KernelEvent::HostDisconnected { .. } => "fluid/hosts/disconnected@v1",
            KernelEvent::SandboxCreated { .. } => "fluid/sandboxes/created@v1",
            KernelEvent::SandboxDestroyed { .. } => "fluid/sandboxes/destroyed@v1",
        }
    }

    /// Corps publié : l'événement + horodatage RFC3339
    pub fn to_payload(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            let ts = OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default();
            obj.insert("timestamp".into(), serde_json::Value::String(ts));
        }
        serde_json::to_string(&value)
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    tx: Option<mpsc::Sender<KernelEvent>>,
}

impl EventBus {
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::Receiver<KernelEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn publish(&self, event: KernelEvent) {
        let Some(tx) = &self.tx else { return };
        // jamais bloquant : un bus saturé perd l'événement
        if let Err(e) = tx.try_send(event) {
            debug!("[events] dropped event: {e}");
        }
    }
}

pub fn spawn_event_publisher(
    conf: MqttConf,
    mut events: mpsc::Receiver<KernelEvent>,
    health_tracker: HealthTracker,
    registry: SharedHostRegistry,
    correlator: SharedCorrelator,
) {
    task::spawn(async move {
        let mut opts = MqttOptions::new("fluid-kernel", &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        info!("[events] publishing to mqtt://{}:{}", conf.host, conf.port);

        let mut interval = tokio::time::interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    let Some(event) = maybe_event else {
                        info!("[events] bus closed, stopping publisher");
                        break;
                    };
                    match event.to_payload() {
                        Ok(payload) => {
                            if let Err(e) = client.publish(event.topic(), QoS::AtLeastOnce, false, payload).await {
                                warn!("[events] failed to publish {}: {:?}", event.topic(), e);
                            }
                        }
                        Err(e) => error!("[events] failed to encode event: {e}"),
                    }
                },
                _ = interval.tick() => {
                    let health = health_tracker.get_health(&registry, &correlator);
                    if let Ok(payload) = serde_json::to_string(&health) {
                        if let Err(e) = client.publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload).await {
                            warn!("[health] failed to publish: {:?}", e);
                        } else {
                            debug!("[health] published kernel health (uptime: {}s, hosts: {})",
                                   health.uptime_seconds, health.hosts_connected);
                        }
                    }
                },
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(rumqttc::Incoming::ConnAck(_))) => health_tracker.mark_mqtt_connected(),
                        Ok(_) => {}
                        Err(e) => {
                            warn!("[events] MQTT error: {:?}", e);
                            health_tracker.increment_reconnects();
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_topics_and_payload() {
        let event = KernelEvent::SandboxCreated {
            sandbox_id: "SBX-1".into(),
            org_id: "org".into(),
            host_id: "h1".into(),
        };
        assert_eq!(event.topic(), "fluid/sandboxes/created@v1");
        let value: serde_json::Value = serde_json::from_str(&event.to_payload().unwrap()).unwrap();
        assert_eq!(value["event"], "sandbox_created");
        assert_eq!(value["sandbox_id"], "SBX-1");
        assert!(value["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_bus_channel_and_disabled() {
        EventBus::disabled().publish(KernelEvent::HostDisconnected { host_id: "h".into(), reason: "x".into() });

        let (bus, mut rx) = EventBus::channel();
        bus.publish(KernelEvent::HostDisconnected { host_id: "h1".into(), reason: "closed".into() });
        assert_eq!(rx.recv().await.unwrap().topic(), "fluid/hosts/disconnected@v1");
    }
}
