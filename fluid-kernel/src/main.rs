/**
 * FLUID KERNEL - Point d'entrée du plan de contrôle
 *
 * RÔLE : Bootstrap config, store, registre d'hôtes, corrélateur, orchestrateur,
 * publication d'événements MQTT (optionnelle) et serveur HTTP/WebSocket.
 *
 * UTILITÉ : Point unique auquel se connectent les agents hôtes et les clients API.
 */

use anyhow::Context;
use fluid_kernel::config::load_config;
use fluid_kernel::correlator::Correlator;
use fluid_kernel::health::HealthTracker;
use fluid_kernel::http::{build_router, AppState};
use fluid_kernel::mqtt::{spawn_event_publisher, EventBus};
use fluid_kernel::orchestrator::Orchestrator;
use fluid_kernel::registry::HostRegistry;
use fluid_kernel::store::{FileStore, MemoryStore, SharedStore};
use fluid_kernel::stream::StreamHandler;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;
    if cfg.host_tokens.is_empty() {
        warn!("[kernel] aucun host token configuré, tous les hôtes seront refusés");
    }

    // store : fichier JSON si data_dir, sinon mémoire
    let store: SharedStore = match &cfg.data_dir {
        Some(dir) => {
            let path = Path::new(dir).join("fluid.json");
            let file = FileStore::open(&path).with_context(|| format!("opening store {}", path.display()))?;
            info!("[kernel] store persistant: {}", path.display());
            Arc::new(file)
        }
        None => {
            info!("[kernel] store en mémoire (pas de data_dir)");
            Arc::new(MemoryStore::new())
        }
    };

    let registry = Arc::new(HostRegistry::new());
    let correlator = Arc::new(Correlator::new(registry.clone()));
    let health_tracker = HealthTracker::new();

    // événements : MQTT si configuré
    let events = match cfg.mqtt.clone() {
        Some(conf) => {
            let (bus, rx) = EventBus::channel();
            spawn_event_publisher(conf, rx, health_tracker.clone(), registry.clone(), correlator.clone());
            bus
        }
        None => EventBus::disabled(),
    };

    let orchestrator = Arc::new(Orchestrator::new(
        registry.clone(),
        correlator.clone(),
        store.clone(),
        events.clone(),
        cfg.default_ttl(),
        cfg.heartbeat_timeout(),
    ));
    let stream = StreamHandler::new(registry.clone(), correlator.clone(), store, events, &cfg);

    let app_state = AppState {
        orchestrator,
        stream,
        registry,
        correlator,
        health_tracker,
        api_key: std::env::var("FLUID_API_KEY").unwrap_or_default(),
    };
    let app = build_router(app_state);

    let listener = TcpListener::bind(&cfg.listen_addr)
        .await
        .with_context(|| format!("binding {}", cfg.listen_addr))?;
    info!("[kernel] listening on http://{}", cfg.listen_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
