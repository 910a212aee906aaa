/*!
Harness kernel <-> agent en mémoire

Un kernel complet (registry, correlator, store mémoire, orchestrateur) et des
agents reliés par des canaux `futures::mpsc` à la place du WebSocket. Le
kernel sert la connexion avec `StreamHandler::serve_connection`, l'agent avec
`AgentClient::session` : seul le transport est simulé.
*/

use crate::fakes::FakeHost;
use anyhow::{bail, Result};
use fluid_agent_host::client::AgentClient;
use fluid_agent_host::config::AgentConfig;
use fluid_agent_host::state::LocalState;
use fluid_kernel::config::{HostTokenConf, KernelConfig};
use fluid_kernel::correlator::{Correlator, SharedCorrelator};
use fluid_kernel::mqtt::EventBus;
use fluid_kernel::orchestrator::{Orchestrator, SharedOrchestrator};
use fluid_kernel::registry::{HostRegistry, SharedHostRegistry};
use fluid_kernel::store::{MemoryStore, SharedStore};
use fluid_kernel::stream::StreamHandler;
use futures::channel::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const TEST_TOKEN: &str = "tok-devkit";
pub const TEST_ORG: &str = "org-devkit";

pub struct KernelHarness {
    pub config: KernelConfig,
    pub registry: SharedHostRegistry,
    pub correlator: SharedCorrelator,
    pub store: SharedStore,
    pub stream: StreamHandler,
    pub orchestrator: SharedOrchestrator,
}

impl Default for KernelHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelHarness {
    pub fn new() -> Self {
        let mut config = KernelConfig::default();
        config
            .host_tokens
            .insert(TEST_TOKEN.to_string(), HostTokenConf { org_id: TEST_ORG.to_string(), host_id: None });

        let registry: SharedHostRegistry = Arc::new(HostRegistry::new());
        let correlator: SharedCorrelator = Arc::new(Correlator::new(registry.clone()));
        let store: SharedStore = Arc::new(MemoryStore::new());
        let stream = StreamHandler::new(registry.clone(), correlator.clone(), store.clone(), EventBus::disabled(), &config);
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            correlator.clone(),
            store.clone(),
            EventBus::disabled(),
            config.default_ttl(),
            config.heartbeat_timeout(),
        ));
        Self { config, registry, correlator, store, stream, orchestrator }
    }

    /// Connecte un agent en mémoire et attend son enregistrement
    pub async fn connect_agent(&self, host_id: &str, host: &FakeHost) -> Result<AgentHandle> {
        self.connect_agent_with_token(host_id, host, TEST_TOKEN).await
    }

    pub async fn connect_agent_with_token(&self, host_id: &str, host: &FakeHost, token: &str) -> Result<AgentHandle> {
        let state = Arc::new(LocalState::in_memory());
        let mut agent_config = AgentConfig::default();
        agent_config.host_id = host_id.to_string();
        let client = AgentClient::new(agent_config, host.handler(state.clone()));
        let session_client = client.clone();
        debug!("[harness] connecting agent {}", host_id);

        // kernel -> agent et agent -> kernel
        let (to_agent, agent_inbound) = mpsc::unbounded::<String>();
        let (to_kernel, kernel_inbound) = mpsc::unbounded::<String>();

        let stream = self.stream.clone();
        let token = token.to_string();
        let kernel = tokio::spawn(async move { stream.serve_connection(&token, to_agent, kernel_inbound).await });

        let cancel = CancellationToken::new();
        let agent_cancel = cancel.clone();
        let agent = tokio::spawn(async move { session_client.session(to_kernel, agent_inbound, agent_cancel).await });

        let handle = AgentHandle { host_id: host_id.to_string(), state, client, cancel, agent, kernel };
        for _ in 0..200 {
            if self.registry.contains(host_id) {
                info!("[harness] agent {} registered", host_id);
                return Ok(handle);
            }
            if handle.agent.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let host_id = handle.host_id.clone();
        warn!("[harness] agent {} did not register", host_id);
        match handle.shutdown().await {
            Err(e) => bail!("agent {host_id} failed to register: {e:#}"),
            Ok(()) => bail!("agent {host_id} not registered"),
        }
    }
}

pub struct AgentHandle {
    pub host_id: String,
    pub state: Arc<LocalState>,
    client: AgentClient,
    cancel: CancellationToken,
    agent: JoinHandle<Result<()>>,
    kernel: JoinHandle<()>,
}

impl AgentHandle {
    /// Client de l'agent, utile pour attendre les commandes encore en cours
    pub fn client(&self) -> AgentClient {
        self.client.clone()
    }

    /// Arrête l'agent ; le kernel voit le flux se fermer et nettoie.
    /// Les commandes déjà lancées continuent (voir `AgentClient::drain`).
    pub async fn shutdown(self) -> Result<()> {
        debug!("[harness] shutting down agent {}", self.host_id);
        self.cancel.cancel();
        let outcome = match self.agent.await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };
        let _ = self.kernel.await;
        outcome
    }
}
