//! Fluid Agent Host - runs sandbox microVMs for the Fluid kernel
//!
//! Connects out to the control plane, registers, then serves commands until
//! Ctrl-C. Reconnects with backoff whenever the session drops. A janitor
//! destroys expired sandboxes in the background.

use anyhow::{Context, Result};
use fluid_agent_host::client::AgentClient;
use fluid_agent_host::config::AgentConfig;
use fluid_agent_host::handlers::{CommandHandler, HandlerConfig};
use fluid_agent_host::janitor::Janitor;
use fluid_agent_host::managers::Managers;
use fluid_agent_host::reconnect::run_with_reconnect;
use fluid_agent_host::state::LocalState;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Time left to running commands (a create may need to roll back) on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fluid_agent_host=info")))
        .init();

    info!("Fluid Agent Host v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = AgentConfig::load().await.context("Failed to load agent config")?;
    if config.control_plane.token.is_empty() {
        warn!("no host token configured, the control plane will reject registration");
    }

    let managers = Managers::from_config(&config);
    let state = Arc::new(LocalState::open(&config.state.path).context("Failed to open local state")?);
    info!("{} sandboxes in local state", state.count());

    let handler = CommandHandler::new(managers, state.clone(), HandlerConfig::from_agent(&config));
    let janitor = Janitor::new(state, Arc::new(handler.clone()), config.janitor.default_ttl());
    let janitor_interval = config.janitor.interval();
    let client = AgentClient::new(config, handler);

    let cancel = CancellationToken::new();
    let janitor_task = tokio::spawn(janitor.run(janitor_interval, cancel.clone()));
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        shutdown.cancel();
    });

    run_with_reconnect(cancel.clone(), || {
        let client = client.clone();
        let cancel = cancel.clone();
        async move { client.connect_and_serve(cancel).await }
    })
    .await;

    if !client.drain(SHUTDOWN_GRACE).await {
        warn!("{} command(s) still running after {:?}, exiting anyway", client.in_flight(), SHUTDOWN_GRACE);
    }
    if let Err(e) = janitor_task.await {
        warn!("janitor task failed: {e}");
    }
    info!("Fluid Agent Host stopped");
    Ok(())
}
