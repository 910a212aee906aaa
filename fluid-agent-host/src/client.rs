//! Control plane client
//!
//! One session walks Connecting -> Registering -> Serving:
//! - Connecting: WebSocket to the kernel with `Authorization: Bearer <token>`
//! - Registering: send `Registration`, wait up to 30s for the ack, adopt the
//!   host id the kernel assigns
//! - Serving: heartbeats on a fixed interval, one task per inbound command,
//!   every reply through a single writer task
//!
//! Any transport failure ends the session; `reconnect` decides what's next.
//! Command tasks outlive the session that started them: a create that was
//! already running finishes or rolls back, only its reply is lost. Commands
//! still queued for a permit are skipped. `drain` waits for the stragglers.

use crate::config::AgentConfig;
use crate::discovery;
use crate::handlers::CommandHandler;
use anyhow::{anyhow, bail, Context, Result};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use fluid_protocol::{new_request_id, peek_request_id, ControlMessage, ControlPayload, HostMessage, HostPayload, RegistrationAck};
use parking_lot::RwLock;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const REGISTRATION_ACK_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_CONCURRENT_COMMANDS: usize = 64;
const OUTBOUND_BUFFER: usize = 256;
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the upgrade request with the host token attached.
pub fn connect_request(url: &str, token: &str) -> Result<tungstenite::handshake::client::Request> {
    let mut request = url.into_client_request().with_context(|| format!("invalid control plane url {url}"))?;
    if !token.is_empty() {
        let value = HeaderValue::from_str(&format!("Bearer {token}")).context("invalid host token")?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

#[derive(Clone)]
pub struct AgentClient {
    config: Arc<RwLock<AgentConfig>>,
    handler: CommandHandler,
    in_flight: TaskTracker,
}

impl AgentClient {
    pub fn new(config: AgentConfig, handler: CommandHandler) -> Self {
        Self { config: Arc::new(RwLock::new(config)), handler, in_flight: TaskTracker::new() }
    }

    /// Command handlers currently running or waiting for a permit.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Waits up to `grace` for every command handler to finish. Returns
    /// false if some were still running when the grace period ran out.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.in_flight.close();
        let drained = tokio::time::timeout(grace, self.in_flight.wait()).await.is_ok();
        self.in_flight.reopen();
        drained
    }

    /// Host id in use: the one assigned by the kernel, else the hostname.
    pub fn host_id(&self) -> String {
        let configured = self.config.read().host_id.clone();
        if configured.is_empty() {
            discovery::hostname()
        } else {
            configured
        }
    }

    /// One full session against the configured control plane.
    pub async fn connect_and_serve(&self, cancel: CancellationToken) -> Result<()> {
        let (url, token) = {
            let config = self.config.read();
            (config.control_plane.url.clone(), config.control_plane.token.clone())
        };
        let request = connect_request(&url, &token)?;

        info!("connecting to control plane at {}", url);
        let (socket, _) = connect_async(request).await.with_context(|| format!("connecting to {url}"))?;
        let (ws_tx, ws_rx) = socket.split();

        let outbound = Box::pin(
            ws_tx.with(|text: String| future::ready(Ok::<WsMessage, tungstenite::Error>(WsMessage::Text(text.into())))),
        );
        let inbound = Box::pin(
            ws_rx
                .take_while(|m| future::ready(matches!(m, Ok(msg) if !matches!(msg, WsMessage::Close(_)))))
                .filter_map(|m| {
                    future::ready(match m {
                        Ok(WsMessage::Text(text)) => Some(text.as_str().to_owned()),
                        _ => None,
                    })
                }),
        );
        self.session(outbound, inbound, cancel).await
    }

    /// Registers then serves over any pair of text frame channels.
    pub async fn session<S, R>(&self, mut outbound: S, mut inbound: R, cancel: CancellationToken) -> Result<()>
    where
        S: Sink<String> + Unpin + Send + 'static,
        S::Error: Display + Send,
        R: Stream<Item = String> + Unpin,
    {
        // ============ REGISTERING ============
        let work_dir = self.config.read().microvm.work_dir.clone();
        let registration = discovery::build_registration(&self.host_id(), self.handler.managers(), &work_dir).await;
        let reg = HostMessage::new(new_request_id(), HostPayload::Registration(registration));
        outbound
            .send(reg.to_json()?)
            .await
            .map_err(|e| anyhow!("sending registration: {e}"))?;

        let ack = tokio::time::timeout(REGISTRATION_ACK_TIMEOUT, wait_for_ack(&mut inbound))
            .await
            .map_err(|_| anyhow!("no registration ack within {:?}", REGISTRATION_ACK_TIMEOUT))??;
        if !ack.accepted {
            bail!("registration rejected: {}", ack.reason);
        }
        self.adopt_host_id(&ack.assigned_host_id).await;
        info!("registered with control plane as {}", self.host_id());

        // ============ SERVING ============
        let session = cancel.child_token();
        let (tx, mut rx) = mpsc::channel::<HostMessage>(OUTBOUND_BUFFER);

        let writer_session = session.clone();
        let writer = tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = writer_session.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                let text = match msg.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("failed to encode {}: {}", msg.payload.kind(), e);
                        continue;
                    }
                };
                let written = tokio::select! {
                    _ = writer_session.cancelled() => break,
                    written = outbound.send(text) => written,
                };
                if let Err(e) = written {
                    warn!("write to control plane failed: {}", e);
                    break;
                }
            }
            if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, outbound.close()).await.is_err() {
                debug!("closing control plane socket timed out");
            }
            writer_session.cancel();
        });

        let period = self.config.read().heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_COMMANDS));

        let reason = loop {
            tokio::select! {
                _ = session.cancelled() => break "session cancelled",
                frame = inbound.next() => {
                    let Some(text) = frame else { break "stream closed by kernel" };
                    self.dispatch(&text, &tx, &permits, &session);
                }
                _ = heartbeat.tick() => {
                    let hb = discovery::build_heartbeat(self.handler.managers(), self.handler.state(), &work_dir).await;
                    if tx.send(HostMessage::new("", HostPayload::Heartbeat(hb))).await.is_err() {
                        break "heartbeat send failed";
                    }
                }
            }
        };

        session.cancel();
        drop(tx);
        let _ = writer.await;
        if !self.in_flight.is_empty() {
            info!("{} command(s) still running after session end, letting them finish", self.in_flight.len());
        }

        if cancel.is_cancelled() {
            info!("control plane session stopped");
            Ok(())
        } else {
            Err(anyhow!("{reason}"))
        }
    }

    fn dispatch(
        &self,
        text: &str,
        tx: &mpsc::Sender<HostMessage>,
        permits: &Arc<Semaphore>,
        session: &CancellationToken,
    ) {
        let msg = match ControlMessage::from_json(text) {
            Ok(ControlMessage { payload: ControlPayload::RegistrationAck(_), .. }) => {
                debug!("ignoring registration ack while serving");
                return;
            }
            Ok(msg) => msg,
            Err(e) => {
                match peek_request_id(text) {
                    Some(request_id) => {
                        let reply = HostMessage::error_report(request_id, "", format!("invalid command: {e}"));
                        if tx.try_send(reply).is_err() {
                            warn!("dropping error report for undecodable command");
                        }
                    }
                    None => warn!("undecodable frame from control plane: {}", e),
                }
                return;
            }
        };

        let handler = self.handler.clone();
        let tx = tx.clone();
        let permits = permits.clone();
        let session = session.clone();
        self.in_flight.spawn(async move {
            let acquired = tokio::select! {
                _ = session.cancelled() => {
                    debug!("session ended before {} started, skipping it", msg.payload.kind());
                    return;
                }
                acquired = permits.acquire_owned() => acquired,
            };
            let Ok(_permit) = acquired else { return };
            // not tied to the session: a started command always completes
            let reply = handler.handle(msg).await;
            if tx.send(reply).await.is_err() {
                debug!("session closed before reply could be sent");
            }
        });
    }

    async fn adopt_host_id(&self, assigned: &str) {
        if assigned.is_empty() {
            return;
        }
        let snapshot = {
            let mut config = self.config.write();
            if config.host_id == assigned {
                return;
            }
            info!("control plane assigned host id {}", assigned);
            config.host_id = assigned.to_string();
            config.clone()
        };
        if snapshot.source_path.is_some() {
            if let Err(e) = snapshot.save().await {
                warn!("failed to persist assigned host id: {:#}", e);
            }
        }
    }
}

async fn wait_for_ack<R>(inbound: &mut R) -> Result<RegistrationAck>
where
    R: Stream<Item = String> + Unpin,
{
    while let Some(text) = inbound.next().await {
        match ControlMessage::from_json(&text) {
            Ok(ControlMessage { payload: ControlPayload::RegistrationAck(ack), .. }) => return Ok(ack),
            Ok(other) => debug!("ignoring {} before registration ack", other.payload.kind()),
            Err(e) => warn!("undecodable frame before registration ack: {}", e),
        }
    }
    bail!("connection closed during registration")
}
