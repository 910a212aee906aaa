//! Reconnection loop with exponential backoff
//!
//! Delays go 1s, 2s, 4s ... capped at 60s. A session that stayed up for at
//! least five minutes resets the delay. Cancellation is honored both while
//! connected and while waiting.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const STABLE_SESSION: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { current: INITIAL_BACKOFF }
    }
}

impl Backoff {
    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

/// Calls `session` until `cancel` fires. Each call is one full connection
/// attempt (connect, register, serve); its error only drives the backoff.
pub async fn run_with_reconnect<F, Fut>(cancel: CancellationToken, mut session: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut backoff = Backoff::default();
    loop {
        let started = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => return,
            result = session() => result,
        };

        if started.elapsed() >= STABLE_SESSION {
            backoff.reset();
        }
        let delay = backoff.next_delay();
        match result {
            Ok(()) => info!("control plane session ended, reconnecting in {:?}", delay),
            Err(e) => warn!("control plane session failed: {:#}, retrying in {:?}", e, delay),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
