//! TTL enforcement
//!
//! Sweeps the local state on a fixed interval (first sweep right away) and
//! destroys every sandbox whose `created_at + ttl` is in the past. Sandboxes
//! created without a TTL get the configured default; a zero default keeps
//! them forever. A failed destroy is logged and retried on the next sweep,
//! it never stops the current one.
//!
//! The kernel learns about it through the next heartbeat's sandbox count; a
//! later destroy from the kernel is a no-op on this host.

use crate::handlers::CommandHandler;
use crate::state::{LocalSandbox, LocalState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tears down one expired sandbox.
#[async_trait]
pub trait Reaper: Send + Sync {
    async fn reap(&self, sandbox_id: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl Reaper for CommandHandler {
    async fn reap(&self, sandbox_id: &str) -> anyhow::Result<()> {
        Ok(self.expire(sandbox_id).await?)
    }
}

pub fn is_expired(sandbox: &LocalSandbox, default_ttl: Duration, now: DateTime<Utc>) -> bool {
    let ttl = if sandbox.ttl_seconds == 0 { default_ttl } else { Duration::from_secs(sandbox.ttl_seconds) };
    if ttl.is_zero() {
        return false;
    }
    // a TTL too large for chrono never expires
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| sandbox.created_at.checked_add_signed(ttl))
        .is_some_and(|deadline| deadline < now)
}

pub struct Janitor {
    state: Arc<LocalState>,
    reaper: Arc<dyn Reaper>,
    default_ttl: Duration,
}

impl Janitor {
    pub fn new(state: Arc<LocalState>, reaper: Arc<dyn Reaper>, default_ttl: Duration) -> Self {
        Self { state, reaper, default_ttl }
    }

    /// One pass over the local state. Returns the ids actually destroyed.
    pub async fn sweep(&self) -> Vec<String> {
        let now = Utc::now();
        let expired: Vec<LocalSandbox> =
            self.state.list().into_iter().filter(|s| is_expired(s, self.default_ttl, now)).collect();

        let mut reaped = Vec::new();
        for sandbox in expired {
            info!("sandbox {} expired (created {}, ttl {}s)", sandbox.sandbox_id, sandbox.created_at, sandbox.ttl_seconds);
            match self.reaper.reap(&sandbox.sandbox_id).await {
                Ok(()) => reaped.push(sandbox.sandbox_id),
                Err(e) => warn!("failed to destroy expired sandbox {}: {:#}", sandbox.sandbox_id, e),
            }
        }
        reaped
    }

    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("janitor started (every {:?}, default ttl {:?})", interval, self.default_ttl);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = self.sweep().await;
                    if !reaped.is_empty() {
                        info!("janitor destroyed {} expired sandbox(es)", reaped.len());
                    }
                }
            }
        }
        debug!("janitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::sample;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Removes the record like the real handler, or fails for chosen ids.
    struct FakeReaper {
        state: Arc<LocalState>,
        failing: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Reaper for FakeReaper {
        async fn reap(&self, sandbox_id: &str) -> anyhow::Result<()> {
            self.calls.lock().push(sandbox_id.to_string());
            if self.failing.contains(sandbox_id) {
                anyhow::bail!("qemu refused to die");
            }
            self.state.remove(sandbox_id);
            Ok(())
        }
    }

    fn setup(sandboxes: Vec<LocalSandbox>, failing: &[&str]) -> (Janitor, Arc<LocalState>, Arc<FakeReaper>) {
        let state = Arc::new(LocalState::in_memory());
        for s in sandboxes {
            state.put(s);
        }
        let reaper = Arc::new(FakeReaper {
            state: state.clone(),
            failing: failing.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        });
        let janitor = Janitor::new(state.clone(), reaper.clone(), Duration::from_secs(24 * 3600));
        (janitor, state, reaper)
    }

    fn aged(id: &str, ttl_seconds: u64, age_secs: i64) -> LocalSandbox {
        let mut s = sample(id);
        s.ttl_seconds = ttl_seconds;
        s.created_at = Utc::now() - chrono::Duration::seconds(age_secs);
        s
    }

    #[tokio::test]
    async fn test_expired_sandbox_is_destroyed() {
        let (janitor, state, reaper) = setup(vec![aged("SBX-old", 10, 11)], &[]);
        assert_eq!(janitor.sweep().await, vec!["SBX-old".to_string()]);
        assert!(state.get("SBX-old").is_none());
        assert_eq!(reaper.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_fresh_sandbox_is_kept() {
        let (janitor, state, reaper) = setup(vec![aged("SBX-new", 3600, 5)], &[]);
        assert!(janitor.sweep().await.is_empty());
        assert!(state.get("SBX-new").is_some());
        assert!(reaper.calls.lock().is_empty());
    }

    #[test]
    fn test_default_ttl_applies_when_unset() {
        let now = Utc::now();
        let two_days = aged("SBX-1", 0, 2 * 24 * 3600);
        assert!(is_expired(&two_days, Duration::from_secs(24 * 3600), now));
        assert!(!is_expired(&two_days, Duration::ZERO, now));
        // explicit TTL wins over the default
        assert!(!is_expired(&aged("SBX-2", 7 * 24 * 3600, 2 * 24 * 3600), Duration::from_secs(60), now));
        assert!(!is_expired(&aged("SBX-3", u64::MAX, 10), Duration::ZERO, now));
    }

    #[tokio::test]
    async fn test_destroy_error_does_not_stop_sweep() {
        let (janitor, state, reaper) = setup(vec![aged("SBX-a", 10, 60), aged("SBX-b", 10, 60)], &["SBX-a"]);
        assert_eq!(janitor.sweep().await, vec!["SBX-b".to_string()]);

        let mut calls = reaper.calls.lock().clone();
        calls.sort();
        assert_eq!(calls, vec!["SBX-a".to_string(), "SBX-b".to_string()]);
        // kept for the next sweep
        assert!(state.get("SBX-a").is_some());
        assert!(state.get("SBX-b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_immediately_and_stops_on_cancel() {
        let (janitor, state, _reaper) = setup(vec![aged("SBX-old", 10, 60)], &[]);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(janitor.run(Duration::from_secs(60), cancel.clone()));

        while state.count() != 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.expect("janitor must stop").unwrap();
    }
}
