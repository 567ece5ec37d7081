use crate::core::session::registry::SessionRegistry;
use crate::domain::config::PruningConfig;
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one pruning tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Busy sessions whose stored metadata was touched
    pub refreshed: usize,
    /// Metadata records the store expired
    pub expired_metadata: usize,
    /// Resident idle sessions disposed
    pub disposed_sessions: usize,
}

impl PruneReport {
    pub fn is_empty(&self) -> bool {
        self.expired_metadata == 0 && self.disposed_sessions == 0
    }
}

/// Periodic sweep over a registry and its store.
///
/// Each tick heartbeats busy sessions, expires stale metadata, then disposes
/// long-idle resident sessions. The metadata and live-object sweeps are
/// independent: a failure in one does not skip the other.
#[derive(Debug, Clone)]
pub struct PruningLoop {
    registry: SessionRegistry,
    interval: Duration,
    idle_timeout: Duration,
    max_idle_sessions: usize,
}

impl PruningLoop {
    pub fn new(registry: SessionRegistry, config: &PruningConfig) -> Self {
        Self {
            registry,
            interval: config.interval(),
            idle_timeout: config.idle_timeout(),
            max_idle_sessions: config.max_idle_sessions,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Run a single sweep
    pub async fn tick(&self) -> PruneReport {
        let refreshed = self.registry.refresh_busy_sessions().await;

        let cancel = self.registry.shutdown_token();
        let expired_metadata = match self
            .registry
            .store()
            .prune_expired(self.idle_timeout, &cancel)
            .await
        {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Metadata pruning failed");
                0
            }
        };

        let disposed_sessions = self
            .registry
            .prune_idle_sessions(self.idle_timeout, self.max_idle_sessions)
            .await;

        let report = PruneReport {
            refreshed,
            expired_metadata,
            disposed_sessions,
        };
        if report.is_empty() {
            debug!(refreshed, "Pruning tick");
        } else {
            info!(
                refreshed,
                expired_metadata, disposed_sessions, "Pruning tick reclaimed resources"
            );
        }
        report
    }

    /// Run ticks until `cancel` fires or the registry shuts down
    pub async fn run(self, cancel: CancellationToken) {
        let shutdown = self.registry.shutdown_token();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(
            interval_ms = self.interval.as_millis() as u64,
            idle_timeout_secs = self.idle_timeout.as_secs(),
            "Pruning loop started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        info!("Pruning loop stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime
    pub fn spawn(self) -> PruningHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(self.run(cancel.clone()));
        PruningHandle { cancel, task }
    }
}

/// Handle to a spawned pruning loop
#[derive(Debug)]
pub struct PruningHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PruningHandle {
    /// Stop the loop and wait for the current tick to finish
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Pruning task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::session::state::SessionState;
    use crate::core::store::{LocalSessionStore, SessionStore, StoreOptions};
    use crate::core::transport::NullResourceFactory;
    use std::sync::Arc;

    fn create_test_loop(
        clock: Arc<ManualClock>,
        config: PruningConfig,
    ) -> (PruningLoop, SessionRegistry, Arc<LocalSessionStore>) {
        let store = Arc::new(LocalSessionStore::new(StoreOptions::default(), clock.clone()));
        let registry = SessionRegistry::new(
            store.clone(),
            Arc::new(NullResourceFactory::new()),
            clock,
        );
        (PruningLoop::new(registry.clone(), &config), registry, store)
    }

    fn short_timeout() -> PruningConfig {
        PruningConfig {
            interval_ms: 10,
            idle_timeout_secs: 60,
            max_idle_sessions: 100,
        }
    }

    #[tokio::test]
    async fn test_tick_reclaims_metadata_and_live_sessions() {
        let clock = Arc::new(ManualClock::new(0));
        let (pruner, registry, store) = create_test_loop(clock.clone(), short_timeout());
        let token = CancellationToken::new();

        let idle = registry.create_session(None).unwrap();
        idle.acquire_reference().await.unwrap().release();
        let busy = registry.create_session(None).unwrap();
        let _held = busy.acquire_reference().await.unwrap();

        clock.advance(Duration::from_secs(61));
        let report = pruner.tick().await;

        assert_eq!(report.refreshed, 1);
        assert_eq!(report.expired_metadata, 1);
        assert_eq!(report.disposed_sessions, 1);
        assert_eq!(idle.state(), SessionState::Disposed);
        assert!(!store.exists(idle.id(), &token).await.unwrap());
        // Heartbeat kept the busy record alive
        assert!(store.exists(busy.id(), &token).await.unwrap());
        assert_eq!(busy.state(), SessionState::Started);
    }

    #[tokio::test]
    async fn test_pruned_session_is_not_resurrected() {
        let clock = Arc::new(ManualClock::new(0));
        let (pruner, registry, _) = create_test_loop(clock.clone(), short_timeout());

        let session = registry.create_session(None).unwrap();
        session.acquire_reference().await.unwrap().release();
        let id = session.id().to_string();

        clock.advance(Duration::from_secs(120));
        pruner.tick().await;

        let result = registry.resolve(&id).await;
        assert!(matches!(
            result,
            Err(crate::domain::error::TetherError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_quiet_tick_reports_nothing() {
        let clock = Arc::new(ManualClock::new(0));
        let (pruner, registry, _) = create_test_loop(clock, short_timeout());
        registry
            .create_session(None)
            .unwrap()
            .acquire_reference()
            .await
            .unwrap()
            .release();

        let report = pruner.tick().await;
        assert!(report.is_empty());
        assert_eq!(report, PruneReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_loop_stops_on_request() {
        let clock = Arc::new(ManualClock::new(0));
        let (pruner, registry, _) = create_test_loop(clock.clone(), short_timeout());
        let session = registry.create_session(None).unwrap();
        session.acquire_reference().await.unwrap().release();
        clock.advance(Duration::from_secs(600));

        let handle = pruner.spawn();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(session.state(), SessionState::Disposed);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_loop_exits_on_registry_shutdown() {
        let clock = Arc::new(ManualClock::new(0));
        let (pruner, registry, _) = create_test_loop(clock, short_timeout());
        let handle = pruner.spawn();

        registry.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while !handle.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
