use crate::cli::args::SimulateArgs;
use crate::core::clock::{Clock, ManualClock, SystemClock};
use crate::core::session::{PruneReport, PruningLoop, SessionRegistry, SessionSummary};
use crate::core::store::build_store;
use crate::core::transport::NullResourceFactory;
use crate::domain::config::{StoreBackend, TetherConfig};
use crate::domain::error::{TetherError, TetherResult};
use crate::domain::identity::{AccessDecision, UserIdClaim};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const SIMULATED_ISSUER: &str = "tether-simulate";

/// Outcome of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub backend: StoreBackend,
    pub instance_id: String,
    pub sessions_created: usize,
    pub requests: usize,
    pub allowed: usize,
    pub upgraded: usize,
    pub denied: usize,
    pub idle_after_workload: usize,
    pub prune_ticks: Vec<PruneReport>,
    /// Sessions whose id no longer resolves after pruning
    pub not_found_after_prune: usize,
    pub sessions_remaining: usize,
    pub idle_remaining: usize,
    pub elapsed_ms: u64,
    pub sessions: Vec<SessionSummary>,
}

#[derive(Default)]
struct Tally {
    allowed: AtomicUsize,
    upgraded: AtomicUsize,
    denied: AtomicUsize,
}

impl Tally {
    fn record(&self, decision: AccessDecision) {
        let counter = match decision {
            AccessDecision::Allow => &self.allowed,
            AccessDecision::Upgraded => &self.upgraded,
            AccessDecision::Deny => &self.denied,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Run the simulation described by `args` against a fresh registry.
///
/// Time is virtual: `advance_secs` moves a manual clock forward before the
/// pruning ticks, so expiry can be observed without waiting.
pub async fn run_simulation(
    config: &TetherConfig,
    args: &SimulateArgs,
) -> TetherResult<SimulationReport> {
    if args.workers == 0 || args.users == 0 {
        return Err(TetherError::InvalidInput(
            "workers and users must be at least 1".to_string(),
        ));
    }

    let started = Instant::now();
    let mut store_config = config.store.clone();
    if let Some(backend) = args.backend {
        store_config.backend = backend.into();
    }
    let mut pruning_config = config.pruning.clone();
    if let Some(secs) = args.idle_timeout_secs {
        pruning_config.idle_timeout_secs = secs;
    }

    let clock = Arc::new(ManualClock::new(SystemClock.now_millis()));
    let store = build_store(&store_config, clock.clone());
    let instance_id = store.instance_id().to_string();
    let registry = SessionRegistry::new(store, Arc::new(NullResourceFactory::new()), clock.clone());
    info!(
        backend = %store_config.backend,
        instance_id = %instance_id,
        sessions = args.sessions,
        "Starting simulation"
    );

    let mut sessions = Vec::with_capacity(args.sessions);
    for _ in 0..args.sessions {
        sessions.push(registry.create_session(None)?);
    }

    let tally = Arc::new(Tally::default());
    let mut workers = Vec::new();
    for (index, session) in sessions.iter().enumerate() {
        for worker in 0..args.workers {
            let share = args.requests / args.workers
                + usize::from(worker < args.requests % args.workers);
            let claim = UserIdClaim::new(
                "sub",
                format!("user-{}", (index + worker) % args.users),
                SIMULATED_ISSUER,
            );
            let registry = registry.clone();
            let session = Arc::clone(session);
            let tally = Arc::clone(&tally);
            workers.push(tokio::spawn(async move {
                for _ in 0..share {
                    let reference = session.acquire_reference().await?;
                    let decision = registry.authorize(&session, Some(&claim)).await?;
                    tally.record(decision);
                    tokio::task::yield_now().await;
                    drop(reference);
                }
                Ok::<(), TetherError>(())
            }));
        }
    }

    for worker in workers {
        worker
            .await
            .map_err(|e| TetherError::InvalidInput(format!("simulation worker failed: {}", e)))??;
    }
    let idle_after_workload = registry.idle_session_count();
    debug!(idle_after_workload, "Workload finished");

    clock.advance(Duration::from_secs(args.advance_secs));
    let pruner = PruningLoop::new(registry.clone(), &pruning_config);
    let mut prune_ticks = Vec::with_capacity(args.ticks);
    for _ in 0..args.ticks {
        prune_ticks.push(pruner.tick().await);
    }

    let mut not_found_after_prune = 0;
    for session in &sessions {
        match registry.resolve(session.id()).await {
            Ok(_) => {}
            Err(TetherError::SessionNotFound(_)) => not_found_after_prune += 1,
            Err(e) => return Err(e),
        }
    }

    let summaries = registry.list_sessions();
    let report = SimulationReport {
        backend: store_config.backend,
        instance_id,
        sessions_created: sessions.len(),
        requests: args.requests * sessions.len(),
        allowed: tally.allowed.load(Ordering::Relaxed),
        upgraded: tally.upgraded.load(Ordering::Relaxed),
        denied: tally.denied.load(Ordering::Relaxed),
        idle_after_workload,
        prune_ticks,
        not_found_after_prune,
        sessions_remaining: summaries.len(),
        idle_remaining: registry.idle_session_count(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        sessions: summaries,
    };

    registry.shutdown().await;
    Ok(report)
}
