use crate::core::clock::{duration_millis, Clock};
use crate::core::session::session::{Session, SessionObserver};
use crate::core::session::state::{SessionState, SessionSummary};
use crate::core::store::SessionStore;
use crate::core::transport::ResourceFactory;
use crate::domain::error::{TetherError, TetherResult};
use crate::domain::identity::{AccessDecision, UserIdClaim};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Owns the live sessions of this process and the running idle count.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

struct RegistryShared {
    sessions: DashMap<String, Arc<Session>>,
    /// Started sessions with zero references; moved only on the 0↔1 edges
    idle_count: AtomicUsize,
    store: Arc<dyn SessionStore>,
    factory: Arc<dyn ResourceFactory>,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        store: Arc<dyn SessionStore>,
        factory: Arc<dyn ResourceFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                sessions: DashMap::new(),
                idle_count: AtomicUsize::new(0),
                store,
                factory,
                clock,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.shared.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }

    /// Fires once `shutdown` has been called
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Create a brand-new session with a fresh id.
    ///
    /// Stateless sessions are handed to the caller without being registered;
    /// the caller disposes them when its request completes.
    pub fn create_session(&self, identity: Option<UserIdClaim>) -> TetherResult<Arc<Session>> {
        self.ensure_running()?;

        let session_id = Uuid::new_v4().simple().to_string();
        let resources = self.shared.factory.create(&session_id)?;
        let session = Arc::new(Session::new(
            session_id.clone(),
            resources,
            identity,
            self.observer(),
            Arc::clone(&self.shared.clock),
        ));

        if !session.is_stateless() {
            self.shared
                .sessions
                .insert(session_id.clone(), Arc::clone(&session));
        }
        session.spawn_run();

        info!(
            session_id = %session_id,
            user_id = ?session.user_id(),
            stateless = session.is_stateless(),
            "Session created"
        );
        Ok(session)
    }

    /// Find the live session for `session_id`, recovering it from the store
    /// when another instance (or an earlier incarnation of this one) owned it.
    ///
    /// Missing metadata is `SessionNotFound`; a session is never recreated
    /// implicitly. Concurrent resolvers of the same id get the same object.
    pub async fn resolve(&self, session_id: &str) -> TetherResult<Arc<Session>> {
        if let Some(session) = self.get(session_id) {
            return Ok(session);
        }
        self.ensure_running()?;

        let cancel = &self.shared.shutdown;
        let metadata = self
            .shared
            .store
            .get(session_id, cancel)
            .await?
            .ok_or_else(|| TetherError::SessionNotFound(session_id.to_string()))?;

        let previous_owner = metadata.owner_instance_id.clone();
        if !self.shared.store.transfer_ownership(session_id, cancel).await? {
            return Err(TetherError::SessionNotFound(session_id.to_string()));
        }

        let resources = self.shared.factory.create(session_id)?;
        let candidate = Arc::new(Session::recovered(
            &metadata,
            resources,
            self.observer(),
            Arc::clone(&self.shared.clock),
        ));

        let (session, loser) = match self.shared.sessions.entry(session_id.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), Some(candidate)),
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&candidate));
                (candidate, None)
            }
        };

        match loser {
            Some(loser) => {
                debug!(session_id, "Lost recovery race, using resident session");
                if let Err(e) = loser.dispose().await {
                    warn!(session_id, error = %e, "Failed to dispose surplus session");
                }
            }
            None => {
                session.spawn_run();
                info!(
                    session_id,
                    previous_owner = ?previous_owner,
                    owner = self.shared.store.instance_id(),
                    "Session recovered from store"
                );
            }
        }
        Ok(session)
    }

    /// Resident session, if any
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.shared
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Persist the initial metadata of a session leaving `Uninitialized`
    pub async fn start_new_session(&self, session: &Session) -> TetherResult<()> {
        self.shared.start_new_session(session).await
    }

    /// Check `identity` against `session`; a winning upgrade is persisted so
    /// the user index can find the session.
    pub async fn authorize(
        &self,
        session: &Session,
        identity: Option<&UserIdClaim>,
    ) -> TetherResult<AccessDecision> {
        let decision = session.check_identity(identity);
        match decision {
            AccessDecision::Allow => {}
            AccessDecision::Upgraded => {
                // An unstarted session persists its identity on first acquire
                if !session.is_stateless() && session.state() == SessionState::Started {
                    self.shared
                        .store
                        .set(session.id(), session.to_metadata(), &self.shared.shutdown)
                        .await?;
                }
            }
            AccessDecision::Deny => {
                warn!(
                    session_id = %session.id(),
                    session_user = ?session.user_id(),
                    request_user = ?identity.map(|claim| claim.value.as_str()),
                    "Request identity rejected"
                );
            }
        }
        Ok(decision)
    }

    /// Like [`authorize`](Self::authorize) but turns a denial into `Forbidden`.
    ///
    /// Only the request is rejected; the session stays alive for its owner.
    pub async fn authorize_or_reject(
        &self,
        session: &Session,
        identity: Option<&UserIdClaim>,
    ) -> TetherResult<()> {
        match self.authorize(session, identity).await? {
            AccessDecision::Deny => Err(TetherError::Forbidden {
                session_id: session.id().to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Client-requested termination: dispose the live object and delete its
    /// metadata. Returns whether a resident session was found.
    pub async fn terminate(&self, session_id: &str) -> TetherResult<bool> {
        let removed = self.shared.sessions.remove(session_id).map(|(_, s)| s);
        let dispose_result = match &removed {
            Some(session) => session.dispose().await,
            None => Ok(()),
        };

        self.shared
            .store
            .remove(session_id, &self.shared.shutdown)
            .await?;
        dispose_result?;

        info!(session_id, resident = removed.is_some(), "Session terminated");
        Ok(removed.is_some())
    }

    /// Dispose every resident session. Metadata is left in the store so other
    /// instances can recover the sessions. Returns the number disposed.
    pub async fn shutdown(&self) -> usize {
        self.shared.shutdown.cancel();

        let ids: Vec<String> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut disposed = 0;
        for id in ids {
            if let Some((_, session)) = self.shared.sessions.remove(&id) {
                if let Err(e) = session.dispose().await {
                    warn!(session_id = %id, error = %e, "Error disposing session during shutdown");
                }
                disposed += 1;
            }
        }

        info!(disposed, "Session registry shut down");
        disposed
    }

    pub fn idle_session_count(&self) -> usize {
        self.shared.idle_count.load(Ordering::SeqCst)
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Summaries of all resident sessions, ordered by id
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .shared
            .sessions
            .iter()
            .map(|entry| entry.value().summary())
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    /// Touch the stored metadata of every session currently in use.
    ///
    /// Failures are logged and skipped. Returns the number refreshed.
    pub async fn refresh_busy_sessions(&self) -> usize {
        let busy: Vec<String> = self
            .shared
            .sessions
            .iter()
            .filter(|entry| {
                let session = entry.value();
                session.state() == SessionState::Started && session.reference_count() > 0
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut refreshed = 0;
        for id in busy {
            match self.shared.store.touch(&id, &self.shared.shutdown).await {
                Ok(()) => refreshed += 1,
                Err(TetherError::Cancelled) => break,
                Err(e) => warn!(session_id = %id, error = %e, "Heartbeat touch failed"),
            }
        }
        refreshed
    }

    /// Dispose resident sessions idle for longer than `idle_timeout`, then,
    /// if more than `max_idle` idle sessions remain, the oldest of those.
    ///
    /// Metadata is untouched. Returns the number disposed.
    pub async fn prune_idle_sessions(&self, idle_timeout: Duration, max_idle: usize) -> usize {
        let now = self.shared.clock.now_millis();
        let threshold = duration_millis(idle_timeout);

        let mut idle: Vec<Arc<Session>> = self
            .shared
            .sessions
            .iter()
            .filter(|entry| entry.value().is_idle())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        idle.sort_by_key(|session| session.last_activity());

        let expired = idle
            .iter()
            .take_while(|session| now.saturating_sub(session.last_activity()) > threshold)
            .count();
        let over_cap = idle.len().saturating_sub(expired).saturating_sub(max_idle);

        let mut disposed = 0;
        for session in idle.iter().take(expired + over_cap) {
            if self.evict_idle(session).await {
                disposed += 1;
            }
        }

        if disposed > 0 {
            info!(disposed, expired, over_cap, "Pruned idle sessions");
        }
        disposed
    }

    /// Remove and dispose `session` if it is still resident and still idle.
    ///
    /// The session turns `Disposed` inside the map's removal, so no request
    /// can take a reference between the idle check and the teardown.
    async fn evict_idle(&self, session: &Arc<Session>) -> bool {
        let removed = self
            .shared
            .sessions
            .remove_if(session.id(), |_, resident| {
                Arc::ptr_eq(resident, session) && resident.begin_idle_disposal()
            })
            .is_some();
        if !removed {
            return false;
        }

        if let Err(e) = session.complete_disposal(true).await {
            warn!(session_id = %session.id(), error = %e, "Error disposing idle session");
        }
        debug!(session_id = %session.id(), "Idle session disposed");
        true
    }

    fn observer(&self) -> Weak<dyn SessionObserver> {
        let weak: Weak<RegistryShared> = Arc::downgrade(&self.shared);
        weak
    }

    fn ensure_running(&self) -> TetherResult<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(TetherError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionObserver for RegistryShared {
    async fn start_new_session(&self, session: &Session) -> TetherResult<()> {
        let metadata = session.to_metadata();
        let written_user = metadata.user_id.clone();
        self.store
            .set(session.id(), metadata, &self.shutdown)
            .await?;

        // An upgrade persisted while this write was in flight may have been
        // overwritten by it; identities only move forward, so write again
        if session.user_id() != written_user.as_deref() {
            debug!(
                session_id = %session.id(),
                user_id = ?session.user_id(),
                "Identity bound during registration, rewriting metadata"
            );
            self.store
                .set(session.id(), session.to_metadata(), &self.shutdown)
                .await?;
        }
        debug!(session_id = %session.id(), "Session metadata persisted");
        Ok(())
    }

    fn session_became_idle(&self, _session_id: &str) {
        self.idle_count.fetch_add(1, Ordering::SeqCst);
    }

    fn session_left_idle(&self, session_id: &str) {
        let result = self
            .idle_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
        if result.is_err() {
            warn!(session_id, "Idle count underflow ignored");
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.session_count())
            .field("idle", &self.idle_session_count())
            .field("instance_id", &self.shared.store.instance_id())
            .finish()
    }
}
