use crate::core::clock::Clock;
use crate::core::session::state::{Lifecycle, SessionState, SessionSummary};
use crate::core::transport::{SessionResources, SessionServer, SessionTransport};
use crate::domain::error::{TetherError, TetherResult};
use crate::domain::identity::{AccessDecision, UserIdClaim};
use crate::domain::metadata::SessionMetadata;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Receives a session's lifecycle edges.
///
/// The idle callbacks run while the session's mutex is held and must not
/// block. `start_new_session` runs after the mutex is released.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// First transition out of `Uninitialized`; persists initial metadata
    async fn start_new_session(&self, session: &Session) -> TetherResult<()>;

    /// Reference count dropped 1 → 0
    fn session_became_idle(&self, session_id: &str);

    /// Reference count rose 0 → 1, or an idle session was disposed
    fn session_left_idle(&self, session_id: &str);
}

/// One live, reference-counted session
pub struct Session {
    id: String,
    transport: Arc<dyn SessionTransport>,
    server: Arc<dyn SessionServer>,
    /// Identity the session was created with
    origin_identity: Option<UserIdClaim>,
    /// Identity bound later by an anonymous → authenticated upgrade; set once
    bound_identity: OnceLock<UserIdClaim>,
    /// User id restored from a record without claim type or issuer; such a
    /// session only accepts requests whose claim value matches
    recovered_user_id: Option<String>,
    /// Opaque entries carried over from persisted metadata
    custom_data: HashMap<String, String>,
    lifecycle: Mutex<Lifecycle>,
    created_at: i64,
    last_activity: AtomicI64,
    cancel: CancellationToken,
    run_task: Mutex<Option<JoinHandle<TetherResult<()>>>>,
    observer: Weak<dyn SessionObserver>,
    clock: Arc<dyn Clock>,
}

impl Session {
    /// Create a fresh session
    pub fn new(
        id: impl Into<String>,
        resources: SessionResources,
        identity: Option<UserIdClaim>,
        observer: Weak<dyn SessionObserver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        Self::build(id.into(), resources, identity, None, now, HashMap::new(), observer, clock)
    }

    /// Rebuild a session from persisted metadata, keeping its id, creation
    /// time and bound identity.
    ///
    /// A record that names a user but not the full claim never comes back
    /// anonymous: the user id alone stays bound.
    pub fn recovered(
        metadata: &SessionMetadata,
        resources: SessionResources,
        observer: Weak<dyn SessionObserver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let identity = metadata.user_claim();
        let recovered_user_id = match identity {
            Some(_) => None,
            None => metadata.user_id.clone(),
        };
        Self::build(
            metadata.session_id.clone(),
            resources,
            identity,
            recovered_user_id,
            metadata.created_at,
            metadata.custom_data.clone().unwrap_or_default(),
            observer,
            clock,
        )
    }

    fn build(
        id: String,
        resources: SessionResources,
        identity: Option<UserIdClaim>,
        recovered_user_id: Option<String>,
        created_at: i64,
        custom_data: HashMap<String, String>,
        observer: Weak<dyn SessionObserver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            id,
            transport: resources.transport,
            server: resources.server,
            origin_identity: identity,
            bound_identity: OnceLock::new(),
            recovered_user_id,
            custom_data,
            lifecycle: Mutex::new(Lifecycle::new()),
            created_at,
            last_activity: AtomicI64::new(now),
            cancel: CancellationToken::new(),
            run_task: Mutex::new(None),
            observer,
            clock,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle().state
    }

    pub fn reference_count(&self) -> usize {
        self.lifecycle().references
    }

    pub fn is_idle(&self) -> bool {
        self.lifecycle().is_idle()
    }

    pub fn is_stateless(&self) -> bool {
        self.transport.is_stateless()
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::SeqCst)
    }

    /// Effective identity: the upgraded one if bound, else the original
    pub fn identity(&self) -> Option<&UserIdClaim> {
        self.bound_identity.get().or(self.origin_identity.as_ref())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity()
            .map(|claim| claim.value.as_str())
            .or(self.recovered_user_id.as_deref())
    }

    /// Child tokens of this fire when the session is disposed
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start the server's run loop in the background.
    ///
    /// Disposal cancels and awaits it. A second call is ignored.
    pub fn spawn_run(&self) {
        let mut slot = self.run_task_slot();
        if slot.is_some() {
            warn!(session_id = %self.id, "Session run task already started");
            return;
        }
        let server = Arc::clone(&self.server);
        let token = self.cancel.child_token();
        *slot = Some(tokio::spawn(async move { server.run(token).await }));
    }

    /// Take a reference for the duration of one request.
    ///
    /// The returned guard releases the reference when dropped. The first
    /// acquisition moves the session to `Started` and registers it with the
    /// observer outside the lock; if registration fails the reference is
    /// released and the error returned.
    pub async fn acquire_reference(self: &Arc<Self>) -> TetherResult<SessionReference> {
        if self.is_stateless() {
            return Ok(SessionReference::detached());
        }

        let first_start = {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                SessionState::Disposed => {
                    return Err(TetherError::Disposed {
                        session_id: self.id.clone(),
                    });
                }
                SessionState::Uninitialized => {
                    lifecycle.state = SessionState::Started;
                    lifecycle.references = 1;
                    self.stamp_activity();
                    true
                }
                SessionState::Started => {
                    lifecycle.references += 1;
                    if lifecycle.references == 1 {
                        // Keep a request burst from being expired mid-use
                        self.stamp_activity();
                        if let Some(observer) = self.observer.upgrade() {
                            observer.session_left_idle(&self.id);
                        }
                        trace!(session_id = %self.id, "Session busy");
                    }
                    false
                }
            }
        };

        let reference = SessionReference::attached(Arc::clone(self));
        if first_start {
            debug!(session_id = %self.id, "Session started");
            if let Some(observer) = self.observer.upgrade() {
                observer.start_new_session(self).await?;
            }
        }
        Ok(reference)
    }

    fn release_reference(&self) {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state == SessionState::Disposed {
            return;
        }
        debug_assert!(lifecycle.references > 0, "reference released twice");
        lifecycle.references = lifecycle.references.saturating_sub(1);
        if lifecycle.references == 0 {
            self.stamp_activity();
            if let Some(observer) = self.observer.upgrade() {
                observer.session_became_idle(&self.id);
            }
            trace!(session_id = %self.id, "Session idle");
        }
    }

    /// Check a request's identity against the session, upgrading an
    /// anonymous session on first authenticated use.
    ///
    /// Lock-free: the upgrade is a single set-once on the bound slot, so
    /// exactly one identity can ever win it.
    pub fn check_identity(&self, request: Option<&UserIdClaim>) -> AccessDecision {
        if let Some(current) = self.identity() {
            return match request {
                Some(claim) if claim == current => AccessDecision::Allow,
                _ => AccessDecision::Deny,
            };
        }

        if let Some(user_id) = &self.recovered_user_id {
            return match request {
                Some(claim) if claim.value == *user_id => AccessDecision::Allow,
                _ => AccessDecision::Deny,
            };
        }

        let Some(claim) = request else {
            return AccessDecision::Allow;
        };

        match self.bound_identity.set(claim.clone()) {
            Ok(()) => {
                info!(session_id = %self.id, user = %claim, "Anonymous session upgraded");
                AccessDecision::Upgraded
            }
            // Lost the race; fine if the winner is the same user
            Err(_) if self.bound_identity.get() == Some(claim) => AccessDecision::Allow,
            Err(_) => AccessDecision::Deny,
        }
    }

    /// Tear the session down. Idempotent.
    ///
    /// Order: transport, cancellation, await the run task (cancellation is
    /// expected), server. The server is disposed even if earlier steps fail;
    /// the first failure is returned afterwards.
    pub async fn dispose(&self) -> TetherResult<()> {
        let was_idle = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == SessionState::Disposed {
                return Ok(());
            }
            let was_idle = lifecycle.is_idle();
            lifecycle.state = SessionState::Disposed;
            was_idle
        };
        self.complete_disposal(was_idle).await
    }

    /// Mark an idle session `Disposed` without tearing it down.
    ///
    /// The idle check and the transition share the session mutex, so a
    /// concurrent acquire either lands first (and this returns `false`) or
    /// fails with `Disposed`. Follow a `true` with
    /// [`complete_disposal`](Self::complete_disposal).
    pub(crate) fn begin_idle_disposal(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if !lifecycle.is_idle() {
            return false;
        }
        lifecycle.state = SessionState::Disposed;
        true
    }

    /// Teardown half of [`dispose`](Self::dispose); runs once per session
    pub(crate) async fn complete_disposal(&self, was_idle: bool) -> TetherResult<()> {
        debug!(session_id = %self.id, was_idle, "Disposing session");

        let mut first_error = None;
        if let Err(e) = self.transport.dispose().await {
            warn!(session_id = %self.id, error = %e, "Transport teardown failed");
            first_error = Some(e);
        }

        self.cancel.cancel();

        let run_task = self.run_task_slot().take();
        if let Some(task) = run_task {
            match task.await {
                Ok(Ok(())) | Ok(Err(TetherError::Cancelled)) => {}
                Ok(Err(e)) => {
                    debug!(session_id = %self.id, error = %e, "Run task ended with error");
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "Run task panicked");
                }
            }
        }

        if let Err(e) = self.server.dispose().await {
            warn!(session_id = %self.id, error = %e, "Server teardown failed");
            first_error.get_or_insert(e);
        }

        if was_idle {
            if let Some(observer) = self.observer.upgrade() {
                observer.session_left_idle(&self.id);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Durable view of this session
    pub fn to_metadata(&self) -> SessionMetadata {
        let mut metadata = SessionMetadata::new(self.id.clone(), self.created_at);
        metadata.last_activity = self.last_activity();
        metadata.is_active = self.state() != SessionState::Disposed;
        if !self.custom_data.is_empty() {
            metadata.custom_data = Some(self.custom_data.clone());
        }
        match self.identity() {
            Some(claim) => metadata.with_identity(claim),
            None => {
                metadata.user_id = self.recovered_user_id.clone();
                metadata
            }
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let (state, references, idle) = {
            let lifecycle = self.lifecycle();
            (lifecycle.state, lifecycle.references, lifecycle.is_idle())
        };
        SessionSummary {
            session_id: self.id.clone(),
            state,
            references,
            user_id: self.user_id().map(str::to_string),
            created_at: self.created_at,
            last_activity: self.last_activity(),
            idle,
        }
    }

    fn stamp_activity(&self) {
        self.last_activity
            .store(self.clock.now_millis(), Ordering::SeqCst);
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run_task_slot(&self) -> MutexGuard<'_, Option<JoinHandle<TetherResult<()>>>> {
        self.run_task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("references", &self.reference_count())
            .field("user_id", &self.user_id())
            .finish()
    }
}

/// Scoped reference on a session; releases exactly once when dropped
#[must_use = "dropping the reference releases it immediately"]
pub struct SessionReference {
    session: Option<Arc<Session>>,
}

impl SessionReference {
    fn attached(session: Arc<Session>) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// Reference on a stateless session; tracks nothing
    fn detached() -> Self {
        Self { session: None }
    }

    pub fn is_tracked(&self) -> bool {
        self.session.is_some()
    }

    /// Release now instead of at end of scope
    pub fn release(self) {}
}

impl Drop for SessionReference {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.release_reference();
        }
    }
}
