use crate::core::clock::{duration_millis, Clock};
use crate::core::store::retry::{retry_cas, CasOutcome, CasStep};
use crate::core::store::{cancellable, codec, ensure_not_cancelled, SessionStore, StoreOptions};
use crate::domain::error::{TetherError, TetherResult};
use crate::domain::metadata::SessionMetadata;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// One command inside a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxCommand {
    SetEx {
        key: String,
        value: String,
        ttl: Duration,
    },
    Del {
        key: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
}

/// Commands applied all-or-nothing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    commands: Vec<TxCommand>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ex(mut self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) -> Self {
        self.commands.push(TxCommand::SetEx {
            key: key.into(),
            value: value.into(),
            ttl,
        });
        self
    }

    pub fn del(mut self, key: impl Into<String>) -> Self {
        self.commands.push(TxCommand::Del { key: key.into() });
        self
    }

    pub fn sadd(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.commands.push(TxCommand::SAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn srem(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.commands.push(TxCommand::SRem {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn expire(mut self, key: impl Into<String>, ttl: Duration) -> Self {
        self.commands.push(TxCommand::Expire {
            key: key.into(),
            ttl,
        });
        self
    }

    pub fn commands(&self) -> &[TxCommand] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Client for a backend with transactions, native sets and per-key TTLs
#[async_trait]
pub trait TransactionalClient: Send + Sync {
    async fn get(&self, key: &str) -> TetherResult<Option<String>>;

    async fn exists(&self, key: &str) -> TetherResult<bool>;

    async fn set_members(&self, key: &str) -> TetherResult<Vec<String>>;

    async fn exec(&self, tx: Transaction) -> TetherResult<()>;

    /// Watch-then-exec: apply `tx` only if `watched` still holds `expected`.
    ///
    /// Returns `false` without applying anything on conflict.
    async fn exec_if_unchanged(
        &self,
        watched: &str,
        expected: Option<&str>,
        tx: Transaction,
    ) -> TetherResult<bool>;
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Option<i64>,
}

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, StoredValue>,
}

impl Keyspace {
    fn live(&mut self, key: &str, now_ms: i64) -> Option<&mut StoredValue> {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= now_ms);
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn string(&mut self, key: &str, now_ms: i64) -> Option<String> {
        match self.live(key, now_ms) {
            Some(StoredValue {
                value: Value::Str(s),
                ..
            }) => Some(s.clone()),
            _ => None,
        }
    }

    fn apply(&mut self, command: TxCommand, now_ms: i64) {
        match command {
            TxCommand::SetEx { key, value, ttl } => {
                self.entries.insert(
                    key,
                    StoredValue {
                        value: Value::Str(value),
                        expires_at: Some(now_ms.saturating_add(duration_millis(ttl))),
                    },
                );
            }
            TxCommand::Del { key } => {
                self.entries.remove(&key);
            }
            TxCommand::SAdd { key, member } => match self.live(&key, now_ms) {
                Some(StoredValue {
                    value: Value::Set(members),
                    ..
                }) => {
                    members.insert(member);
                }
                _ => {
                    self.entries.insert(
                        key,
                        StoredValue {
                            value: Value::Set(HashSet::from([member])),
                            expires_at: None,
                        },
                    );
                }
            },
            TxCommand::SRem { key, member } => {
                let now_empty = match self.live(&key, now_ms) {
                    Some(StoredValue {
                        value: Value::Set(members),
                        ..
                    }) => {
                        members.remove(&member);
                        members.is_empty()
                    }
                    _ => false,
                };
                if now_empty {
                    self.entries.remove(&key);
                }
            }
            TxCommand::Expire { key, ttl } => {
                if let Some(entry) = self.live(&key, now_ms) {
                    entry.expires_at = Some(now_ms.saturating_add(duration_millis(ttl)));
                }
            }
        }
    }
}

/// In-process [`TransactionalClient`].
///
/// Each transaction runs under one lock, so it is observed whole or not at
/// all. Expired keys are dropped lazily on access.
pub struct MemoryTransactionalClient {
    keyspace: Mutex<Keyspace>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    transactions: AtomicUsize,
}

impl MemoryTransactionalClient {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            clock,
            available: AtomicBool::new(true),
            transactions: AtomicUsize::new(0),
        }
    }

    /// Simulate losing or regaining the connection
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of transactions committed so far
    pub fn transaction_count(&self) -> usize {
        self.transactions.load(Ordering::SeqCst)
    }

    /// Remaining time-to-live of a key
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now_ms = self.clock.now_millis();
        let mut keyspace = self.keyspace.lock().await;
        let expires_at = keyspace.live(key, now_ms)?.expires_at?;
        u64::try_from(expires_at - now_ms).ok().map(Duration::from_millis)
    }

    /// Overwrite a raw value, bypassing the store's encoding
    pub async fn put_raw(&self, key: &str, value: &str, ttl: Duration) {
        let now_ms = self.clock.now_millis();
        let mut keyspace = self.keyspace.lock().await;
        keyspace.apply(
            TxCommand::SetEx {
                key: key.to_string(),
                value: value.to_string(),
                ttl,
            },
            now_ms,
        );
    }

    fn check_available(&self) -> TetherResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TetherError::unavailable("transactional backend unreachable"))
        }
    }

    fn commit(&self, keyspace: &mut Keyspace, tx: Transaction, now_ms: i64) {
        for command in tx.commands {
            keyspace.apply(command, now_ms);
        }
        self.transactions.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransactionalClient for MemoryTransactionalClient {
    async fn get(&self, key: &str) -> TetherResult<Option<String>> {
        self.check_available()?;
        let now_ms = self.clock.now_millis();
        Ok(self.keyspace.lock().await.string(key, now_ms))
    }

    async fn exists(&self, key: &str) -> TetherResult<bool> {
        self.check_available()?;
        let now_ms = self.clock.now_millis();
        Ok(self.keyspace.lock().await.live(key, now_ms).is_some())
    }

    async fn set_members(&self, key: &str) -> TetherResult<Vec<String>> {
        self.check_available()?;
        let now_ms = self.clock.now_millis();
        let mut keyspace = self.keyspace.lock().await;
        Ok(match keyspace.live(key, now_ms) {
            Some(StoredValue {
                value: Value::Set(members),
                ..
            }) => members.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn exec(&self, tx: Transaction) -> TetherResult<()> {
        self.check_available()?;
        let now_ms = self.clock.now_millis();
        let mut keyspace = self.keyspace.lock().await;
        self.commit(&mut keyspace, tx, now_ms);
        Ok(())
    }

    async fn exec_if_unchanged(
        &self,
        watched: &str,
        expected: Option<&str>,
        tx: Transaction,
    ) -> TetherResult<bool> {
        self.check_available()?;
        let now_ms = self.clock.now_millis();
        let mut keyspace = self.keyspace.lock().await;
        if keyspace.string(watched, now_ms).as_deref() != expected {
            return Ok(false);
        }
        self.commit(&mut keyspace, tx, now_ms);
        Ok(true)
    }
}

/// Store whose primary record and per-user set change in one transaction.
///
/// Expiry is the backend's per-key TTL, so `prune_expired` has nothing to do.
pub struct TransactionalSessionStore {
    client: Arc<dyn TransactionalClient>,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
}

impl TransactionalSessionStore {
    pub fn new(
        client: Arc<dyn TransactionalClient>,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            options,
            clock,
        }
    }

    async fn read(&self, session_id: &str) -> TetherResult<Option<SessionMetadata>> {
        let key = self.options.session_key(session_id);
        Ok(self
            .client
            .get(&key)
            .await?
            .and_then(|raw| codec::decode(&key, &raw)))
    }

    async fn try_touch(&self, key: &str, now_ms: i64) -> TetherResult<CasStep> {
        let Some(raw) = self.client.get(key).await? else {
            return Ok(CasStep::Absent);
        };
        let Some(mut metadata) = codec::decode(key, &raw) else {
            return Ok(CasStep::Absent);
        };
        metadata.last_activity = now_ms;

        let ttl = self.options.default_ttl;
        let mut tx = Transaction::new().set_ex(key, codec::encode(&metadata)?, ttl);
        if let Some(user_id) = &metadata.user_id {
            tx = tx.expire(self.options.user_key(user_id), ttl);
        }

        if self.client.exec_if_unchanged(key, Some(&raw), tx).await? {
            Ok(CasStep::Applied)
        } else {
            Ok(CasStep::Conflict)
        }
    }
}

#[async_trait]
impl SessionStore for TransactionalSessionStore {
    fn instance_id(&self) -> &str {
        &self.options.instance_id
    }

    async fn exists(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<bool> {
        let key = self.options.session_key(session_id);
        cancellable(cancel, self.client.exists(&key)).await
    }

    async fn get(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> TetherResult<Option<SessionMetadata>> {
        cancellable(cancel, self.read(session_id)).await
    }

    async fn set(
        &self,
        session_id: &str,
        metadata: SessionMetadata,
        cancel: &CancellationToken,
    ) -> TetherResult<()> {
        let metadata = self.options.stamp(metadata);
        let ttl = self.options.default_ttl;
        let mut tx = Transaction::new().set_ex(
            self.options.session_key(session_id),
            codec::encode(&metadata)?,
            ttl,
        );
        if let Some(user_id) = &metadata.user_id {
            let user_key = self.options.user_key(user_id);
            tx = tx.sadd(user_key.clone(), session_id).expire(user_key, ttl);
        }

        // Last chance to back out; once submitted the transaction runs whole
        ensure_not_cancelled(cancel)?;
        self.client.exec(tx).await?;
        trace!(session_id = %session_id, "Stored session metadata");
        Ok(())
    }

    async fn remove(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<()> {
        let existing = cancellable(cancel, self.read(session_id)).await?;
        let mut tx = Transaction::new().del(self.options.session_key(session_id));
        if let Some(user_id) = existing.and_then(|metadata| metadata.user_id) {
            tx = tx.srem(self.options.user_key(&user_id), session_id);
        }

        ensure_not_cancelled(cancel)?;
        self.client.exec(tx).await
    }

    async fn touch(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<()> {
        let key = self.options.session_key(session_id);
        let key = key.as_str();
        let now_ms = self.clock.now_millis();
        let outcome = cancellable(
            cancel,
            retry_cas(self.options.touch_attempts, || self.try_touch(key, now_ms)),
        )
        .await?;

        if outcome == CasOutcome::Exhausted {
            debug!(session_id = %session_id, "Touch gave up under contention");
        }
        Ok(())
    }

    async fn user_sessions(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> TetherResult<Vec<String>> {
        let user_key = self.options.user_key(user_id);
        let members = cancellable(cancel, self.client.set_members(&user_key)).await?;

        let mut live = Vec::with_capacity(members.len());
        let mut stale = Transaction::new();
        for session_id in members {
            let key = self.options.session_key(&session_id);
            if cancellable(cancel, self.client.exists(&key)).await? {
                live.push(session_id);
            } else {
                stale = stale.srem(user_key.clone(), session_id);
            }
        }

        // Members whose record expired on its own
        if !stale.is_empty() && !cancel.is_cancelled() {
            if let Err(e) = self.client.exec(stale).await {
                warn!(user_id = %user_id, error = %e, "Failed to drop stale index members");
            }
        }

        live.sort();
        Ok(live)
    }

    async fn prune_expired(
        &self,
        _idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> TetherResult<usize> {
        ensure_not_cancelled(cancel)?;
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    const START: i64 = 1_700_000_000_000;

    struct Fixture {
        store: TransactionalSessionStore,
        client: Arc<MemoryTransactionalClient>,
        clock: Arc<ManualClock>,
        options: StoreOptions,
    }

    fn create_fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(START));
        let client = Arc::new(MemoryTransactionalClient::new(clock.clone()));
        let options = StoreOptions::default()
            .with_instance_id("node-a")
            .with_default_ttl(Duration::from_secs(60));
        let store = TransactionalSessionStore::new(client.clone(), options.clone(), clock.clone());
        Fixture {
            store,
            client,
            clock,
            options,
        }
    }

    fn user_record(id: &str, user: &str) -> SessionMetadata {
        let mut metadata = SessionMetadata::new(id, START);
        metadata.user_id = Some(user.to_string());
        metadata
    }

    #[test]
    fn test_transaction_builder() {
        let tx = Transaction::new()
            .set_ex("a", "1", Duration::from_secs(1))
            .sadd("s", "a")
            .del("b");
        assert_eq!(tx.commands().len(), 3);
        assert!(matches!(tx.commands()[1], TxCommand::SAdd { .. }));
        assert!(Transaction::new().is_empty());
    }

    #[tokio::test]
    async fn test_set_is_a_single_transaction() {
        let f = create_fixture();
        let token = CancellationToken::new();
        f.store.set("s1", user_record("s1", "u1"), &token).await.unwrap();

        assert_eq!(f.client.transaction_count(), 1);
        let stored = f.store.get("s1", &token).await.unwrap().unwrap();
        assert_eq!(stored.owner_instance_id.as_deref(), Some("node-a"));
        assert_eq!(f.store.user_sessions("u1", &token).await.unwrap(), vec!["s1"]);
        assert_eq!(
            f.client.ttl(&f.options.user_key("u1")).await,
            Some(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn test_remove_drops_record_and_membership() {
        let f = create_fixture();
        let token = CancellationToken::new();
        f.store.set("s1", user_record("s1", "u1"), &token).await.unwrap();
        f.store.remove("s1", &token).await.unwrap();

        assert!(f.store.get("s1", &token).await.unwrap().is_none());
        assert!(f.store.user_sessions("u1", &token).await.unwrap().is_empty());
        assert!(f.client.set_members(&f.options.user_key("u1")).await.unwrap().is_empty());

        // Idempotent
        f.store.remove("s1", &token).await.unwrap();
    }

    #[tokio::test]
    async fn test_expiry_is_native() {
        let f = create_fixture();
        let token = CancellationToken::new();
        f.store.set("s1", user_record("s1", "u1"), &token).await.unwrap();

        assert_eq!(f.store.prune_expired(Duration::ZERO, &token).await.unwrap(), 0);
        assert!(f.store.exists("s1", &token).await.unwrap());

        f.clock.advance(Duration::from_secs(61));
        assert!(!f.store.exists("s1", &token).await.unwrap());
        assert!(f.store.get("s1", &token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_touch_extends_ttl() {
        let f = create_fixture();
        let token = CancellationToken::new();
        f.store.set("s1", user_record("s1", "u1"), &token).await.unwrap();

        f.clock.advance(Duration::from_secs(45));
        f.store.touch("s1", &token).await.unwrap();
        f.clock.advance(Duration::from_secs(45));

        let stored = f.store.get("s1", &token).await.unwrap().unwrap();
        assert_eq!(stored.last_activity, START + 45_000);
        assert_eq!(f.store.user_sessions("u1", &token).await.unwrap(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_stale_members_are_dropped_on_read() {
        let f = create_fixture();
        let token = CancellationToken::new();
        f.store.set("s1", user_record("s1", "u1"), &token).await.unwrap();
        f.client
            .exec(Transaction::new().sadd(f.options.user_key("u1"), "ghost"))
            .await
            .unwrap();

        assert_eq!(f.store.user_sessions("u1", &token).await.unwrap(), vec!["s1"]);
        let members = f.client.set_members(&f.options.user_key("u1")).await.unwrap();
        assert_eq!(members, vec!["s1"]);
    }

    #[tokio::test]
    async fn test_unreachable_is_not_absent() {
        let f = create_fixture();
        let token = CancellationToken::new();
        f.store.set("s1", user_record("s1", "u1"), &token).await.unwrap();
        f.client.set_available(false);

        let result = f.store.get("s1", &token).await;
        assert!(matches!(result, Err(ref e) if e.is_unavailable()));
        assert!(f.store.exists("s1", &token).await.is_err());
        assert!(f.store.touch("s1", &token).await.is_err());

        f.client.set_available(true);
        assert!(f.store.get("s1", &token).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_malformed_record_reads_as_absent() {
        let f = create_fixture();
        let token = CancellationToken::new();
        f.client
            .put_raw(&f.options.session_key("bad"), "{oops", Duration::from_secs(60))
            .await;

        assert!(f.store.get("bad", &token).await.unwrap().is_none());
        f.store.touch("bad", &token).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_set_writes_nothing() {
        let f = create_fixture();
        let token = CancellationToken::new();
        token.cancel();

        let result = f.store.set("s1", user_record("s1", "u1"), &token).await;
        assert!(matches!(result, Err(TetherError::Cancelled)));
        assert_eq!(f.client.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_conflict_rejects_transaction() {
        let f = create_fixture();
        f.client.put_raw("k", "v1", Duration::from_secs(5)).await;

        let applied = f
            .client
            .exec_if_unchanged("k", Some("v0"), Transaction::new().set_ex("k", "v2", Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(f.client.get("k").await.unwrap().as_deref(), Some("v1"));
    }
}
