use crate::core::clock::{duration_millis, Clock};
use crate::core::store::retry::{retry_cas, CasOutcome, CasStep};
use crate::core::store::{ensure_not_cancelled, SessionStore, StoreOptions};
use crate::domain::error::TetherResult;
use crate::domain::metadata::SessionMetadata;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct VersionedRecord {
    /// Bumped on every write; the compare half of `touch`'s compare-and-swap
    version: u64,
    metadata: SessionMetadata,
}

/// In-process session store.
///
/// Records and the per-user index live in separate sharded maps. No
/// operation holds a lock on one map while locking the other.
pub struct LocalSessionStore {
    records: DashMap<String, VersionedRecord>,
    user_index: DashMap<String, HashSet<String>>,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
}

impl LocalSessionStore {
    pub fn new(options: StoreOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            user_index: DashMap::new(),
            options,
            clock,
        }
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn index(&self, user_id: &str, session_id: &str) {
        self.user_index
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id.to_string());
    }

    fn unindex(&self, user_id: &str, session_id: &str) {
        let now_empty = match self.user_index.get_mut(user_id) {
            Some(mut ids) => {
                ids.remove(session_id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            // Re-checked under the shard lock so a racing insert survives
            self.user_index.remove_if(user_id, |_, ids| ids.is_empty());
        }
    }

    fn try_touch(&self, session_id: &str, now_ms: i64) -> CasStep {
        let (version, updated) = match self.records.get(session_id) {
            Some(record) => {
                let mut metadata = record.metadata.clone();
                metadata.last_activity = now_ms;
                (record.version, metadata)
            }
            None => return CasStep::Absent,
        };

        match self.records.get_mut(session_id) {
            Some(mut record) if record.version == version => {
                record.version += 1;
                record.metadata = updated;
                CasStep::Applied
            }
            Some(_) => CasStep::Conflict,
            None => CasStep::Absent,
        }
    }
}

#[async_trait]
impl SessionStore for LocalSessionStore {
    fn instance_id(&self) -> &str {
        &self.options.instance_id
    }

    async fn exists(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<bool> {
        ensure_not_cancelled(cancel)?;
        Ok(self.records.contains_key(session_id))
    }

    async fn get(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> TetherResult<Option<SessionMetadata>> {
        ensure_not_cancelled(cancel)?;
        Ok(self
            .records
            .get(session_id)
            .map(|record| record.metadata.clone()))
    }

    async fn set(
        &self,
        session_id: &str,
        metadata: SessionMetadata,
        cancel: &CancellationToken,
    ) -> TetherResult<()> {
        ensure_not_cancelled(cancel)?;
        let metadata = self.options.stamp(metadata);
        let user_id = metadata.user_id.clone();

        let previous_user = match self.records.entry(session_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                let previous = record.metadata.user_id.take();
                record.version += 1;
                record.metadata = metadata;
                previous
            }
            Entry::Vacant(entry) => {
                entry.insert(VersionedRecord {
                    version: 0,
                    metadata,
                });
                None
            }
        };

        if let Some(previous) = previous_user.filter(|p| Some(p) != user_id.as_ref()) {
            self.unindex(&previous, session_id);
        }
        if let Some(user_id) = user_id {
            self.index(&user_id, session_id);
        }
        Ok(())
    }

    async fn remove(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<()> {
        ensure_not_cancelled(cancel)?;
        if let Some((_, record)) = self.records.remove(session_id) {
            if let Some(user_id) = record.metadata.user_id {
                self.unindex(&user_id, session_id);
            }
        }
        Ok(())
    }

    async fn touch(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<()> {
        ensure_not_cancelled(cancel)?;
        let now_ms = self.clock.now_millis();
        let outcome = retry_cas(self.options.touch_attempts, || {
            std::future::ready(Ok(self.try_touch(session_id, now_ms)))
        })
        .await?;

        if outcome == CasOutcome::Exhausted {
            // Contention means the session is in use; a stale stamp is harmless
            debug!(session_id = %session_id, "Touch gave up under contention");
        }
        Ok(())
    }

    async fn user_sessions(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> TetherResult<Vec<String>> {
        ensure_not_cancelled(cancel)?;
        let mut ids: Vec<String> = self
            .user_index
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        Ok(ids)
    }

    async fn prune_expired(
        &self,
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> TetherResult<usize> {
        ensure_not_cancelled(cancel)?;
        let now_ms = self.clock.now_millis();
        let threshold = duration_millis(idle_timeout);
        let expired = |record: &VersionedRecord| record.metadata.idle_for_ms(now_ms) > threshold;

        let candidates: Vec<String> = self
            .records
            .iter()
            .filter(|entry| expired(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for session_id in candidates {
            // A touch may have landed since the scan
            if let Some((_, record)) = self.records.remove_if(&session_id, |_, r| expired(r)) {
                if let Some(user_id) = record.metadata.user_id {
                    self.unindex(&user_id, &session_id);
                }
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Pruned expired session metadata");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::domain::error::TetherError;

    const START: i64 = 1_700_000_000_000;

    fn create_test_store() -> (LocalSessionStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let options = StoreOptions::default().with_instance_id("node-a");
        (LocalSessionStore::new(options, clock.clone()), clock)
    }

    fn record(id: &str, user: Option<&str>, last_activity: i64) -> SessionMetadata {
        let mut metadata = SessionMetadata::new(id, last_activity);
        metadata.user_id = user.map(str::to_string);
        metadata
    }

    #[tokio::test]
    async fn test_set_get_round_trip_stamps_owner() {
        let (store, _) = create_test_store();
        let token = CancellationToken::new();
        let mut metadata = record("s1", Some("u1"), START).with_custom("k", "v");
        metadata.owner_instance_id = Some("someone-else".to_string());

        store.set("s1", metadata.clone(), &token).await.unwrap();
        let stored = store.get("s1", &token).await.unwrap().unwrap();

        assert_eq!(stored.owner_instance_id.as_deref(), Some("node-a"));
        metadata.owner_instance_id = Some("node-a".to_string());
        assert_eq!(stored, metadata);
    }

    #[tokio::test]
    async fn test_remove_clears_user_index() {
        let (store, _) = create_test_store();
        let token = CancellationToken::new();
        store.set("s1", record("s1", Some("u1"), START), &token).await.unwrap();
        store.set("s2", record("s2", Some("u1"), START), &token).await.unwrap();

        store.remove("s1", &token).await.unwrap();

        assert!(store.get("s1", &token).await.unwrap().is_none());
        assert_eq!(store.user_sessions("u1", &token).await.unwrap(), vec!["s2"]);

        store.remove("s2", &token).await.unwrap();
        assert!(store.user_sessions("u1", &token).await.unwrap().is_empty());
        assert!(store.user_index.get("u1").is_none());
    }

    #[tokio::test]
    async fn test_remove_and_touch_absent_are_noops() {
        let (store, _) = create_test_store();
        let token = CancellationToken::new();
        store.remove("missing", &token).await.unwrap();
        store.remove("missing", &token).await.unwrap();
        store.touch("missing", &token).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_touch_refreshes_last_activity() {
        let (store, clock) = create_test_store();
        let token = CancellationToken::new();
        store.set("s1", record("s1", None, START), &token).await.unwrap();

        clock.advance(Duration::from_secs(30));
        store.touch("s1", &token).await.unwrap();

        let stored = store.get("s1", &token).await.unwrap().unwrap();
        assert_eq!(stored.last_activity, START + 30_000);
        assert_eq!(stored.created_at, START);
    }

    #[tokio::test]
    async fn test_prune_expired_respects_boundary() {
        let (store, clock) = create_test_store();
        let token = CancellationToken::new();
        let timeout = Duration::from_secs(60);
        store.set("old", record("old", Some("u1"), START - 60_001), &token).await.unwrap();
        store.set("edge", record("edge", Some("u1"), START - 60_000), &token).await.unwrap();
        store.set("fresh", record("fresh", None, START - 10), &token).await.unwrap();
        clock.set(START);

        let removed = store.prune_expired(timeout, &token).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!store.exists("old", &token).await.unwrap());
        assert!(store.exists("edge", &token).await.unwrap());
        assert!(store.exists("fresh", &token).await.unwrap());
        assert_eq!(store.user_sessions("u1", &token).await.unwrap(), vec!["edge"]);
    }

    #[tokio::test]
    async fn test_user_change_moves_index_membership() {
        let (store, _) = create_test_store();
        let token = CancellationToken::new();
        store.set("s1", record("s1", Some("u1"), START), &token).await.unwrap();
        store.set("s1", record("s1", Some("u2"), START), &token).await.unwrap();

        assert!(store.user_sessions("u1", &token).await.unwrap().is_empty());
        assert_eq!(store.user_sessions("u2", &token).await.unwrap(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_concurrent_index_inserts_are_not_lost() {
        let (store, _) = create_test_store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let id = format!("s{}", i);
                let token = CancellationToken::new();
                store.set(&id, record(&id, Some("shared"), START), &token).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let token = CancellationToken::new();
        assert_eq!(store.user_sessions("shared", &token).await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_touch_bumps_version() {
        let (store, _) = create_test_store();
        let token = CancellationToken::new();
        store.set("s1", record("s1", None, START), &token).await.unwrap();

        let before = store.records.get("s1").map(|r| r.version).unwrap();
        assert_eq!(store.try_touch("s1", START + 1), CasStep::Applied);
        let after = store.records.get("s1").map(|r| r.version).unwrap();
        assert_eq!(after, before + 1);
        assert_eq!(store.try_touch("missing", START + 1), CasStep::Absent);
    }

    #[tokio::test]
    async fn test_cancelled_operations_fail() {
        let (store, _) = create_test_store();
        let token = CancellationToken::new();
        token.cancel();
        let result = store.set("s1", record("s1", None, START), &token).await;
        assert!(matches!(result, Err(TetherError::Cancelled)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_ownership_transfer() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(START));
        let node_a = LocalSessionStore::new(
            StoreOptions::default().with_instance_id("A"),
            Arc::clone(&clock),
        );
        let token = CancellationToken::new();
        node_a.set("s2", record("s2", None, START), &token).await.unwrap();
        assert_eq!(node_a.owner_server("s2", &token).await.unwrap().as_deref(), Some("A"));
        assert!(node_a.is_owned_by_this_server("s2", &token).await.unwrap());

        // Second instance seeded with A's records
        let node_b = LocalSessionStore {
            records: node_a.records.clone(),
            user_index: node_a.user_index.clone(),
            options: StoreOptions::default().with_instance_id("B"),
            clock,
        };
        assert!(node_b.transfer_ownership("s2", &token).await.unwrap());
        assert_eq!(node_b.owner_server("s2", &token).await.unwrap().as_deref(), Some("B"));
        assert!(!node_b.transfer_ownership("missing", &token).await.unwrap());
    }
}
