use crate::core::clock::Clock;
use crate::core::store::{cancellable, codec, ensure_not_cancelled, SessionStore, StoreOptions};
use crate::domain::error::{TetherError, TetherResult};
use crate::domain::metadata::SessionMetadata;
use async_trait::async_trait;
use moka::sync::Cache;
use moka::Expiry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Minimal key/value cache with relative expiry.
///
/// No transactions, no sets, no compare-and-swap.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    async fn get(&self, key: &str) -> TetherResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> TetherResult<()>;

    async fn remove(&self, key: &str) -> TetherResult<()>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    ttl: Duration,
}

struct EntryExpiry;

impl Expiry<String, CacheEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CacheEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CacheEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process [`DistributedCache`] with per-entry TTL
pub struct MemoryDistributedCache {
    entries: Cache<String, CacheEntry>,
    available: AtomicBool,
}

impl MemoryDistributedCache {
    pub fn new() -> Self {
        Self::with_capacity(100_000)
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(EntryExpiry)
                .build(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing or regaining the connection
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> TetherResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TetherError::unavailable("distributed cache unreachable"))
        }
    }
}

impl Default for MemoryDistributedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedCache for MemoryDistributedCache {
    async fn get(&self, key: &str) -> TetherResult<Option<String>> {
        self.check_available()?;
        Ok(self.entries.get(key).map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> TetherResult<()> {
        self.check_available()?;
        self.entries.insert(key.to_string(), CacheEntry { value, ttl });
        Ok(())
    }

    async fn remove(&self, key: &str) -> TetherResult<()> {
        self.check_available()?;
        self.entries.invalidate(key);
        Ok(())
    }
}

/// Store over a plain [`DistributedCache`].
///
/// The primary record is the source of truth. The per-user index is a JSON
/// list rewritten without any atomicity guard: concurrent writers for the
/// same user can drop each other's update. Reads of the index discard ids
/// whose record is gone and write the cleaned list back, so removed ids
/// converge out after one access.
///
/// Touch is a read followed by a write. It re-reads the record just before
/// writing and skips ids that have disappeared, but a remove landing between
/// that second read and the write is undone: the record comes back until
/// its TTL lapses.
pub struct CachedSessionStore {
    cache: Arc<dyn DistributedCache>,
    options: StoreOptions,
    clock: Arc<dyn Clock>,
}

impl CachedSessionStore {
    pub fn new(cache: Arc<dyn DistributedCache>, options: StoreOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            options,
            clock,
        }
    }

    async fn read(&self, session_id: &str) -> TetherResult<Option<SessionMetadata>> {
        let key = self.options.session_key(session_id);
        Ok(self
            .cache
            .get(&key)
            .await?
            .and_then(|raw| codec::decode(&key, &raw)))
    }

    async fn write(&self, session_id: &str, metadata: &SessionMetadata) -> TetherResult<()> {
        let key = self.options.session_key(session_id);
        self.cache
            .set(&key, codec::encode(metadata)?, self.options.default_ttl)
            .await
    }

    async fn read_index(&self, user_key: &str) -> TetherResult<Vec<String>> {
        Ok(self
            .cache
            .get(user_key)
            .await?
            .map(|raw| codec::decode_index(user_key, &raw))
            .unwrap_or_default())
    }

    async fn write_index(&self, user_key: &str, session_ids: &[String]) -> TetherResult<()> {
        if session_ids.is_empty() {
            self.cache.remove(user_key).await
        } else {
            let raw = codec::encode_index(session_ids)?;
            self.cache.set(user_key, raw, self.options.default_ttl).await
        }
    }

    /// Add membership and refresh the index TTL; last writer wins
    async fn index_add(&self, user_id: &str, session_id: &str) -> TetherResult<()> {
        let user_key = self.options.user_key(user_id);
        let mut ids = self.read_index(&user_key).await?;
        if !ids.iter().any(|id| id == session_id) {
            ids.push(session_id.to_string());
        }
        self.write_index(&user_key, &ids).await
    }

    async fn index_remove(&self, user_id: &str, session_id: &str) -> TetherResult<()> {
        let user_key = self.options.user_key(user_id);
        let mut ids = self.read_index(&user_key).await?;
        let before = ids.len();
        ids.retain(|id| id != session_id);
        if ids.len() == before {
            return Ok(());
        }
        self.write_index(&user_key, &ids).await
    }

    async fn live_user_sessions(&self, user_id: &str) -> TetherResult<Vec<String>> {
        let user_key = self.options.user_key(user_id);
        let ids = self.read_index(&user_key).await?;

        let mut live = Vec::with_capacity(ids.len());
        for session_id in &ids {
            if self.read(session_id).await?.is_some() {
                live.push(session_id.clone());
            }
        }

        if live.len() != ids.len() {
            debug!(
                user_id = %user_id,
                dropped = ids.len() - live.len(),
                "Healing stale user index"
            );
            if let Err(e) = self.write_index(&user_key, &live).await {
                warn!(user_id = %user_id, error = %e, "Failed to write healed user index");
            }
        }

        live.sort();
        Ok(live)
    }

    async fn touch_record(&self, session_id: &str) -> TetherResult<()> {
        let Some(mut metadata) = self.read(session_id).await? else {
            return Ok(());
        };
        metadata.last_activity = self.clock.now_millis();
        // Removed since the first read; stays removed
        if self.read(session_id).await?.is_none() {
            return Ok(());
        }
        self.write(session_id, &metadata).await?;
        if let Some(user_id) = &metadata.user_id {
            self.index_add(user_id, session_id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for CachedSessionStore {
    fn instance_id(&self) -> &str {
        &self.options.instance_id
    }

    async fn exists(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<bool> {
        Ok(cancellable(cancel, self.read(session_id)).await?.is_some())
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
        cancellable(cancel, self.write(session_id, &metadata)).await?;
        if let Some(user_id) = &metadata.user_id {
            cancellable(cancel, self.index_add(user_id, session_id)).await?;
        }
        Ok(())
    }

    async fn remove(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<()> {
        let existing = cancellable(cancel, self.read(session_id)).await?;
        let key = self.options.session_key(session_id);
        cancellable(cancel, self.cache.remove(&key)).await?;
        if let Some(user_id) = existing.and_then(|metadata| metadata.user_id) {
            cancellable(cancel, self.index_remove(&user_id, session_id)).await?;
        }
        Ok(())
    }

    async fn touch(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<()> {
        cancellable(cancel, self.touch_record(session_id)).await
    }

    async fn user_sessions(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> TetherResult<Vec<String>> {
        cancellable(cancel, self.live_user_sessions(user_id)).await
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
