//! Session metadata persistence.
//!
//! Three backends share one contract and differ only in consistency:
//!
//! - [`LocalSessionStore`]: in-process sharded maps, explicit pruning.
//! - [`TransactionalSessionStore`]: primary record and per-user set written
//!   in one transaction, expiry delegated to per-key TTLs.
//! - [`CachedSessionStore`]: plain key/value cache; the per-user index is a
//!   read-modify-write list and may lag the primary records.
//!
//! Every operation takes a cancellation token and reports an unreachable
//! backend as [`TetherError::StoreUnavailable`], never as "absent".

pub mod cache;
pub mod codec;
pub mod local;
pub mod retry;
pub mod transactional;

pub use cache::{CachedSessionStore, DistributedCache, MemoryDistributedCache};
pub use local::LocalSessionStore;
pub use retry::{retry_cas, CasOutcome, CasStep};
pub use transactional::{
    MemoryTransactionalClient, Transaction, TransactionalClient, TransactionalSessionStore,
    TxCommand,
};

use crate::core::clock::Clock;
use crate::domain::config::{StoreBackend, StoreConfig};
use crate::domain::error::{TetherError, TetherResult};
use crate::domain::metadata::SessionMetadata;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Pluggable persistence over [`SessionMetadata`]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Instance id stamped on every write from this process
    fn instance_id(&self) -> &str;

    async fn exists(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<bool>;

    /// Malformed records come back as `None`
    async fn get(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> TetherResult<Option<SessionMetadata>>;

    /// Persist `metadata`, overwriting `owner_instance_id` with this instance
    async fn set(
        &self,
        session_id: &str,
        metadata: SessionMetadata,
        cancel: &CancellationToken,
    ) -> TetherResult<()>;

    /// Delete the record and its user index membership; absent ids are a no-op
    async fn remove(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<()>;

    /// Refresh last activity and expiry; absent ids are a no-op
    async fn touch(&self, session_id: &str, cancel: &CancellationToken) -> TetherResult<()>;

    async fn user_sessions(
        &self,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> TetherResult<Vec<String>>;

    /// Remove records idle for longer than `idle_timeout`, returning the count
    async fn prune_expired(
        &self,
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> TetherResult<usize>;

    async fn owner_server(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> TetherResult<Option<String>> {
        Ok(self
            .get(session_id, cancel)
            .await?
            .and_then(|metadata| metadata.owner_instance_id))
    }

    async fn is_owned_by_this_server(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> TetherResult<bool> {
        let owner = self.owner_server(session_id, cancel).await?;
        Ok(owner.as_deref() == Some(self.instance_id()))
    }

    /// Claim the session for this instance.
    ///
    /// Plain get + set: concurrent claims resolve to whichever write lands
    /// last. Returns `false` when there is no record to claim.
    async fn transfer_ownership(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> TetherResult<bool> {
        match self.get(session_id, cancel).await? {
            Some(metadata) => {
                self.set(session_id, metadata, cancel).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Settings shared by every backend
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub key_prefix: String,
    pub default_ttl: Duration,
    pub instance_id: String,
    pub touch_attempts: usize,
}

impl StoreOptions {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            key_prefix: config.key_prefix.clone(),
            default_ttl: config.default_ttl(),
            instance_id: config.resolved_instance_id(),
            touch_attempts: config.touch_attempts.max(1),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Key of the primary record for a session
    pub fn session_key(&self, session_id: &str) -> String {
        format!("{}meta:{}", self.key_prefix, session_id)
    }

    /// Key of the per-user session index
    pub fn user_key(&self, user_id: &str) -> String {
        format!("{}user:{}", self.key_prefix, user_id)
    }

    pub(crate) fn stamp(&self, mut metadata: SessionMetadata) -> SessionMetadata {
        metadata.owner_instance_id = Some(self.instance_id.clone());
        metadata
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Build a store for `config`.
///
/// Remote backends are wired to their in-process clients; deployments with a
/// real backend construct the store around their own client instead.
pub fn build_store(config: &StoreConfig, clock: Arc<dyn Clock>) -> Arc<dyn SessionStore> {
    let options = StoreOptions::from_config(config);
    match config.backend {
        StoreBackend::Local => Arc::new(LocalSessionStore::new(options, clock)),
        StoreBackend::Transactional => {
            let client = Arc::new(MemoryTransactionalClient::new(Arc::clone(&clock)));
            Arc::new(TransactionalSessionStore::new(client, options, clock))
        }
        StoreBackend::Cache => {
            let cache = Arc::new(MemoryDistributedCache::new());
            Arc::new(CachedSessionStore::new(cache, options, clock))
        }
    }
}

pub(crate) fn ensure_not_cancelled(cancel: &CancellationToken) -> TetherResult<()> {
    if cancel.is_cancelled() {
        Err(TetherError::Cancelled)
    } else {
        Ok(())
    }
}

/// Race `fut` against `cancel`
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> TetherResult<T>
where
    F: Future<Output = TetherResult<T>>,
{
    ensure_not_cancelled(cancel)?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TetherError::Cancelled),
        result = fut => result,
    }
}
