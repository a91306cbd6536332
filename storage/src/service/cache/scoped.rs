//! TTL cache of DB-backed objects keyed by scope
//!
//! Reads go through [`ScopedCache::get_or_load`]; writes go through
//! [`ScopedCache::store`] after the caller persisted the value with the same
//! executor. Inside a transaction a write is staged in a per-transaction
//! tracker: reads through that transaction see it, everyone else keeps
//! seeing the committed value. The tracker publishes its staged values once
//! the native commit succeeded and evicts every touched key when it rolls back.
//!
//! Writers of one key are serialised with [`ScopedCache::lock`]. Inside a
//! transaction the lock is held by the tracker until the transaction ends.

use crate::service::db::core::executor::DbExecutor;
use crate::service::db::core::transaction::{participant_key, Tx, TxParticipant};
use crate::tool::error::DbError;
use async_trait::async_trait;
use dashmap::DashMap;
use moka::future::Cache;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

type LockTable<K> = Arc<DashMap<K, Arc<Mutex<()>>>>;

/// Statistics for cache monitoring
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entry_count: u64,
}

/// Exclusive write access to one cache key, released on drop.
///
/// Empty when the key is held by the caller's transaction instead.
pub struct KeyLock<K: Hash + Eq> {
    held: Option<HeldLock<K>>,
}

struct HeldLock<K: Hash + Eq> {
    key: K,
    table: LockTable<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K: Hash + Eq + Clone> KeyLock<K> {
    async fn acquire(table: &LockTable<K>, key: &K) -> Self {
        let mutex = table.entry(key.clone()).or_default().value().clone();
        let guard = mutex.lock_owned().await;
        Self {
            held: Some(HeldLock {
                key: key.clone(),
                table: Arc::clone(table),
                guard: Some(guard),
            }),
        }
    }

    fn in_transaction() -> Self {
        Self { held: None }
    }

    /// Whether dropping this value releases the key
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl<K: Hash + Eq> Drop for HeldLock<K> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Forget the mutex once nobody holds or waits on it
        self.table
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Scope-keyed TTL cache with transaction-aware writes
pub struct ScopedCache<K: Hash + Eq, V> {
    id: u64,
    name: &'static str,
    shared: Cache<K, Arc<V>>,
    locks: LockTable<K>,
}

impl<K, V> ScopedCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(name: &'static str, capacity: u64, ttl: Duration) -> Self {
        Self {
            id: participant_key(),
            name,
            shared: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn tracker(&self, tx: &Tx) -> Arc<CacheTracker<K, V>> {
        tx.participant_or_insert_with(self.id, || {
            debug!("{}: joining transaction #{}", self.name, tx.id());
            Arc::new(CacheTracker {
                name: self.name,
                shared: self.shared.clone(),
                staged: DashMap::new(),
                held: DashMap::new(),
            })
        })
    }

    /// Serialises writers of `key`; hold the result across read, persist
    /// and [`store`](Self::store).
    ///
    /// Through a transaction the key stays locked until it commits or rolls
    /// back, and a second call from the same transaction does not block.
    /// A task must not write the key through the pool while its own open
    /// transaction holds it.
    pub async fn lock(&self, db: &dyn DbExecutor, key: &K) -> KeyLock<K> {
        let Some(tx) = db.transaction() else {
            return KeyLock::acquire(&self.locks, key).await;
        };
        let tracker = self.tracker(tx);
        if !tracker.held.contains_key(key) {
            let lock = KeyLock::acquire(&self.locks, key).await;
            debug!("{}: transaction #{} holds {:?}", self.name, tx.id(), key);
            tracker.held.insert(key.clone(), lock);
        }
        KeyLock::in_transaction()
    }

    /// Value as seen by `db`: a value staged by its transaction, else the
    /// shared entry, else whatever `load` builds.
    ///
    /// A miss inside a transaction is staged rather than shared, since the
    /// load may observe the transaction's own uncommitted rows.
    pub async fn get_or_load<F, Fut>(
        &self,
        db: &dyn DbExecutor,
        key: &K,
        load: F,
    ) -> Result<Arc<V>, DbError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, DbError>>,
    {
        let tx = db.transaction();
        if let Some(tracker) = tx.and_then(|tx| tx.participant::<CacheTracker<K, V>>(self.id)) {
            if let Some(value) = tracker.staged(key) {
                return Ok(value);
            }
        }

        if let Some(value) = self.shared.get(key).await {
            return Ok(value);
        }

        debug!("{}: miss for {:?}", self.name, key);
        let value = Arc::new(load().await?);
        match tx {
            Some(tx) => self.tracker(tx).stage(key.clone(), Arc::clone(&value)),
            None => self.shared.insert(key.clone(), Arc::clone(&value)).await,
        }
        Ok(value)
    }

    /// Records a value already persisted through `db`.
    pub async fn store(&self, db: &dyn DbExecutor, key: K, value: Arc<V>) {
        match db.transaction() {
            Some(tx) => self.tracker(tx).stage(key, value),
            None => self.shared.insert(key, value).await,
        }
    }

    /// Drops the shared entry for `key`
    pub async fn invalidate(&self, key: &K) {
        self.shared.invalidate(key).await;
    }

    pub fn invalidate_all(&self) {
        self.shared.invalidate_all();
    }

    /// Whether a shared (committed) entry exists for `key`
    pub async fn contains(&self, key: &K) -> bool {
        self.shared.get(key).await.is_some()
    }

    /// The shared (committed) entry for `key`, never loading
    pub async fn peek(&self, key: &K) -> Option<Arc<V>> {
        self.shared.get(key).await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.shared.entry_count(),
        }
    }
}

/// Per-transaction staging area of one cache
struct CacheTracker<K: Hash + Eq, V> {
    name: &'static str,
    shared: Cache<K, Arc<V>>,
    staged: DashMap<K, Arc<V>>,
    held: DashMap<K, KeyLock<K>>,
}

impl<K, V> CacheTracker<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn staged(&self, key: &K) -> Option<Arc<V>> {
        self.staged.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn stage(&self, key: K, value: Arc<V>) {
        self.staged.insert(key, value);
    }

    fn drain(&self) -> Vec<(K, Arc<V>)> {
        let keys: Vec<K> = self.staged.iter().map(|entry| entry.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.staged.remove(&key))
            .collect()
    }

    fn release(&self) {
        self.held.clear();
    }
}

#[async_trait]
impl<K, V> TxParticipant for CacheTracker<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    async fn commit(&self) -> Result<(), DbError> {
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbError> {
        let staged = self.drain();
        debug!("{}: evicting {} touched entries", self.name, staged.len());
        for (key, _) in staged {
            self.shared.invalidate(&key).await;
        }
        self.release();
        Ok(())
    }

    async fn after_commit(&self) {
        let staged = self.drain();
        debug!("{}: publishing {} entries", self.name, staged.len());
        for (key, value) in staged {
            self.shared.insert(key, value).await;
        }
        self.release();
    }
}
