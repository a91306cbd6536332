//! Per-owner attribute cache

use super::scoped::{CacheStats, ScopedCache};
use crate::service::attribute::{apply_changes, AttributeMap, AttributeStore};
use crate::service::db::core::executor::DbExecutor;
use crate::tool::error::DbError;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Attribute maps cached per owner; callers always get copies
pub struct AttributeCache {
    store: AttributeStore,
    cache: ScopedCache<Uuid, AttributeMap>,
}

impl AttributeCache {
    pub fn new(name: &'static str, store: AttributeStore, capacity: u64, ttl: Duration) -> Self {
        Self {
            store,
            cache: ScopedCache::new(name, capacity, ttl),
        }
    }

    pub fn store(&self) -> &AttributeStore {
        &self.store
    }

    async fn cached(&self, db: &dyn DbExecutor, owner: &Uuid) -> Result<Arc<AttributeMap>, DbError> {
        self.cache
            .get_or_load(db, owner, || self.store.load(db, owner))
            .await
    }

    /// Copy of every attribute of `owner`
    pub async fn get_all(&self, db: &dyn DbExecutor, owner: &Uuid) -> Result<AttributeMap, DbError> {
        if self.store.is_anonymous(owner) {
            return Ok(AttributeMap::new());
        }
        Ok(self.cached(db, owner).await?.as_ref().clone())
    }

    pub async fn get(
        &self,
        db: &dyn DbExecutor,
        owner: &Uuid,
        key: &str,
    ) -> Result<Option<String>, DbError> {
        if self.store.is_anonymous(owner) {
            return Ok(None);
        }
        Ok(self.cached(db, owner).await?.get(key).cloned())
    }

    /// Persists `changes` through `db` and caches the resulting map.
    ///
    /// Empty values delete their key; deleting a missing key is a no-op.
    /// Writers of one owner are serialised, so the cached map always
    /// matches the rows.
    pub async fn set(
        &self,
        db: &dyn DbExecutor,
        owner: &Uuid,
        changes: &AttributeMap,
    ) -> Result<(), DbError> {
        self.store.validate(owner, changes)?;
        let _lock = self.cache.lock(db, owner).await;
        let mut attrs = self.cached(db, owner).await?.as_ref().clone();
        self.store.persist(db, owner, changes).await?;
        apply_changes(&mut attrs, changes);
        debug!("{}: {} now has {} attribute(s)", self.cache.name(), owner, attrs.len());
        self.cache.store(db, *owner, Arc::new(attrs)).await;
        Ok(())
    }

    pub async fn set_one(
        &self,
        db: &dyn DbExecutor,
        owner: &Uuid,
        key: &str,
        value: &str,
    ) -> Result<(), DbError> {
        let changes = AttributeMap::from([(key.to_string(), value.to_string())]);
        self.set(db, owner, &changes).await
    }

    pub async fn reset(&self, owner: &Uuid) {
        self.cache.invalidate(owner).await;
    }

    pub fn reset_all(&self) {
        self.cache.invalidate_all();
    }

    /// Whether a committed map for `owner` is currently cached
    pub async fn is_cached(&self, owner: &Uuid) -> bool {
        self.cache.contains(owner).await
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
