//! Per-domain config store cache

use super::scoped::{CacheStats, ScopedCache};
use crate::service::config::{
    ConfigItem, ConfigStore, ConfigTable, DefaultSource, DerivedDefaults, DOMAIN_CONFIG_TABLE,
};
use crate::service::db::core::executor::DbExecutor;
use crate::tool::error::DbError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Lazily loaded domain config stores, defaults derived from the instance store
pub struct DomainConfigCache {
    cache: ScopedCache<Uuid, ConfigStore>,
    defaults: Arc<dyn DefaultSource>,
}

impl DomainConfigCache {
    pub fn new(instance: Arc<ConfigStore>, capacity: u64, ttl: Duration) -> Self {
        Self::with_defaults(Arc::new(DerivedDefaults::new(instance)), capacity, ttl)
    }

    pub fn with_defaults(defaults: Arc<dyn DefaultSource>, capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: ScopedCache::new("domain-config", capacity, ttl),
            defaults,
        }
    }

    fn table(domain_id: &Uuid) -> ConfigTable {
        ConfigTable::new(DOMAIN_CONFIG_TABLE).scoped("domain_id", *domain_id)
    }

    /// The domain's store as seen by `db`
    pub async fn get(&self, db: &dyn DbExecutor, domain_id: &Uuid) -> Result<Arc<ConfigStore>, DbError> {
        self.cache
            .get_or_load(db, domain_id, || async {
                let store = ConfigStore::new(Self::table(domain_id), Arc::clone(&self.defaults));
                store.load(db).await?;
                Ok(store)
            })
            .await
    }

    pub async fn get_item(
        &self,
        db: &dyn DbExecutor,
        domain_id: &Uuid,
        key: &str,
    ) -> Result<ConfigItem, DbError> {
        self.get(db, domain_id).await?.get(key).await
    }

    pub async fn get_all(
        &self,
        db: &dyn DbExecutor,
        domain_id: &Uuid,
    ) -> Result<HashMap<String, ConfigItem>, DbError> {
        self.get(db, domain_id).await?.get_all().await
    }

    /// Validates and persists `changes` through `db`, then caches the result.
    ///
    /// The cached store is replaced by an updated copy, so readers holding
    /// the previous store never see a half-applied batch. Updates of one
    /// domain run one at a time; through a transaction the domain stays
    /// locked until it finishes.
    pub async fn update(
        &self,
        db: &dyn DbExecutor,
        domain_id: &Uuid,
        changes: &HashMap<String, String>,
        user: Option<Uuid>,
    ) -> Result<usize, DbError> {
        let _lock = self.cache.lock(db, domain_id).await;
        let current = self.get(db, domain_id).await?;
        let next = current.duplicate().await?;
        let changed = next.update(changes, user).await?;
        next.save(db).await?;
        self.cache.store(db, *domain_id, Arc::new(next)).await;
        info!("Domain {} config: {} item(s) updated", domain_id, changed);
        Ok(changed)
    }

    /// Drops the cached store so the next read reloads it
    pub async fn reset(&self, domain_id: &Uuid) {
        self.cache.invalidate(domain_id).await;
    }

    pub fn reset_all(&self) {
        self.cache.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
