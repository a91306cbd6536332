//! Service Context - Dependency Injection Implementation
//!
//! The one constructed object holding the connection, the instance config
//! store and every cache. [`ServiceContext::init`] is the single init point;
//! [`ServiceContext::shutdown`] tears down in reverse order.
//!
//! Methods on the context form the service boundary: internal [`DbError`]s
//! are logged and translated to [`AppError`] here and nowhere else.

use crate::service::attribute::{AttributeMap, AttributeStore};
use crate::service::cache::{AttributeCache, DomainConfigCache, DOMAIN_ATTRS_TABLE, USER_ATTRS_TABLE};
use crate::service::config::{
    instance_defaults, ConfigItem, ConfigStore, ConfigTable, StaticDefaults, INSTANCE_CONFIG_TABLE,
};
use crate::service::db::core::{
    ConnectionManager, DbExecutor, DbServiceConfig, MigrationEngine, MigrationReport,
    TransactionManager, Tx,
};
use crate::tool::error::{AppError, DbError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Wired persistence services
pub struct ServiceContext {
    config: DbServiceConfig,
    connection: ConnectionManager,
    transactions: TransactionManager,
    migration_report: MigrationReport,
    instance_config: Arc<ConfigStore>,
    domain_config: DomainConfigCache,
    user_attrs: AttributeCache,
    domain_attrs: AttributeCache,
}

impl ServiceContext {
    /// Connects (aborting on Ctrl-C), migrates, and builds every store.
    ///
    /// Any failure here is fatal: no partially migrated schema is served.
    pub async fn init(config: DbServiceConfig) -> Result<Self, DbError> {
        let connection = ConnectionManager::connect(&config).await?;
        Self::build(config, connection).await
    }

    /// Like [`init`](Self::init), with a caller-supplied interrupt
    pub async fn init_until<S>(config: DbServiceConfig, shutdown: S) -> Result<Self, DbError>
    where
        S: Future<Output = ()>,
    {
        let connection = ConnectionManager::connect_until(&config, shutdown).await?;
        Self::build(config, connection).await
    }

    async fn build(config: DbServiceConfig, connection: ConnectionManager) -> Result<Self, DbError> {
        let migrations = &config.migration_config;
        let engine = MigrationEngine::new(connection.clone(), &migrations.dir);
        let migration_report = match engine.migrate(migrations.seed_file.as_deref()).await {
            Ok(report) => report,
            Err(e) => {
                e.log("Database migration");
                connection.close().await;
                return Err(e);
            }
        };

        let instance_config = Arc::new(ConfigStore::new(
            ConfigTable::new(INSTANCE_CONFIG_TABLE),
            Arc::new(StaticDefaults::new(instance_defaults())),
        ));
        instance_config.load(&connection).await?;

        let cache = &config.cache_config;
        let domain_config =
            DomainConfigCache::new(Arc::clone(&instance_config), cache.capacity, cache.ttl);
        let user_attrs = AttributeCache::new(
            "user-attrs",
            AttributeStore::owner_checked(USER_ATTRS_TABLE, "user_id"),
            cache.capacity,
            cache.ttl,
        );
        let domain_attrs = AttributeCache::new(
            "domain-attrs",
            AttributeStore::new(DOMAIN_ATTRS_TABLE, "domain_id"),
            cache.capacity,
            cache.ttl,
        );

        info!(
            "Service context ready ({}, {} migration(s) known)",
            config.db_config.dialect()?,
            migration_report.decisions.len()
        );
        Ok(Self {
            transactions: TransactionManager::new(connection.clone()),
            config,
            connection,
            migration_report,
            instance_config,
            domain_config,
            user_attrs,
            domain_attrs,
        })
    }

    pub fn config(&self) -> &DbServiceConfig {
        &self.config
    }

    /// Pool-backed executor for work outside any transaction
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration_report
    }

    pub fn instance_config(&self) -> &Arc<ConfigStore> {
        &self.instance_config
    }

    pub fn domain_config(&self) -> &DomainConfigCache {
        &self.domain_config
    }

    pub fn user_attrs(&self) -> &AttributeCache {
        &self.user_attrs
    }

    pub fn domain_attrs(&self) -> &AttributeCache {
        &self.domain_attrs
    }

    /// Runs `operation` in a transaction, translating its error.
    pub async fn with_transaction<T, F, Fut>(&self, operation: F) -> Result<T, AppError>
    where
        F: FnOnce(Arc<Tx>) -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        self.transactions
            .with_transaction(operation)
            .await
            .map_err(|e| AppError::translate(e, "Transaction"))
    }

    pub async fn health_check(&self) -> Result<bool, AppError> {
        self.connection
            .health_check()
            .await
            .map_err(|e| AppError::translate(e, "Health check"))
    }

    pub async fn instance_setting(&self, key: &str) -> Result<ConfigItem, AppError> {
        self.instance_config
            .get(key)
            .await
            .map_err(|e| AppError::translate(e, "Instance config lookup"))
    }

    pub async fn instance_settings(&self) -> Result<HashMap<String, ConfigItem>, AppError> {
        self.instance_config
            .get_all()
            .await
            .map_err(|e| AppError::translate(e, "Instance config listing"))
    }

    pub async fn update_instance_settings(
        &self,
        db: &dyn DbExecutor,
        changes: &HashMap<String, String>,
        user: Option<Uuid>,
    ) -> Result<usize, AppError> {
        self.instance_config
            .update_and_save(db, changes, user)
            .await
            .map_err(|e| AppError::translate(e, "Instance config update"))
    }

    pub async fn domain_setting(
        &self,
        db: &dyn DbExecutor,
        domain_id: &Uuid,
        key: &str,
    ) -> Result<ConfigItem, AppError> {
        self.domain_config
            .get_item(db, domain_id, key)
            .await
            .map_err(|e| AppError::translate(e, "Domain config lookup"))
    }

    pub async fn domain_settings(
        &self,
        db: &dyn DbExecutor,
        domain_id: &Uuid,
    ) -> Result<HashMap<String, ConfigItem>, AppError> {
        self.domain_config
            .get_all(db, domain_id)
            .await
            .map_err(|e| AppError::translate(e, "Domain config listing"))
    }

    pub async fn update_domain_settings(
        &self,
        db: &dyn DbExecutor,
        domain_id: &Uuid,
        changes: &HashMap<String, String>,
        user: Option<Uuid>,
    ) -> Result<usize, AppError> {
        self.domain_config
            .update(db, domain_id, changes, user)
            .await
            .map_err(|e| AppError::translate(e, "Domain config update"))
    }

    pub async fn user_attributes(
        &self,
        db: &dyn DbExecutor,
        user_id: &Uuid,
    ) -> Result<AttributeMap, AppError> {
        self.user_attrs
            .get_all(db, user_id)
            .await
            .map_err(|e| AppError::translate(e, "User attributes lookup"))
    }

    pub async fn set_user_attributes(
        &self,
        db: &dyn DbExecutor,
        user_id: &Uuid,
        changes: &AttributeMap,
    ) -> Result<(), AppError> {
        self.user_attrs
            .set(db, user_id, changes)
            .await
            .map_err(|e| AppError::translate(e, "User attributes update"))
    }

    pub async fn domain_attributes(
        &self,
        db: &dyn DbExecutor,
        domain_id: &Uuid,
    ) -> Result<AttributeMap, AppError> {
        self.domain_attrs
            .get_all(db, domain_id)
            .await
            .map_err(|e| AppError::translate(e, "Domain attributes lookup"))
    }

    pub async fn set_domain_attributes(
        &self,
        db: &dyn DbExecutor,
        domain_id: &Uuid,
        changes: &AttributeMap,
    ) -> Result<(), AppError> {
        self.domain_attrs
            .set(db, domain_id, changes)
            .await
            .map_err(|e| AppError::translate(e, "Domain attributes update"))
    }

    /// Tears down in reverse construction order.
    pub async fn shutdown(self) {
        info!("Shutting down service context");
        self.domain_attrs.reset_all();
        self.user_attrs.reset_all();
        self.domain_config.reset_all();
        self.connection.close().await;
    }
}
