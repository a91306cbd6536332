//! Generic config store
//!
//! One in-memory map of [`ConfigItem`]s behind a single read/write lock,
//! populated from a [`DefaultSource`] and overlaid with the rows of a scoped
//! table. Only items whose value differs from the default are persisted.

use super::defaults::DefaultSource;
use super::item::ConfigItem;
use crate::service::db::core::executor::{try_get_nullable, DbExecutor};
use crate::service::db::core::transaction::{participant_key, TxParticipant};
use crate::service::db::core::types::SqlValue;
use crate::tool::current_time::{format_db_time, parse_db_time, CurrentTime};
use crate::tool::error::DbError;
use async_trait::async_trait;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

type ItemMap = HashMap<String, ConfigItem>;

/// Backing table of a store plus the columns scoping its rows
#[derive(Debug, Clone)]
pub struct ConfigTable {
    pub name: String,
    pub scope: Vec<(String, SqlValue)>,
}

impl ConfigTable {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scope: Vec::new(),
        }
    }

    /// Adds a scoping column, e.g. `domain_id`
    pub fn scoped(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.scope.push((column.to_string(), value.into()));
        self
    }
}

/// Lock-protected map of typed, validated settings
pub struct ConfigStore {
    key: u64,
    table: ConfigTable,
    defaults: Arc<dyn DefaultSource>,
    items: RwLock<Option<ItemMap>>,
}

impl ConfigStore {
    pub fn new(table: ConfigTable, defaults: Arc<dyn DefaultSource>) -> Self {
        Self {
            key: participant_key(),
            table,
            defaults,
            items: RwLock::new(None),
        }
    }

    pub fn table(&self) -> &ConfigTable {
        &self.table
    }

    pub async fn is_initialised(&self) -> bool {
        self.items.read().await.is_some()
    }

    async fn default_map(&self) -> Result<ItemMap, DbError> {
        Ok(self
            .defaults
            .items()
            .await?
            .into_iter()
            .map(|item| (item.key.clone(), item))
            .collect())
    }

    /// Populates every item with its default, discarding loaded values.
    pub async fn reset_to_defaults(&self) -> Result<(), DbError> {
        let map = self.default_map().await?;
        *self.items.write().await = Some(map);
        Ok(())
    }

    /// Repopulates from defaults, then overlays the persisted rows.
    ///
    /// Rows with unknown keys, invalid values or values equal to the default
    /// are ignored.
    pub async fn load(&self, db: &dyn DbExecutor) -> Result<(), DbError> {
        let mut map = self.default_map().await?;

        let stmt = db
            .select_from(&self.table.name)
            .columns(&["key", "value", "updated_at", "updated_by"])
            .filter_all(&self.table.scope)
            .build();
        let rows = db.fetch_all(&stmt).await?;

        let mut overlaid = 0usize;
        for row in &rows {
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;
            let Some(item) = map.get_mut(&key) else {
                debug!("{}: ignoring unknown config key '{}'", self.table.name, key);
                continue;
            };
            if let Err(e) = item.validate_value(&value) {
                warn!("{}: ignoring persisted value: {}", self.table.name, e);
                continue;
            }
            if value == item.default_value {
                continue;
            }
            let updated_at: String = row.try_get("updated_at")?;
            let updated_by = try_get_nullable(row, "updated_by")?;
            item.value = value;
            item.updated_at = parse_db_time(&updated_at);
            item.updated_by = updated_by.and_then(|u| Uuid::parse_str(&u).ok());
            overlaid += 1;
        }

        debug!(
            "{}: loaded {} item(s), {} overridden",
            self.table.name,
            map.len(),
            overlaid
        );
        *self.items.write().await = Some(map);
        Ok(())
    }

    /// Replaces the persisted rows with the current non-default items.
    pub async fn save(&self, db: &dyn DbExecutor) -> Result<(), DbError> {
        let mut guard = self.items.write().await;
        let map = guard.as_mut().ok_or(DbError::StoreNotInitialised)?;
        self.refresh_defaults(map).await?;
        self.persist(db, map).await
    }

    async fn persist(&self, db: &dyn DbExecutor, map: &ItemMap) -> Result<(), DbError> {
        let delete = db
            .delete_from(&self.table.name)
            .filter_all(&self.table.scope)
            .build();
        db.execute(&delete).await?;

        let mut changed: Vec<&ConfigItem> = map.values().filter(|i| !i.is_default()).collect();
        if changed.is_empty() {
            return Ok(());
        }
        changed.sort_by(|a, b| a.key.cmp(&b.key));

        let mut columns: Vec<&str> = self.table.scope.iter().map(|(c, _)| c.as_str()).collect();
        columns.extend(["key", "value", "updated_at", "updated_by"]);

        let now = CurrentTime::new().to_db_string();
        let mut insert = db.insert_into(&self.table.name).columns(&columns);
        for item in &changed {
            let mut row: Vec<SqlValue> = self.table.scope.iter().map(|(_, v)| v.clone()).collect();
            row.push(item.key.as_str().into());
            row.push(item.value.as_str().into());
            row.push(
                item.updated_at
                    .map(|t| format_db_time(&t))
                    .unwrap_or_else(|| now.clone())
                    .into(),
            );
            row.push(item.updated_by.into());
            insert = insert.row(row);
        }
        db.execute(&insert.build()).await?;
        debug!("{}: saved {} item(s)", self.table.name, changed.len());
        Ok(())
    }

    /// Validates every change, then applies them all.
    ///
    /// A batch with any unknown key or invalid value leaves every item
    /// untouched. Returns how many items changed.
    pub async fn update(
        &self,
        changes: &HashMap<String, String>,
        user: Option<Uuid>,
    ) -> Result<usize, DbError> {
        let mut guard = self.items.write().await;
        let map = guard.as_mut().ok_or(DbError::StoreNotInitialised)?;
        self.refresh_defaults(map).await?;
        apply_changes(map, changes, user)
    }

    /// Updates, persists through `db`, and only then publishes the new values.
    ///
    /// Inside a transaction the previous values are restored if it rolls back.
    pub async fn update_and_save(
        self: &Arc<Self>,
        db: &dyn DbExecutor,
        changes: &HashMap<String, String>,
        user: Option<Uuid>,
    ) -> Result<usize, DbError> {
        let mut guard = self.items.write().await;
        let current = guard.as_ref().ok_or(DbError::StoreNotInitialised)?;

        let mut next = current.clone();
        self.refresh_defaults(&mut next).await?;
        let changed = apply_changes(&mut next, changes, user)?;
        self.persist(db, &next).await?;

        if let Some(previous) = guard.replace(next) {
            if let Some(tx) = db.transaction() {
                let store = Arc::clone(self);
                tx.participant_or_insert_with(self.key, move || {
                    Arc::new(RestoreOnRollback {
                        store,
                        previous: parking_lot::Mutex::new(Some(previous)),
                    })
                });
            }
        }
        info!("{}: {} item(s) updated", self.table.name, changed);
        Ok(changed)
    }

    /// Item copy with its default resolved now
    pub async fn get(&self, key: &str) -> Result<ConfigItem, DbError> {
        let item = {
            let guard = self.items.read().await;
            let map = guard.as_ref().ok_or(DbError::StoreNotInitialised)?;
            map.get(key)
                .cloned()
                .ok_or_else(|| DbError::UnknownConfigKey(key.to_string()))?
        };
        self.resolve(item).await
    }

    /// Copies of every item, defaults resolved now
    pub async fn get_all(&self) -> Result<ItemMap, DbError> {
        let mut map = {
            let guard = self.items.read().await;
            guard.as_ref().ok_or(DbError::StoreNotInitialised)?.clone()
        };
        self.refresh_defaults(&mut map).await?;
        Ok(map)
    }

    pub async fn get_bool(&self, key: &str) -> Result<bool, DbError> {
        let item = self.get(key).await?;
        item.as_bool().ok_or_else(|| DbError::InvalidConfigValue {
            key: key.to_string(),
            reason: format!("{} item read as bool", item.datatype),
        })
    }

    pub async fn get_int(&self, key: &str) -> Result<i64, DbError> {
        let item = self.get(key).await?;
        item.as_int().ok_or_else(|| DbError::InvalidConfigValue {
            key: key.to_string(),
            reason: format!("{} item read as int", item.datatype),
        })
    }

    /// An independent store with the same table, defaults and items
    pub async fn duplicate(&self) -> Result<ConfigStore, DbError> {
        let items = self.items.read().await.clone();
        if items.is_none() {
            return Err(DbError::StoreNotInitialised);
        }
        Ok(ConfigStore {
            key: participant_key(),
            table: self.table.clone(),
            defaults: Arc::clone(&self.defaults),
            items: RwLock::new(items),
        })
    }

    async fn resolve(&self, mut item: ConfigItem) -> Result<ConfigItem, DbError> {
        if let Some(default) = self.defaults.live_default(&item.key).await? {
            if item.is_default() {
                item.value = default.clone();
            }
            item.default_value = default;
        }
        Ok(item)
    }

    async fn refresh_defaults(&self, map: &mut ItemMap) -> Result<(), DbError> {
        for item in map.values_mut() {
            if let Some(default) = self.defaults.live_default(&item.key).await? {
                if item.is_default() {
                    item.value = default.clone();
                }
                item.default_value = default;
            }
        }
        Ok(())
    }
}

fn apply_changes(
    map: &mut ItemMap,
    changes: &HashMap<String, String>,
    user: Option<Uuid>,
) -> Result<usize, DbError> {
    for (key, value) in changes {
        let item = map
            .get(key)
            .ok_or_else(|| DbError::UnknownConfigKey(key.clone()))?;
        item.validate_value(value)?;
    }

    let now = CurrentTime::new().current_time;
    let mut changed = 0;
    for (key, value) in changes {
        if let Some(item) = map.get_mut(key) {
            if item.value != *value {
                item.value = value.clone();
                item.updated_at = Some(now);
                item.updated_by = user;
                changed += 1;
            }
        }
    }
    Ok(changed)
}

/// Puts back the values a rolled-back transaction replaced
struct RestoreOnRollback {
    store: Arc<ConfigStore>,
    previous: parking_lot::Mutex<Option<ItemMap>>,
}

#[async_trait]
impl TxParticipant for RestoreOnRollback {
    async fn commit(&self) -> Result<(), DbError> {
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbError> {
        let previous = self.previous.lock().take();
        if let Some(previous) = previous {
            *self.store.items.write().await = Some(previous);
            debug!("{}: restored values after rollback", self.store.table.name);
        }
        Ok(())
    }

    async fn after_commit(&self) {
        self.previous.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::config::defaults::StaticDefaults;
    use crate::service::config::item::ConfigItem;

    fn store() -> ConfigStore {
        ConfigStore::new(
            ConfigTable::new("cm_configuration"),
            Arc::new(StaticDefaults::new(vec![
                ConfigItem::bool("a.flag", true, "a"),
                ConfigItem::int("a.limit", 10, Some(1), Some(100), "a"),
            ])),
        )
    }

    fn changes(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_uninitialised_store_fails_reads() {
        let store = store();
        assert!(matches!(store.get("a.flag").await, Err(DbError::StoreNotInitialised)));
        assert!(matches!(store.get_all().await, Err(DbError::StoreNotInitialised)));
        assert!(matches!(
            store.update(&changes(&[("a.flag", "false")]), None).await,
            Err(DbError::StoreNotInitialised)
        ));
    }

    #[tokio::test]
    async fn test_invalid_batch_changes_nothing() {
        let store = store();
        store.reset_to_defaults().await.unwrap();

        let result = store
            .update(&changes(&[("a.flag", "false"), ("a.limit", "1000")]), None)
            .await;
        assert!(matches!(result, Err(DbError::InvalidConfigValue { .. })));
        assert!(store.get_bool("a.flag").await.unwrap());
        assert_eq!(store.get_int("a.limit").await.unwrap(), 10);

        let result = store
            .update(&changes(&[("a.flag", "false"), ("a.nope", "1")]), None)
            .await;
        assert!(matches!(result, Err(DbError::UnknownConfigKey(_))));
        assert!(store.get_bool("a.flag").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_records_author() {
        let store = store();
        store.reset_to_defaults().await.unwrap();
        let user = Uuid::new_v4();

        let changed = store
            .update(&changes(&[("a.flag", "false"), ("a.limit", "10")]), Some(user))
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let item = store.get("a.flag").await.unwrap();
        assert_eq!(item.value, "false");
        assert_eq!(item.updated_by, Some(user));
        assert!(item.updated_at.is_some());
        assert!(store.get("a.limit").await.unwrap().updated_by.is_none());
    }

    #[tokio::test]
    async fn test_get_returns_copies() {
        let store = store();
        store.reset_to_defaults().await.unwrap();
        let mut all = store.get_all().await.unwrap();
        all.get_mut("a.flag").unwrap().value = "false".to_string();
        assert!(store.get_bool("a.flag").await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_is_independent() {
        let store = store();
        store.reset_to_defaults().await.unwrap();
        let copy = store.duplicate().await.unwrap();
        copy.update(&changes(&[("a.limit", "42")]), None).await.unwrap();
        assert_eq!(copy.get_int("a.limit").await.unwrap(), 42);
        assert_eq!(store.get_int("a.limit").await.unwrap(), 10);
    }
}
