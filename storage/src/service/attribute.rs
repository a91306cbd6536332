//! Owner-scoped attribute store
//!
//! Flat key/value maps persisted one row per (owner, key). An empty value
//! deletes the key.

use crate::service::db::core::executor::DbExecutor;
use crate::tool::current_time::CurrentTime;
use crate::tool::error::DbError;
use sqlx::Row;
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

/// Longest accepted key, in bytes
pub const MAX_KEY_LEN: usize = 255;

/// Longest accepted value, in bytes
pub const MAX_VALUE_LEN: usize = 4096;

pub type AttributeMap = HashMap<String, String>;

/// Table layout and owner policy of one attribute kind
#[derive(Debug, Clone)]
pub struct AttributeStore {
    table: String,
    owner_column: String,
    owner_checked: bool,
}

impl AttributeStore {
    pub fn new(table: &str, owner_column: &str) -> Self {
        Self {
            table: table.to_string(),
            owner_column: owner_column.to_string(),
            owner_checked: false,
        }
    }

    /// Store whose anonymous (nil) owner never has attributes
    pub fn owner_checked(table: &str, owner_column: &str) -> Self {
        Self {
            owner_checked: true,
            ..Self::new(table, owner_column)
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Whether `owner` can never hold attributes here
    pub fn is_anonymous(&self, owner: &Uuid) -> bool {
        self.owner_checked && owner.is_nil()
    }

    /// Checks key and value sizes of a whole batch.
    pub fn validate(&self, owner: &Uuid, changes: &AttributeMap) -> Result<(), DbError> {
        if self.is_anonymous(owner) {
            return Err(DbError::InvalidAttribute(
                "anonymous owner cannot have attributes".to_string(),
            ));
        }
        for (key, value) in changes {
            if key.is_empty() {
                return Err(DbError::InvalidAttribute("empty key".to_string()));
            }
            if key.len() > MAX_KEY_LEN {
                return Err(DbError::InvalidAttribute(format!(
                    "key is {} bytes long, at most {} allowed",
                    key.len(),
                    MAX_KEY_LEN
                )));
            }
            if value.len() > MAX_VALUE_LEN {
                return Err(DbError::InvalidAttribute(format!(
                    "value of '{}' is {} bytes long, at most {} allowed",
                    key,
                    value.len(),
                    MAX_VALUE_LEN
                )));
            }
        }
        Ok(())
    }

    /// Every attribute of `owner`
    pub async fn load(&self, db: &dyn DbExecutor, owner: &Uuid) -> Result<AttributeMap, DbError> {
        if self.is_anonymous(owner) {
            return Ok(AttributeMap::new());
        }
        let stmt = db
            .select_from(&self.table)
            .columns(&["key", "value"])
            .filter_eq(&self.owner_column, *owner)
            .build();
        let rows = db.fetch_all(&stmt).await?;

        let mut attrs = AttributeMap::with_capacity(rows.len());
        for row in &rows {
            attrs.insert(row.try_get("key")?, row.try_get("value")?);
        }
        Ok(attrs)
    }

    /// Validates, then writes every change: empty values delete, others upsert.
    pub async fn persist(
        &self,
        db: &dyn DbExecutor,
        owner: &Uuid,
        changes: &AttributeMap,
    ) -> Result<(), DbError> {
        self.validate(owner, changes)?;

        let now = CurrentTime::new().to_db_string();
        for (key, value) in changes {
            if value.is_empty() {
                let stmt = db
                    .delete_from(&self.table)
                    .filter_eq(&self.owner_column, *owner)
                    .filter_eq("key", key.as_str())
                    .build();
                let deleted = db.execute(&stmt).await?;
                debug!("{}: {} deleted '{}' ({} row)", self.table, owner, key, deleted);
            } else {
                let stmt = db
                    .insert_into(&self.table)
                    .columns(&[self.owner_column.as_str(), "key", "value", "updated_at"])
                    .row(vec![
                        (*owner).into(),
                        key.as_str().into(),
                        value.as_str().into(),
                        now.as_str().into(),
                    ])
                    .on_conflict_update(&[self.owner_column.as_str(), "key"], &["value", "updated_at"])
                    .build();
                db.execute(&stmt).await?;
            }
        }
        Ok(())
    }
}

/// Applies a persisted batch to an in-memory map.
pub fn apply_changes(attrs: &mut AttributeMap, changes: &AttributeMap) {
    for (key, value) in changes {
        if value.is_empty() {
            attrs.remove(key);
        } else {
            attrs.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(pairs: &[(&str, &str)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_size_limits() {
        let store = AttributeStore::new("cm_domain_attrs", "domain_id");
        let owner = Uuid::new_v4();

        let max_key = "k".repeat(MAX_KEY_LEN);
        let long_key = "k".repeat(MAX_KEY_LEN + 1);
        let long_value = "v".repeat(MAX_VALUE_LEN + 1);
        assert!(store.validate(&owner, &batch(&[(max_key.as_str(), "ok")])).is_ok());
        assert!(store.validate(&owner, &batch(&[(long_key.as_str(), "v")])).is_err());
        assert!(store.validate(&owner, &batch(&[("k", long_value.as_str())])).is_err());
        assert!(store.validate(&owner, &batch(&[("", "v")])).is_err());
    }

    #[test]
    fn test_anonymous_owner() {
        let checked = AttributeStore::owner_checked("cm_user_attrs", "user_id");
        let unchecked = AttributeStore::new("cm_domain_attrs", "domain_id");
        assert!(checked.is_anonymous(&Uuid::nil()));
        assert!(!unchecked.is_anonymous(&Uuid::nil()));
        assert!(matches!(
            checked.validate(&Uuid::nil(), &batch(&[("k", "v")])),
            Err(DbError::InvalidAttribute(_))
        ));
    }

    #[test]
    fn test_apply_changes() {
        let mut attrs = batch(&[("a", "1"), ("b", "2")]);
        apply_changes(&mut attrs, &batch(&[("a", ""), ("c", "3"), ("zzz", "")]));
        assert_eq!(attrs, batch(&[("b", "2"), ("c", "3")]));
    }
}
