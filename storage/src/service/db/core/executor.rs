//! 쿼리 실행 모듈
//!
//! `DbExecutor` is the dialect-agnostic contract every store talks to. It is
//! implemented by the pool ([`ConnectionManager`](super::connection::ConnectionManager))
//! and by an open transaction ([`Tx`](super::transaction::Tx)), so callers pass
//! whichever they hold and stores never care which one it is.

use super::dialect::Dialect;
use super::statement::{DeleteBuilder, InsertBuilder, SelectBuilder, Statement, UpdateBuilder};
use super::transaction::Tx;
use super::types::SqlValue;
use crate::tool::error::DbError;
use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, Row, ValueRef};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Database executor contract
#[async_trait]
pub trait DbExecutor: Send + Sync {
    /// Dialect statements are rendered for
    fn dialect(&self) -> Dialect;

    /// The enclosing transaction, if this executor is one
    fn transaction(&self) -> Option<&Tx>;

    /// Runs a statement and returns the affected row count
    async fn execute(&self, stmt: &Statement) -> Result<u64, DbError>;

    async fn fetch_all(&self, stmt: &Statement) -> Result<Vec<AnyRow>, DbError>;

    async fn fetch_optional(&self, stmt: &Statement) -> Result<Option<AnyRow>, DbError>;

    /// Runs a multi-statement script without bind parameters
    async fn execute_script(&self, script: &str) -> Result<(), DbError>;

    fn select_from(&self, table: &str) -> SelectBuilder {
        SelectBuilder::new(self.dialect(), table)
    }

    fn insert_into(&self, table: &str) -> InsertBuilder {
        InsertBuilder::new(self.dialect(), table)
    }

    fn update(&self, table: &str) -> UpdateBuilder {
        UpdateBuilder::new(self.dialect(), table)
    }

    fn delete_from(&self, table: &str) -> DeleteBuilder {
        DeleteBuilder::new(self.dialect(), table)
    }

    /// Runs a statement that must touch exactly one row
    async fn execute_one(&self, stmt: &Statement) -> Result<(), DbError> {
        verify_one(self.execute(stmt).await?)
    }

    async fn table_exists(&self, table: &str) -> Result<bool, DbError> {
        let stmt = Statement::raw(self.dialect().table_exists_sql(), vec![table.into()]);
        let row = self.fetch_optional(&stmt).await?;
        let count: i64 = match row {
            Some(row) => row.try_get("cnt")?,
            None => 0,
        };
        Ok(count > 0)
    }
}

/// Checks an affected-row count equals one
pub fn verify_one(affected: u64) -> Result<(), DbError> {
    if affected == 1 {
        Ok(())
    } else {
        Err(DbError::UnexpectedRowCount(affected))
    }
}

/// Binds statement arguments onto an Any query
/// Reads a nullable TEXT column.
///
/// The `Any` driver cannot decode SQL `NULL` into `Option<String>`, so the
/// raw value is checked first.
pub fn try_get_nullable(row: &AnyRow, column: &str) -> Result<Option<String>, DbError> {
    if row.try_get_raw(column)?.is_null() {
        return Ok(None);
    }
    Ok(Some(row.try_get(column)?))
}

pub(crate) fn bind_args<'q>(stmt: &'q Statement) -> Query<'q, Any, AnyArguments<'q>> {
    let mut query = sqlx::query(&stmt.sql);
    for value in &stmt.args {
        query = match value {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Bytes(b) => query.bind(b.as_slice()),
        };
    }
    query
}

/// Query logging and slow-query detection shared by all executors
#[derive(Debug, Clone)]
pub(crate) struct QueryTracer {
    pub enable_query_logging: bool,
    pub slow_query_threshold: Duration,
}

impl QueryTracer {
    pub fn log_query(&self, stmt: &Statement) {
        if self.enable_query_logging {
            if stmt.args.is_empty() {
                debug!("Executing query: {}", stmt.sql);
            } else {
                debug!("Executing query: {} | Params: {:?}", stmt.sql, stmt.args);
            }
        }
    }

    pub fn check_slow_query(&self, sql: &str, started: Instant) {
        let elapsed = started.elapsed();
        if elapsed > self.slow_query_threshold {
            warn!(
                "Slow query detected ({} ms): {}",
                elapsed.as_millis(),
                sql.chars().take(200).collect::<String>()
            );
        }
    }
}

impl Default for QueryTracer {
    fn default() -> Self {
        Self {
            enable_query_logging: false,
            slow_query_threshold: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_one() {
        assert!(verify_one(1).is_ok());
        assert!(matches!(verify_one(0), Err(DbError::UnexpectedRowCount(0))));
        assert!(matches!(verify_one(2), Err(DbError::UnexpectedRowCount(2))));
    }
}
