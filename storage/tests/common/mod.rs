//! Shared fixtures for the integration tests
//!
//! Every test gets its own SQLite file inside a temporary directory.

#![allow(dead_code)]

use sqlx::Row;
use std::path::{Path, PathBuf};
use std::time::Duration;
use storage::config::DbConfig;
use storage::service::db::{ConnectionManager, DbExecutor, DbServiceConfig, Statement};
use tempfile::TempDir;

/// Migration scripts shipped with the crate
pub fn shipped_migrations() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("db")
}

pub fn sqlite_config(dir: &TempDir) -> DbServiceConfig {
    DbServiceConfig::new(DbConfig::sqlite(dir.path().join("test.db")))
        .with_retry(1, Duration::from_millis(10))
        .with_acquire_timeout(Duration::from_secs(5))
}

/// Opens a pool on a fresh database file
pub async fn setup_test_db() -> (TempDir, ConnectionManager) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let connection = ConnectionManager::connect_until(&sqlite_config(&dir), std::future::pending())
        .await
        .expect("Failed to open test database");
    (dir, connection)
}

/// Writes a migration script under `<root>/sqlite3/`
pub fn write_migration(root: &Path, filename: &str, script: &str) {
    let dir = root.join("sqlite3");
    std::fs::create_dir_all(&dir).expect("Failed to create migration dir");
    std::fs::write(dir.join(filename), script).expect("Failed to write migration");
}

pub async fn count_rows(db: &dyn DbExecutor, table: &str) -> i64 {
    let stmt = Statement::raw(format!("SELECT COUNT(*) AS cnt FROM {table}"), vec![]);
    let row = db
        .fetch_optional(&stmt)
        .await
        .expect("Count query failed")
        .expect("Count query returned no row");
    row.try_get("cnt").expect("Missing cnt column")
}
