//! Service context lifecycle tests

mod common;

use common::{shipped_migrations, sqlite_config, write_migration};
use std::collections::HashMap;
use storage::service::db::{DbExecutor, MigrationOutcome};
use storage::{DbError, ServiceContext};

#[tokio::test]
async fn test_init_migrates_and_shuts_down() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = sqlite_config(&dir).with_migrations(shipped_migrations(), None);

    let ctx = ServiceContext::init_until(config.clone(), std::future::pending())
        .await
        .expect("First init failed");
    assert!(ctx.migration_report().changed_anything());
    assert!(ctx.health_check().await.expect("Health check failed"));
    assert!(ctx.connection().stats().size >= 1);
    ctx.shutdown().await;

    // Restarting on the same database changes nothing
    let ctx = ServiceContext::init_until(config, std::future::pending())
        .await
        .expect("Second init failed");
    let report = ctx.migration_report();
    assert!(!report.changed_anything());
    assert_eq!(report.count(MigrationOutcome::UpToDate), report.decisions.len());
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_init_runs_seed_before_loading_config() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let seed = dir.path().join("seed.sql");
    std::fs::write(
        &seed,
        "INSERT INTO cm_configuration (key, value, updated_at) \
         VALUES ('auth.signup.enabled', 'false', $NOW('0 seconds'));\n",
    )
    .expect("Failed to write seed");

    let config = sqlite_config(&dir).with_migrations(shipped_migrations(), Some(seed));
    let ctx = ServiceContext::init_until(config, std::future::pending())
        .await
        .expect("Init failed");
    assert!(ctx.migration_report().seeded);

    let item = ctx
        .instance_setting("auth.signup.enabled")
        .await
        .expect("Lookup failed");
    assert_eq!(item.value, "false");
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_failed_migration_aborts_init() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let root = tempfile::tempdir().expect("Failed to create migration root");
    write_migration(root.path(), "0001_broken.sql", "CREATE TABLE oops (;\n");

    let config = sqlite_config(&dir).with_migrations(root.path(), None);
    let result = ServiceContext::init_until(config, std::future::pending()).await;
    assert!(matches!(result, Err(DbError::Migration { .. })));
}

#[tokio::test]
async fn test_interrupt_aborts_init() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = sqlite_config(&dir).with_migrations(shipped_migrations(), None);

    let result = ServiceContext::init_until(config, async {}).await;
    // Either the interrupt won the race or the connect did
    match result {
        Err(DbError::Interrupted) => {}
        Ok(ctx) => ctx.shutdown().await,
        Err(other) => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_with_transaction_translates_errors() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = sqlite_config(&dir).with_migrations(shipped_migrations(), None);
    let ctx = ServiceContext::init_until(config, std::future::pending())
        .await
        .expect("Init failed");

    let result: Result<(), _> = ctx
        .with_transaction(|tx| async move {
            tx.execute_script("SELECT * FROM no_such_table").await
        })
        .await;
    assert_eq!(result, Err(storage::AppError::Internal));

    let changes = HashMap::from([("comments.maxLength".to_string(), "1".to_string())]);
    let result = ctx
        .update_domain_settings(ctx.connection(), &uuid::Uuid::new_v4(), &changes, None)
        .await;
    assert!(matches!(result, Err(storage::AppError::InvalidInput(_))));
    ctx.shutdown().await;
}
