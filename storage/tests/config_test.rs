//! Instance and domain configuration integration tests

mod common;

use common::{count_rows, shipped_migrations, sqlite_config};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use storage::service::config::{
    instance_defaults, ConfigStore, ConfigTable, StaticDefaults, DOMAIN_CONFIG_TABLE,
    INSTANCE_CONFIG_TABLE,
};
use storage::service::db::{DbExecutor, Statement};
use storage::{AppError, DbError, ServiceContext};
use tempfile::TempDir;
use uuid::Uuid;

async fn setup_context() -> (TempDir, ServiceContext) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = sqlite_config(&dir).with_migrations(shipped_migrations(), None);
    let ctx = ServiceContext::init_until(config, std::future::pending())
        .await
        .expect("Failed to init service context");
    (dir, ctx)
}

fn changes(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn fresh_instance_store() -> ConfigStore {
    ConfigStore::new(
        ConfigTable::new(INSTANCE_CONFIG_TABLE),
        Arc::new(StaticDefaults::new(instance_defaults())),
    )
}

#[tokio::test]
async fn test_instance_defaults_served_without_rows() {
    let (_dir, ctx) = setup_context().await;

    let item = ctx
        .instance_setting("auth.signup.enabled")
        .await
        .expect("Lookup failed");
    assert_eq!(item.value, "true");
    assert!(item.is_default());
    assert_eq!(count_rows(ctx.connection(), INSTANCE_CONFIG_TABLE).await, 0);

    let all = ctx.instance_settings().await.expect("Listing failed");
    assert_eq!(all.len(), instance_defaults().len());
}

#[tokio::test]
async fn test_only_non_default_values_are_persisted() {
    let (_dir, ctx) = setup_context().await;
    let user = Uuid::new_v4();

    let changed = ctx
        .update_instance_settings(
            ctx.connection(),
            &changes(&[("auth.login.local.maxAttempts", "5")]),
            Some(user),
        )
        .await
        .expect("Update failed");
    assert_eq!(changed, 1);
    assert_eq!(count_rows(ctx.connection(), INSTANCE_CONFIG_TABLE).await, 1);

    // A second store reading the same table sees the override and its author
    let reloaded = fresh_instance_store();
    reloaded.load(ctx.connection()).await.expect("Load failed");
    let item = reloaded
        .get("auth.login.local.maxAttempts")
        .await
        .expect("Lookup failed");
    assert_eq!(item.value, "5");
    assert_eq!(item.updated_by, Some(user));
    assert!(item.updated_at.is_some());

    // Returning to the default removes the row
    ctx.update_instance_settings(
        ctx.connection(),
        &changes(&[("auth.login.local.maxAttempts", "10")]),
        None,
    )
    .await
    .expect("Update failed");
    assert_eq!(count_rows(ctx.connection(), INSTANCE_CONFIG_TABLE).await, 0);
}

#[tokio::test]
async fn test_invalid_batch_is_rejected_whole() {
    let (_dir, ctx) = setup_context().await;

    let result = ctx
        .update_instance_settings(
            ctx.connection(),
            &changes(&[
                ("auth.signup.enabled", "false"),
                ("auth.login.local.maxAttempts", "0"),
            ]),
            None,
        )
        .await;
    assert!(matches!(result, Err(AppError::InvalidInput(_))));

    let result = ctx
        .update_instance_settings(
            ctx.connection(),
            &changes(&[("auth.signup.enabled", "false"), ("no.such.key", "1")]),
            None,
        )
        .await;
    assert!(matches!(result, Err(AppError::InvalidInput(_))));

    let item = ctx
        .instance_setting("auth.signup.enabled")
        .await
        .expect("Lookup failed");
    assert_eq!(item.value, "true");
    assert_eq!(count_rows(ctx.connection(), INSTANCE_CONFIG_TABLE).await, 0);
}

#[tokio::test]
async fn test_unknown_persisted_keys_are_ignored() {
    let (_dir, ctx) = setup_context().await;
    let db = ctx.connection();

    let insert = db
        .insert_into(INSTANCE_CONFIG_TABLE)
        .columns(&["key", "value", "updated_at", "updated_by"])
        .row(vec![
            "retired.setting".into(),
            "x".into(),
            "2024-01-01T00:00:00Z".into(),
            Option::<String>::None.into(),
        ])
        .row(vec![
            "auth.login.local.maxAttempts".into(),
            "not a number".into(),
            "2024-01-01T00:00:00Z".into(),
            Option::<String>::None.into(),
        ])
        .build();
    db.execute(&insert).await.expect("Insert failed");

    let store = fresh_instance_store();
    store.load(db).await.expect("Load failed");
    assert!(!store.get_all().await.expect("Listing failed").contains_key("retired.setting"));
    assert!(matches!(
        store.get("retired.setting").await,
        Err(DbError::UnknownConfigKey(_))
    ));
    assert_eq!(store.get_int("auth.login.local.maxAttempts").await.expect("Lookup failed"), 10);
}

#[tokio::test]
async fn test_unknown_key_lookup_translates_to_invalid_input() {
    let (_dir, ctx) = setup_context().await;
    assert!(matches!(
        ctx.instance_setting("no.such.key").await,
        Err(AppError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_instance_update_restored_on_rollback() {
    let (_dir, ctx) = setup_context().await;

    let tx = ctx.transactions().begin().await.expect("Failed to begin");
    ctx.update_instance_settings(
        tx.as_ref(),
        &changes(&[("integrations.useGravatar", "false")]),
        None,
    )
    .await
    .expect("Update failed");
    ctx.update_instance_settings(
        tx.as_ref(),
        &changes(&[("integrations.useGravatar", "true"), ("operation.newOwner.enabled", "true")]),
        None,
    )
    .await
    .expect("Second update failed");
    tx.rollback().await.expect("Rollback failed");

    let gravatar = ctx.instance_setting("integrations.useGravatar").await.expect("Lookup failed");
    let new_owner = ctx.instance_setting("operation.newOwner.enabled").await.expect("Lookup failed");
    assert_eq!(gravatar.value, "true");
    assert_eq!(new_owner.value, "false");
    assert_eq!(count_rows(ctx.connection(), INSTANCE_CONFIG_TABLE).await, 0);
}

#[tokio::test]
async fn test_domain_defaults_follow_instance() {
    let (_dir, ctx) = setup_context().await;
    let db = ctx.connection();
    let domain = Uuid::new_v4();

    let item = ctx
        .domain_setting(db, &domain, "comments.maxLength")
        .await
        .expect("Lookup failed");
    assert_eq!(item.value, "4096");

    ctx.update_instance_settings(
        db,
        &changes(&[("domain.defaults.comments.maxLength", "8000")]),
        None,
    )
    .await
    .expect("Instance update failed");

    // The domain store is cached, yet follows the new instance default
    let item = ctx
        .domain_setting(db, &domain, "comments.maxLength")
        .await
        .expect("Lookup failed");
    assert_eq!(item.value, "8000");
    assert_eq!(item.default_value, "8000");
    assert!(item.is_default());
}

#[tokio::test]
async fn test_domain_override_survives_instance_change() {
    let (_dir, ctx) = setup_context().await;
    let db = ctx.connection();
    let domain = Uuid::new_v4();

    ctx.update_domain_settings(db, &domain, &changes(&[("comments.maxLength", "500")]), None)
        .await
        .expect("Domain update failed");
    assert_eq!(count_rows(db, DOMAIN_CONFIG_TABLE).await, 1);

    ctx.update_instance_settings(
        db,
        &changes(&[("domain.defaults.comments.maxLength", "9000")]),
        None,
    )
    .await
    .expect("Instance update failed");

    let item = ctx
        .domain_setting(db, &domain, "comments.maxLength")
        .await
        .expect("Lookup failed");
    assert_eq!(item.value, "500");
    assert_eq!(item.default_value, "9000");

    // Setting the inherited value drops the override row
    ctx.update_domain_settings(db, &domain, &changes(&[("comments.maxLength", "9000")]), None)
        .await
        .expect("Domain update failed");
    assert_eq!(count_rows(db, DOMAIN_CONFIG_TABLE).await, 0);

    // Other domains never saw the override
    let other = ctx
        .domain_settings(db, &Uuid::new_v4())
        .await
        .expect("Listing failed");
    assert_eq!(other["comments.maxLength"].value, "9000");
}

#[tokio::test]
async fn test_domain_update_reloaded_from_storage() {
    let (_dir, ctx) = setup_context().await;
    let db = ctx.connection();
    let domain = Uuid::new_v4();

    ctx.update_domain_settings(
        db,
        &domain,
        &changes(&[("markdown.images.enabled", "false"), ("comments.enableVoting", "false")]),
        None,
    )
    .await
    .expect("Domain update failed");

    ctx.domain_config().reset(&domain).await;
    let all = ctx.domain_settings(db, &domain).await.expect("Listing failed");
    assert_eq!(all["markdown.images.enabled"].value, "false");
    assert_eq!(all["comments.enableVoting"].value, "false");
    assert_eq!(all["markdown.links.enabled"].value, "true");

    let stmt = Statement::raw(
        format!("SELECT COUNT(*) AS cnt FROM {DOMAIN_CONFIG_TABLE} WHERE domain_id = ?"),
        vec![domain.into()],
    );
    let row = db.fetch_optional(&stmt).await.expect("Count failed").expect("No row");
    let count: i64 = sqlx::Row::try_get(&row, "cnt").expect("Missing cnt");
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_domain_update_invisible_outside_open_transaction() {
    let (_dir, ctx) = setup_context().await;
    let domain = Uuid::new_v4();

    // Warm the shared cache with the committed store
    ctx.domain_setting(ctx.connection(), &domain, "comments.maxLength")
        .await
        .expect("Lookup failed");

    let tx = ctx.transactions().begin().await.expect("Failed to begin");
    ctx.update_domain_settings(
        tx.as_ref(),
        &domain,
        &changes(&[("comments.maxLength", "500")]),
        None,
    )
    .await
    .expect("Domain update failed");

    let inside = ctx
        .domain_setting(tx.as_ref(), &domain, "comments.maxLength")
        .await
        .expect("Lookup failed");
    let outside = ctx
        .domain_setting(ctx.connection(), &domain, "comments.maxLength")
        .await
        .expect("Lookup failed");
    assert_eq!(inside.value, "500");
    assert_eq!(outside.value, "4096");

    tx.commit().await.expect("Commit failed");
    let after = ctx
        .domain_setting(ctx.connection(), &domain, "comments.maxLength")
        .await
        .expect("Lookup failed");
    assert_eq!(after.value, "500");
}

#[tokio::test]
async fn test_update_without_author_survives_restart() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = sqlite_config(&dir).with_migrations(shipped_migrations(), None);
    let ctx = ServiceContext::init_until(config.clone(), std::future::pending())
        .await
        .expect("Failed to init service context");

    ctx.update_instance_settings(
        ctx.connection(),
        &changes(&[("auth.signup.enabled", "false")]),
        None,
    )
    .await
    .expect("Update failed");

    let reloaded = fresh_instance_store();
    reloaded.load(ctx.connection()).await.expect("Load failed");
    let item = reloaded.get("auth.signup.enabled").await.expect("Lookup failed");
    assert_eq!(item.value, "false");
    assert_eq!(item.updated_by, None);
    ctx.shutdown().await;

    // Startup loads the same row
    let ctx = ServiceContext::init_until(config, std::future::pending())
        .await
        .expect("Restart failed");
    let item = ctx
        .instance_setting("auth.signup.enabled")
        .await
        .expect("Lookup failed");
    assert_eq!(item.value, "false");
    ctx.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_domain_updates_all_persist() {
    let (_dir, ctx) = setup_context().await;
    let db = ctx.connection();

    for _ in 0..10 {
        let domain = Uuid::new_v4();
        ctx.domain_setting(db, &domain, "comments.maxLength")
            .await
            .expect("Lookup failed");

        let length = changes(&[("comments.maxLength", "500")]);
        let images = changes(&[("markdown.images.enabled", "false")]);
        let (a, b) = tokio::join!(
            ctx.update_domain_settings(db, &domain, &length, None),
            ctx.update_domain_settings(db, &domain, &images, None),
        );
        a.expect("First update failed");
        b.expect("Second update failed");

        ctx.domain_config().reset(&domain).await;
        let all = ctx.domain_settings(db, &domain).await.expect("Listing failed");
        assert_eq!(all["comments.maxLength"].value, "500");
        assert_eq!(all["markdown.images.enabled"].value, "false");
    }
}

#[tokio::test]
async fn test_dropped_transaction_restores_instance_settings() {
    let (_dir, ctx) = setup_context().await;

    {
        let tx = ctx.transactions().begin().await.expect("Failed to begin");
        ctx.update_instance_settings(
            tx.as_ref(),
            &changes(&[("integrations.useGravatar", "false")]),
            None,
        )
        .await
        .expect("Update failed");
        let item = ctx
            .instance_setting("integrations.useGravatar")
            .await
            .expect("Lookup failed");
        assert_eq!(item.value, "false");
    }

    // Participants are rolled back on a background task
    let mut value = String::new();
    for _ in 0..50 {
        value = ctx
            .instance_setting("integrations.useGravatar")
            .await
            .expect("Lookup failed")
            .value;
        if value == "true" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(value, "true");
    assert_eq!(count_rows(ctx.connection(), INSTANCE_CONFIG_TABLE).await, 0);
}
