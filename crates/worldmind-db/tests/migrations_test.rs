//! Migration smoke tests: the schema applies cleanly and matches what the
//! query layer expects.

use worldmind_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn migrations_apply_and_create_checkpoints_table() {
    // create_test_db runs the migrations.
    let (pool, db_name) = create_test_db().await;

    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS( \
             SELECT 1 FROM information_schema.tables \
             WHERE table_schema = 'public' AND table_name = 'checkpoints')",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert!(exists, "checkpoints table should exist after migrations");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let (pool, db_name) = create_test_db().await;

    // Running the migrator again is a no-op, not an error.
    worldmind_db::pool::run_migrations(&pool)
        .await
        .expect("re-running migrations should succeed");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn primary_key_covers_mission_and_step() {
    let (pool, db_name) = create_test_db().await;

    // Same step id on different missions is allowed.
    sqlx::query("INSERT INTO checkpoints (mission_id, step_id, state) VALUES ('a', 1, '{}')")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO checkpoints (mission_id, step_id, state) VALUES ('b', 1, '{}')")
        .execute(&pool)
        .await
        .unwrap();

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM checkpoints")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);

    drop_test_db(&db_name).await;
}
