//! CRUD tests for the checkpoints table against a real PostgreSQL.

use serde_json::json;

use worldmind_db::queries::checkpoints as cp;
use worldmind_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn insert_and_fetch_latest() {
    let (pool, db_name) = create_test_db().await;

    let state = json!({"status": "classifying", "tasks": []});
    let row = cp::insert_checkpoint(&pool, "m-1", 1, None, &state)
        .await
        .expect("insert failed");
    assert_eq!(row.mission_id, "m-1");
    assert_eq!(row.step_id, 1);
    assert_eq!(row.parent_step_id, None);
    assert_eq!(row.state["status"], "classifying");

    cp::insert_checkpoint(&pool, "m-1", 2, Some(1), &json!({"status": "planning"}))
        .await
        .expect("second insert failed");

    let latest = cp::latest_checkpoint(&pool, "m-1")
        .await
        .unwrap()
        .expect("latest should exist");
    assert_eq!(latest.step_id, 2);
    assert_eq!(latest.parent_step_id, Some(1));
    assert_eq!(latest.state["status"], "planning");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn duplicate_step_is_rejected() {
    let (pool, db_name) = create_test_db().await;

    let state = json!({});
    cp::insert_checkpoint(&pool, "m-1", 1, None, &state)
        .await
        .unwrap();
    let dup = cp::insert_checkpoint(&pool, "m-1", 1, None, &state).await;
    assert!(dup.is_err(), "primary key should reject duplicate steps");

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_returns_chain_in_step_order() {
    let (pool, db_name) = create_test_db().await;

    // Insert out of order; the query sorts.
    cp::insert_checkpoint(&pool, "m-1", 3, Some(2), &json!({"n": 3}))
        .await
        .unwrap();
    cp::insert_checkpoint(&pool, "m-1", 1, None, &json!({"n": 1}))
        .await
        .unwrap();
    cp::insert_checkpoint(&pool, "m-1", 2, Some(1), &json!({"n": 2}))
        .await
        .unwrap();

    let chain = cp::list_checkpoints(&pool, "m-1").await.unwrap();
    let steps: Vec<i64> = chain.iter().map(|c| c.step_id).collect();
    assert_eq!(steps, vec![1, 2, 3]);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn missions_are_isolated() {
    let (pool, db_name) = create_test_db().await;

    cp::insert_checkpoint(&pool, "m-1", 1, None, &json!({"who": "one"}))
        .await
        .unwrap();
    cp::insert_checkpoint(&pool, "m-2", 1, None, &json!({"who": "two"}))
        .await
        .unwrap();

    let latest = cp::latest_checkpoint(&pool, "m-1").await.unwrap().unwrap();
    assert_eq!(latest.state["who"], "one");

    let chain = cp::list_checkpoints(&pool, "m-2").await.unwrap();
    assert_eq!(chain.len(), 1);

    let mut missions = cp::list_mission_ids(&pool).await.unwrap();
    missions.sort();
    assert_eq!(missions, vec!["m-1", "m-2"]);

    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn latest_on_empty_mission_is_none() {
    let (pool, db_name) = create_test_db().await;

    assert!(cp::latest_checkpoint(&pool, "ghost").await.unwrap().is_none());
    assert!(cp::list_checkpoints(&pool, "ghost").await.unwrap().is_empty());
    assert!(cp::list_mission_ids(&pool).await.unwrap().is_empty());

    drop_test_db(&db_name).await;
}
