//! Coverage for the two primary-side scenarios that don't touch the apply
//! pipeline: TOFU fingerprint pairing and the stale-task reaper.

use rusqlite::params;
use std::time::Duration;
use sync_primary::db;
use sync_primary::error::AppError;
use sync_primary::models::task;
use sync_primary::registry::node_registry::NodeRegistry;
use sync_primary::tasks::TaskStore;
use sync_protocol::model::NodeType;

async fn fresh_db() -> (db::connection::Db, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let db = db::connection::open(":memory:").unwrap();
    db::migrate::migrate(&db, dir.path()).await.unwrap();
    (db, dir)
}

#[tokio::test]
async fn first_hello_pairs_the_fingerprint_and_the_second_must_match() {
    let (db, _dir) = fresh_db().await;
    let registry = NodeRegistry::new(db);
    let node = registry.create("agent-1", "10.0.0.5:0", NodeType::Agent).await.unwrap();

    registry.verify_or_pair_fingerprint(node.id, "fp-a").await.unwrap();

    let same = registry.verify_or_pair_fingerprint(node.id, "fp-a").await;
    assert!(same.is_ok());
}

#[tokio::test]
async fn a_changed_fingerprint_after_pairing_is_rejected() {
    let (db, _dir) = fresh_db().await;
    let registry = NodeRegistry::new(db);
    let node = registry.create("agent-1", "10.0.0.5:0", NodeType::Agent).await.unwrap();

    registry.verify_or_pair_fingerprint(node.id, "fp-a").await.unwrap();

    let err = registry
        .verify_or_pair_fingerprint(node.id, "fp-b")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::FingerprintMismatch));
}

#[tokio::test]
async fn a_running_task_past_max_age_is_reaped_as_timed_out() {
    let (db, _dir) = fresh_db().await;
    let registry = NodeRegistry::new(db.clone());
    let node = registry.create("agent-1", "10.0.0.5:0", NodeType::Agent).await.unwrap();

    let task_id = "task-stale-1";
    {
        let conn = db.lock().await;
        let payload = sync_primary::tasks::default_task_payload("proj", "/tmp/x");
        task::insert_pending(&conn, task_id, "proj", node.id, &payload).unwrap();
    }

    {
        let mut conn = db.lock().await;
        task::pull_next(&mut conn, node.id).unwrap();
    }

    // Back-date the row past the reaper's cutoff; a crashed agent would
    // leave it running with no further report ever arriving.
    {
        let conn = db.lock().await;
        conn.execute(
            "UPDATE tasks SET updated_at = '2000-01-01 00:00:00' WHERE id = ?1",
            params![task_id],
        )
        .unwrap();
    }

    let store = TaskStore::new(db.clone());
    let reaped = store.fail_stale_running_tasks(Duration::from_secs(60)).await.unwrap();
    assert_eq!(reaped, 1);

    let conn = db.lock().await;
    let (status, error_code): (String, Option<String>) = conn
        .query_row(
            "SELECT status, error_code FROM tasks WHERE id = ?1",
            params![task_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(status, "failed");
    assert_eq!(error_code.as_deref(), Some("TIMEOUT"));
}

#[tokio::test]
async fn a_task_still_pending_is_left_alone_by_the_reaper() {
    let (db, _dir) = fresh_db().await;
    let registry = NodeRegistry::new(db.clone());
    let node = registry.create("agent-1", "10.0.0.5:0", NodeType::Agent).await.unwrap();

    let task_id = "task-pending-1";
    {
        let conn = db.lock().await;
        task::insert_pending(&conn, task_id, "proj", node.id, &sync_primary::tasks::default_task_payload("proj", "/tmp/x")).unwrap();
    }

    let store = TaskStore::new(db.clone());
    let reaped = store.fail_stale_running_tasks(Duration::from_secs(60)).await.unwrap();
    assert_eq!(reaped, 0);

    let conn = db.lock().await;
    let status: String = conn
        .query_row("SELECT status FROM tasks WHERE id = ?1", params![task_id], |r| r.get(0))
        .unwrap();
    assert_eq!(status, "pending");
}
