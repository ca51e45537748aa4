use std::time::Duration;

use chrono::{DateTime, Utc};
use weft_persist::{Session, SqlSemaphoreStore, SyncMigrate, SyncStoreOptions, SyncTables};
use weft_sync::{SemaphoreStore, SyncError};

const GPU: &str = "sem/argo/gpu";

fn t(secs: i64) -> DateTime<Utc> {
  DateTime::UNIX_EPOCH + chrono::Duration::seconds(secs)
}

async fn session() -> Session {
  let session = Session::connect("sqlite::memory:", None).await.unwrap();
  let tables = SyncTables::default();
  SyncMigrate::new(&session, &tables).exec().await.unwrap();
  session
}

fn store(session: &Session, controller: &str) -> SqlSemaphoreStore {
  SqlSemaphoreStore::new(session.clone(), SyncTables::default(), controller, SyncStoreOptions::default())
}

#[tokio::test]
async fn test_migration_is_idempotent() {
  let session = Session::connect("sqlite::memory:", None).await.unwrap();
  let tables = SyncTables::default();
  let migrate = SyncMigrate::new(&session, &tables);
  assert!(migrate.exec().await.unwrap() > 0);
  assert_eq!(migrate.exec().await.unwrap(), 0);
}

#[tokio::test]
async fn test_limits_are_read_and_updated() {
  let session = session().await;
  let store = store(&session, "a");

  let missing = store.limit(GPU).await.unwrap_err();
  assert!(matches!(missing, SyncError::Store { transient: false, .. }));

  store.set_limit("argo/gpu", 2).await.unwrap();
  assert_eq!(store.limit(GPU).await.unwrap(), 2);
  store.set_limit("argo/gpu", 3).await.unwrap();
  assert_eq!(store.limit(GPU).await.unwrap(), 3);
  assert_eq!(store.limit("mtx/argo/deploy").await.unwrap(), 1);

  assert!(store.delete_limit("argo/gpu").await.unwrap());
  assert!(store.limit(GPU).await.is_err());
}

#[tokio::test]
async fn test_cached_limit_outlives_the_row() {
  let session = session().await;
  let store = SqlSemaphoreStore::new(
    session.clone(),
    SyncTables::default(),
    "a",
    SyncStoreOptions {
      limit_cache_ttl: Duration::from_secs(60),
      ..Default::default()
    },
  );
  store.set_limit("argo/gpu", 2).await.unwrap();
  assert_eq!(store.limit(GPU).await.unwrap(), 2);

  // Changed behind the store's back.
  let other = self::store(&session, "b");
  other.set_limit("argo/gpu", 5).await.unwrap();
  assert_eq!(store.limit(GPU).await.unwrap(), 2);
}

#[tokio::test]
async fn test_queue_order_and_limit() {
  let session = session().await;
  let store = store(&session, "a");
  store.set_limit("argo/gpu", 1).await.unwrap();

  store.enqueue(GPU, "argo/old", 0, t(0)).await.unwrap();
  store.enqueue(GPU, "argo/urgent", 5, t(10)).await.unwrap();
  store.enqueue(GPU, "argo/urgent", 5, t(10)).await.unwrap();

  let state = store.state(GPU).await.unwrap();
  let queued: Vec<&str> = state.queue.iter().map(|q| q.holder.as_str()).collect();
  assert_eq!(queued, vec!["argo/urgent", "argo/old"]);

  assert!(!store.try_hold(GPU, "argo/old", 1).await.unwrap());
  assert!(store.try_hold(GPU, "argo/urgent", 1).await.unwrap());
  assert!(store.try_hold(GPU, "argo/urgent", 1).await.unwrap());
  assert!(!store.try_hold(GPU, "argo/old", 1).await.unwrap());

  assert!(store.release(GPU, "argo/urgent").await.unwrap());
  assert!(!store.release(GPU, "argo/urgent").await.unwrap());
  assert!(store.try_hold(GPU, "argo/old", 1).await.unwrap());
  assert_eq!(store.state(GPU).await.unwrap().holders, vec!["argo/old".to_string()]);
}

#[tokio::test]
async fn test_silent_controllers_do_not_block_the_queue() {
  let session = session().await;
  let a = store(&session, "a");
  let b = store(&session, "b");
  a.set_limit("argo/gpu", 1).await.unwrap();

  // b never heartbeats, so its older waiter is skipped.
  b.enqueue(GPU, "argo/stale", 0, t(0)).await.unwrap();
  a.enqueue(GPU, "argo/fresh", 0, t(5)).await.unwrap();
  assert!(a.try_hold(GPU, "argo/fresh", 1).await.unwrap());
  a.release(GPU, "argo/fresh").await.unwrap();

  b.heartbeat().await.unwrap();
  a.enqueue(GPU, "argo/fresh", 0, t(5)).await.unwrap();
  assert!(!a.try_hold(GPU, "argo/fresh", 1).await.unwrap());
  let head = a.state(GPU).await.unwrap().queue.first().cloned().unwrap();
  assert_eq!((head.holder.as_str(), head.controller.as_str()), ("argo/stale", "b"));
}

#[tokio::test]
async fn test_release_workflow_drops_node_rows_literally() {
  let session = session().await;
  let store = store(&session, "a");
  store.set_limit("argo/gpu", 3).await.unwrap();
  for holder in ["argo/wf_1", "argo/wf_1/node-a", "argo/wfx1/node-b"] {
    store.enqueue(GPU, holder, 0, t(0)).await.unwrap();
  }
  store.enqueue("mtx/argo/deploy", "argo/wf_1/node-c", 0, t(0)).await.unwrap();

  let changed = store.release_workflow("argo/wf_1").await.unwrap();
  assert_eq!(changed, vec!["mtx/argo/deploy".to_string(), GPU.to_string()]);
  let left = store.entries().await.unwrap();
  assert_eq!(left, vec![(GPU.to_string(), "argo/wfx1/node-b".to_string())]);
}

#[tokio::test]
async fn test_rows_belong_to_their_controller() {
  let session = session().await;
  let a = store(&session, "a");
  let b = store(&session, "b");
  a.enqueue(GPU, "argo/mine", 0, t(0)).await.unwrap();
  b.enqueue(GPU, "argo/theirs", 0, t(1)).await.unwrap();

  assert_eq!(a.entries().await.unwrap(), vec![(GPU.to_string(), "argo/mine".to_string())]);
  assert!(!a.release(GPU, "argo/theirs").await.unwrap());
  assert!(a.release_workflow("argo/theirs").await.unwrap().is_empty());
}
