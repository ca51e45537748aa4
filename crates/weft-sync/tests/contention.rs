use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use weft_config::InMemoryConfigMaps;
use weft_sync::{ChannelReleaseNotifier, InMemorySemaphoreStore, SemaphoreStore, SyncError, SyncManager};
use weft_workflow::{MutexRef, SemaphoreRef, Synchronization, SynchronizationStatus, Workflow, WorkflowSpec};

const LOCK: &str = "ns/ConfigMap/limits/workflow";

fn t(secs: i64) -> DateTime<Utc> {
  DateTime::UNIX_EPOCH + Duration::seconds(secs)
}

fn semaphore_sync() -> Synchronization {
  Synchronization {
    semaphore: Some(SemaphoreRef::config_map("limits", "workflow")),
    ..Default::default()
  }
}

fn mutex_sync(name: &str) -> Synchronization {
  Synchronization {
    mutex: Some(MutexRef::named(name)),
    ..Default::default()
  }
}

fn workflow(name: &str, priority: i32, created: DateTime<Utc>) -> Workflow {
  let mut wf = Workflow::new(
    "ns",
    name,
    WorkflowSpec {
      priority: Some(priority),
      synchronization: Some(semaphore_sync()),
      ..Default::default()
    },
  );
  wf.metadata.creation_timestamp = Some(created);
  wf
}

fn setup(limit: &str) -> (SyncManager, Arc<InMemoryConfigMaps>, mpsc::UnboundedReceiver<String>) {
  let maps = Arc::new(InMemoryConfigMaps::new());
  maps.set("ns", "limits", "workflow", limit);
  let (tx, rx) = mpsc::unbounded_channel();
  let manager = SyncManager::new(maps.clone(), Arc::new(ChannelReleaseNotifier::new(tx)));
  (manager, maps, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
  let mut out = Vec::new();
  while let Ok(key) = rx.try_recv() {
    out.push(key);
  }
  out
}

#[tokio::test]
async fn test_priority_wins_after_release() {
  let (manager, _maps, mut rx) = setup("1");
  let sync = semaphore_sync();
  let mut w0 = workflow("w0", 0, t(0));
  let mut w1 = workflow("w1", 0, t(10));
  let mut w2 = workflow("w2", 5, t(11));

  assert!(manager.try_acquire(&mut w0, None, &sync).await.unwrap().acquired);

  let waiting = manager.try_acquire(&mut w1, None, &sync).await.unwrap();
  assert!(!waiting.acquired);
  assert_eq!(waiting.message, format!("Waiting for lock {LOCK}: 0/1 available"));
  assert_eq!(
    w1.status.synchronization.as_ref().unwrap().waiting[LOCK],
    vec!["ns/w0".to_string()]
  );
  assert!(!manager.try_acquire(&mut w2, None, &sync).await.unwrap().acquired);
  assert_eq!(manager.queue(LOCK), vec!["ns/w2", "ns/w1"]);
  assert!(drain(&mut rx).is_empty());

  assert!(manager.release(&mut w0, None, &sync).await.unwrap());
  assert_eq!(drain(&mut rx), vec!["ns/w2".to_string()]);

  // w1 is not at the head, so it keeps waiting and the head is woken again.
  assert!(!manager.try_acquire(&mut w1, None, &sync).await.unwrap().acquired);
  assert_eq!(drain(&mut rx), vec!["ns/w2".to_string()]);

  let outcome = manager.try_acquire(&mut w2, None, &sync).await.unwrap();
  assert!(outcome.acquired);
  assert!(outcome.status_updated);
  assert_eq!(manager.holders(LOCK), vec!["ns/w2".to_string()]);
  assert_eq!(
    w2.status.synchronization.as_ref().unwrap().holding[LOCK],
    vec!["ns/w2".to_string()]
  );

  manager.release(&mut w2, None, &sync).await.unwrap();
  assert_eq!(drain(&mut rx), vec!["ns/w1".to_string()]);
  assert!(manager.try_acquire(&mut w1, None, &sync).await.unwrap().acquired);
  assert!(w1.status.synchronization.as_ref().unwrap().waiting.is_empty());
}

#[tokio::test]
async fn test_limit_growth_wakes_waiters() {
  let (manager, maps, mut rx) = setup("1");
  let sync = semaphore_sync();
  let mut w0 = workflow("w0", 0, t(0));
  let mut w1 = workflow("w1", 0, t(1));
  let mut w2 = workflow("w2", 0, t(2));

  assert!(manager.try_acquire(&mut w0, None, &sync).await.unwrap().acquired);
  assert!(!manager.try_acquire(&mut w1, None, &sync).await.unwrap().acquired);
  assert!(!manager.try_acquire(&mut w2, None, &sync).await.unwrap().acquired);

  maps.set("ns", "limits", "workflow", "3");
  assert!(manager.try_acquire(&mut w1, None, &sync).await.unwrap().acquired);
  let woken = drain(&mut rx);
  assert!(woken.contains(&"ns/w2".to_string()));
  assert!(manager.try_acquire(&mut w2, None, &sync).await.unwrap().acquired);
  assert_eq!(manager.holders(LOCK).len(), 3);
}

#[tokio::test]
async fn test_invalid_limit_is_error() {
  let (manager, _maps, _rx) = setup("lots");
  let mut wf = workflow("w0", 0, t(0));
  let err = manager
    .try_acquire(&mut wf, None, &semaphore_sync())
    .await
    .unwrap_err();
  assert!(matches!(err, SyncError::InvalidLimit { .. }));
}

#[tokio::test]
async fn test_missing_config_map_is_error() {
  let (manager, maps, _rx) = setup("1");
  maps.remove("ns", "limits");
  let mut wf = workflow("w0", 0, t(0));
  let err = manager
    .try_acquire(&mut wf, None, &semaphore_sync())
    .await
    .unwrap_err();
  assert!(matches!(err, SyncError::LimitLookup { .. }));
}

#[tokio::test]
async fn test_multiple_locks_all_or_nothing() {
  let (manager, _maps, _rx) = setup("5");
  let both = Synchronization {
    mutexes: vec![MutexRef::named("a"), MutexRef::named("b")],
    ..Default::default()
  };
  let mut holder_of_b = workflow("holder", 0, t(0));
  let mut wf = workflow("both", 0, t(1));

  assert!(
    manager
      .try_acquire(&mut holder_of_b, None, &mutex_sync("b"))
      .await
      .unwrap()
      .acquired
  );
  let outcome = manager.try_acquire(&mut wf, None, &both).await.unwrap();
  assert!(!outcome.acquired);
  assert_eq!(outcome.blocking_lock.as_deref(), Some("ns/Mutex/b"));
  assert!(manager.holders("ns/Mutex/a").is_empty());

  manager.release(&mut holder_of_b, None, &mutex_sync("b")).await.unwrap();
  assert!(manager.try_acquire(&mut wf, None, &both).await.unwrap().acquired);
  assert_eq!(manager.holders("ns/Mutex/a"), vec!["ns/both".to_string()]);
  assert_eq!(manager.holders("ns/Mutex/b"), vec!["ns/both".to_string()]);
}

#[tokio::test]
async fn test_node_level_holders() {
  let (manager, _maps, _rx) = setup("2");
  let sync = semaphore_sync();
  let mut wf = workflow("w0", 0, t(0));

  assert!(manager.try_acquire(&mut wf, Some("w0-1"), &sync).await.unwrap().acquired);
  assert!(manager.try_acquire(&mut wf, Some("w0-2"), &sync).await.unwrap().acquired);
  assert!(!manager.try_acquire(&mut wf, Some("w0-3"), &sync).await.unwrap().acquired);
  assert_eq!(
    manager.holders(LOCK),
    vec!["ns/w0/w0-1".to_string(), "ns/w0/w0-2".to_string()]
  );

  assert!(manager.release_all(&mut wf));
  assert!(manager.holders(LOCK).is_empty());
  assert!(manager.queue(LOCK).is_empty());
  assert!(wf.status.synchronization.is_none());
}

#[tokio::test]
async fn test_initialize_upgrades_legacy_holders() {
  let (manager, _maps, _rx) = setup("2");
  let mut wf = workflow("w0", 0, t(0));
  let mut status = SynchronizationStatus::default();
  status.holding.insert(LOCK.to_string(), vec!["w0".to_string()]);
  status
    .holding
    .insert("ns/Mutex/step".to_string(), vec!["w0-1234".to_string()]);
  wf.status.synchronization = Some(status);

  let mut workflows = vec![wf];
  manager.initialize(&mut workflows).await;

  assert_eq!(manager.holders(LOCK), vec!["ns/w0".to_string()]);
  assert_eq!(manager.holders("ns/Mutex/step"), vec!["ns/w0/w0-1234".to_string()]);
  let holding = &workflows[0].status.synchronization.as_ref().unwrap().holding;
  assert_eq!(holding["ns/Mutex/step"], vec!["ns/w0/w0-1234".to_string()]);
}

#[tokio::test]
async fn test_deleted_workflows_are_evicted() {
  let (manager, _maps, mut rx) = setup("1");
  let sync = semaphore_sync();
  let mut gone = workflow("gone", 0, t(0));
  let mut live = workflow("live", 0, t(1));

  assert!(manager.try_acquire(&mut gone, None, &sync).await.unwrap().acquired);
  assert!(!manager.try_acquire(&mut live, None, &sync).await.unwrap().acquired);

  manager.check_workflow_existence(|key| key != "ns/gone");
  assert!(manager.holders(LOCK).is_empty());
  assert_eq!(drain(&mut rx), vec!["ns/live".to_string()]);
  assert!(manager.try_acquire(&mut live, None, &sync).await.unwrap().acquired);
}

const GPU: &str = "ns/Database/gpu";
const GPU_ROW: &str = "sem/ns/gpu";

fn database_sync() -> Synchronization {
  Synchronization {
    semaphore: Some(SemaphoreRef::database("gpu")),
    ..Default::default()
  }
}

fn with_store(store: &InMemorySemaphoreStore) -> (SyncManager, mpsc::UnboundedReceiver<String>) {
  let maps = Arc::new(InMemoryConfigMaps::new());
  let (tx, rx) = mpsc::unbounded_channel();
  let manager =
    SyncManager::new(maps, Arc::new(ChannelReleaseNotifier::new(tx))).with_store(Arc::new(store.clone()));
  (manager, rx)
}

#[tokio::test]
async fn test_database_semaphore_is_shared_between_controllers() {
  let store_a = InMemorySemaphoreStore::new("a");
  let store_b = store_a.for_controller("b");
  store_a.set_limit("ns/gpu", 1);
  let (a, mut rx_a) = with_store(&store_a);
  let (b, mut rx_b) = with_store(&store_b);
  a.heartbeat().await.unwrap();
  b.heartbeat().await.unwrap();

  let sync = database_sync();
  let mut first = workflow("first", 0, t(0));
  let mut second = workflow("second", 0, t(1));
  assert!(a.try_acquire(&mut first, None, &sync).await.unwrap().acquired);

  let waiting = b.try_acquire(&mut second, None, &sync).await.unwrap();
  assert!(!waiting.acquired);
  assert_eq!(waiting.blocking_lock.as_deref(), Some(GPU));
  assert_eq!(waiting.message, format!("Waiting for lock {GPU}: 0/1 available"));
  assert_eq!(
    second.status.synchronization.as_ref().unwrap().waiting[GPU],
    vec!["ns/first".to_string()]
  );

  assert!(a.release(&mut first, None, &sync).await.unwrap());
  // The waiter belongs to the other controller.
  assert!(drain(&mut rx_a).is_empty());
  b.poll(|_| true).await.unwrap();
  assert_eq!(drain(&mut rx_b), vec!["ns/second".to_string()]);

  assert!(b.try_acquire(&mut second, None, &sync).await.unwrap().acquired);
  let state = store_a.state(GPU_ROW).await.unwrap();
  assert_eq!(state.holders, vec!["ns/second".to_string()]);
  assert!(state.queue.is_empty());
}

#[tokio::test]
async fn test_mixed_locks_are_all_or_nothing() {
  let store = InMemorySemaphoreStore::new("a");
  store.set_limit("ns/gpu", 1);
  let (manager, _rx) = with_store(&store);
  let both = Synchronization {
    semaphore: Some(SemaphoreRef::database("gpu")),
    mutex: Some(MutexRef::named("deploy")),
    ..Default::default()
  };
  let mut holder = workflow("holder", 0, t(0));
  let mut wf = workflow("both", 0, t(1));

  assert!(manager.try_acquire(&mut holder, None, &database_sync()).await.unwrap().acquired);
  let outcome = manager.try_acquire(&mut wf, None, &both).await.unwrap();
  assert!(!outcome.acquired);
  assert_eq!(outcome.blocking_lock.as_deref(), Some(GPU));
  assert!(manager.holders("ns/Mutex/deploy").is_empty());

  manager.release(&mut holder, None, &database_sync()).await.unwrap();
  assert!(manager.try_acquire(&mut wf, None, &both).await.unwrap().acquired);
  assert_eq!(manager.holders("ns/Mutex/deploy"), vec!["ns/both".to_string()]);
  assert_eq!(store.state(GPU_ROW).await.unwrap().holders, vec!["ns/both".to_string()]);
}

#[tokio::test]
async fn test_busy_local_lock_gives_database_lock_back() {
  let store = InMemorySemaphoreStore::new("a");
  store.set_limit("ns/gpu", 1);
  let (manager, _rx) = with_store(&store);
  let both = Synchronization {
    semaphore: Some(SemaphoreRef::database("gpu")),
    mutex: Some(MutexRef::named("deploy")),
    ..Default::default()
  };
  let mut holder = workflow("holder", 0, t(0));
  let mut wf = workflow("both", 0, t(1));

  assert!(manager.try_acquire(&mut holder, None, &mutex_sync("deploy")).await.unwrap().acquired);
  let outcome = manager.try_acquire(&mut wf, None, &both).await.unwrap();
  assert!(!outcome.acquired);
  assert_eq!(outcome.blocking_lock.as_deref(), Some("ns/Mutex/deploy"));
  let state = store.state(GPU_ROW).await.unwrap();
  assert!(state.holders.is_empty());
  assert_eq!(state.queue_head().map(|q| q.holder.as_str()), Some("ns/both"));
}

#[tokio::test]
async fn test_completed_workflow_rows_are_flushed() {
  let store = InMemorySemaphoreStore::new("a");
  store.set_limit("ns/gpu", 1);
  let (manager, mut rx) = with_store(&store);
  let sync = database_sync();
  let mut done = workflow("done", 0, t(0));
  let mut next = workflow("next", 0, t(1));

  assert!(manager.try_acquire(&mut done, None, &sync).await.unwrap().acquired);
  assert!(!manager.try_acquire(&mut next, None, &sync).await.unwrap().acquired);

  assert!(manager.release_all(&mut done));
  assert_eq!(store.state(GPU_ROW).await.unwrap().holders, vec!["ns/done".to_string()]);
  manager.flush_releases().await.unwrap();
  assert!(store.state(GPU_ROW).await.unwrap().holders.is_empty());
  assert_eq!(drain(&mut rx), vec!["ns/next".to_string()]);
  assert!(manager.try_acquire(&mut next, None, &sync).await.unwrap().acquired);
}

#[tokio::test]
async fn test_poll_evicts_rows_of_deleted_workflows() {
  let store = InMemorySemaphoreStore::new("a");
  store.set_limit("ns/gpu", 1);
  let (manager, mut rx) = with_store(&store);
  let sync = database_sync();
  let mut gone = workflow("gone", 0, t(0));
  let mut live = workflow("live", 0, t(1));

  assert!(manager.try_acquire(&mut gone, None, &sync).await.unwrap().acquired);
  assert!(!manager.try_acquire(&mut live, None, &sync).await.unwrap().acquired);

  manager.poll(|key| key != "ns/gone").await.unwrap();
  assert!(store.state(GPU_ROW).await.unwrap().holders.is_empty());
  assert_eq!(drain(&mut rx), vec!["ns/live".to_string()]);
}

#[tokio::test]
async fn test_database_lock_needs_a_store() {
  let (manager, _maps, _rx) = setup("1");
  let mut wf = workflow("w0", 0, t(0));
  let err = manager.try_acquire(&mut wf, None, &database_sync()).await.unwrap_err();
  assert!(matches!(err, SyncError::NoStore(_)));
}
