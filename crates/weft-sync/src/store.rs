//! Locks shared between controllers through a database.
//!
//! Each controller keeps its own waiters and holders as rows tagged with
//! its name and proves it is alive with a heartbeat. Queue order only
//! counts waiters of live controllers, so a dead controller cannot block
//! the others forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::SyncError;
use crate::lock_key::{MUTEX_PREFIX, SEMAPHORE_PREFIX, workflow_key};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_INACTIVE_CONTROLLER_TIMEOUT: Duration = Duration::from_secs(300);

/// A waiter and the controller that queued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedHolder {
  pub holder: String,
  pub controller: String,
}

/// Holders and live waiters of one lock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreLockState {
  /// Sorted.
  pub holders: Vec<String>,
  /// Higher priority first, then older.
  pub queue: Vec<QueuedHolder>,
}

impl StoreLockState {
  pub fn queue_head(&self) -> Option<&QueuedHolder> {
    self.queue.first()
  }
}

/// The limit row name for a lock row name: `sem/ns/key` is limited by
/// `ns/key`. `None` for mutexes.
pub fn limit_name(lock: &str) -> Option<&str> {
  if lock.starts_with(MUTEX_PREFIX) {
    return None;
  }
  Some(lock.strip_prefix(SEMAPHORE_PREFIX).unwrap_or(lock))
}

/// Storage behind `database` semaphores and mutexes. Lock names are the
/// row names from [`crate::LockKey::store_name`]; holders are holder keys.
#[async_trait]
pub trait SemaphoreStore: Send + Sync {
  /// Name this controller's rows are tagged with.
  fn controller_name(&self) -> &str;

  fn poll_interval(&self) -> Duration {
    DEFAULT_POLL_INTERVAL
  }

  fn heartbeat_interval(&self) -> Duration {
    DEFAULT_HEARTBEAT_INTERVAL
  }

  /// Current limit. Always one for a mutex.
  async fn limit(&self, lock: &str) -> Result<usize, SyncError>;

  async fn state(&self, lock: &str) -> Result<StoreLockState, SyncError>;

  /// Queue `holder`. A holder already queued or holding is left alone.
  async fn enqueue(&self, lock: &str, holder: &str, priority: i32, created: DateTime<Utc>) -> Result<(), SyncError>;

  /// Atomically move `holder` from the queue to the holders, if it heads
  /// the queue and fewer than `limit` hold the lock. Holding already counts.
  async fn try_hold(&self, lock: &str, holder: &str, limit: usize) -> Result<bool, SyncError>;

  /// Drop `holder`, held or queued. Returns whether a row went away.
  async fn release(&self, lock: &str, holder: &str) -> Result<bool, SyncError>;

  /// Drop every row of this controller for the workflow and its nodes.
  /// Returns the locks that changed.
  async fn release_workflow(&self, workflow_key: &str) -> Result<Vec<String>, SyncError>;

  /// `(lock, holder)` of every row this controller owns.
  async fn entries(&self) -> Result<Vec<(String, String)>, SyncError>;

  /// Record that this controller is alive.
  async fn heartbeat(&self) -> Result<(), SyncError>;
}

#[derive(Debug, Clone)]
struct Row {
  lock: String,
  holder: String,
  controller: String,
  held: bool,
  priority: i32,
  created: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Shared {
  limits: HashMap<String, usize>,
  rows: Vec<Row>,
  heartbeats: HashMap<String, DateTime<Utc>>,
}

/// A [`SemaphoreStore`] in process memory. Handles made with
/// [`InMemorySemaphoreStore::for_controller`] share rows, so several
/// controllers can be exercised against one store.
#[derive(Clone)]
pub struct InMemorySemaphoreStore {
  shared: Arc<Mutex<Shared>>,
  controller: String,
  inactive_after: Duration,
}

impl InMemorySemaphoreStore {
  pub fn new(controller: impl Into<String>) -> Self {
    Self {
      shared: Arc::new(Mutex::new(Shared::default())),
      controller: controller.into(),
      inactive_after: DEFAULT_INACTIVE_CONTROLLER_TIMEOUT,
    }
  }

  /// Another controller's handle onto the same rows.
  pub fn for_controller(&self, controller: impl Into<String>) -> Self {
    Self {
      shared: self.shared.clone(),
      controller: controller.into(),
      inactive_after: self.inactive_after,
    }
  }

  pub fn with_inactive_timeout(mut self, timeout: Duration) -> Self {
    self.inactive_after = timeout;
    self
  }

  /// Set the limit row `ns/key`.
  pub fn set_limit(&self, name: &str, limit: usize) {
    self.shared.lock().limits.insert(name.to_string(), limit);
  }

  /// Backdate a controller's heartbeat.
  pub fn set_heartbeat(&self, controller: &str, at: DateTime<Utc>) {
    self.shared.lock().heartbeats.insert(controller.to_string(), at);
  }

  fn live(&self, shared: &Shared, controller: &str) -> bool {
    if controller == self.controller {
      return true;
    }
    let cutoff = chrono::Duration::from_std(self.inactive_after)
      .ok()
      .and_then(|d| Utc::now().checked_sub_signed(d));
    match (shared.heartbeats.get(controller), cutoff) {
      (Some(at), Some(cutoff)) => *at > cutoff,
      (Some(_), None) => true,
      (None, _) => false,
    }
  }

  fn state_of(&self, shared: &Shared, lock: &str) -> StoreLockState {
    let mut holders: Vec<String> = shared
      .rows
      .iter()
      .filter(|r| r.lock == lock && r.held)
      .map(|r| r.holder.clone())
      .collect();
    holders.sort();
    let mut waiting: Vec<&Row> = shared
      .rows
      .iter()
      .filter(|r| r.lock == lock && !r.held && self.live(shared, &r.controller))
      .collect();
    waiting.sort_by(|a, b| {
      b.priority
        .cmp(&a.priority)
        .then(a.created.cmp(&b.created))
        .then(a.holder.cmp(&b.holder))
    });
    StoreLockState {
      holders,
      queue: waiting
        .into_iter()
        .map(|r| QueuedHolder {
          holder: r.holder.clone(),
          controller: r.controller.clone(),
        })
        .collect(),
    }
  }
}

#[async_trait]
impl SemaphoreStore for InMemorySemaphoreStore {
  fn controller_name(&self) -> &str {
    &self.controller
  }

  async fn limit(&self, lock: &str) -> Result<usize, SyncError> {
    let Some(name) = limit_name(lock) else {
      return Ok(1);
    };
    self
      .shared
      .lock()
      .limits
      .get(name)
      .copied()
      .ok_or_else(|| SyncError::store("read_limit", format!("no limit row for '{name}'"), false))
  }

  async fn state(&self, lock: &str) -> Result<StoreLockState, SyncError> {
    let shared = self.shared.lock();
    Ok(self.state_of(&shared, lock))
  }

  async fn enqueue(&self, lock: &str, holder: &str, priority: i32, created: DateTime<Utc>) -> Result<(), SyncError> {
    let mut shared = self.shared.lock();
    if shared.rows.iter().any(|r| r.lock == lock && r.holder == holder) {
      return Ok(());
    }
    shared.rows.push(Row {
      lock: lock.to_string(),
      holder: holder.to_string(),
      controller: self.controller.clone(),
      held: false,
      priority,
      created,
    });
    Ok(())
  }

  async fn try_hold(&self, lock: &str, holder: &str, limit: usize) -> Result<bool, SyncError> {
    let mut shared = self.shared.lock();
    let state = self.state_of(&shared, lock);
    if state.holders.iter().any(|h| h == holder) {
      return Ok(true);
    }
    let heads = state.queue_head().is_some_and(|head| head.holder == holder);
    if !heads || state.holders.len() >= limit {
      return Ok(false);
    }
    if let Some(row) = shared.rows.iter_mut().find(|r| r.lock == lock && r.holder == holder) {
      row.held = true;
    }
    Ok(true)
  }

  async fn release(&self, lock: &str, holder: &str) -> Result<bool, SyncError> {
    let mut shared = self.shared.lock();
    let before = shared.rows.len();
    shared.rows.retain(|r| !(r.lock == lock && r.holder == holder));
    Ok(shared.rows.len() != before)
  }

  async fn release_workflow(&self, wf_key: &str) -> Result<Vec<String>, SyncError> {
    let mut shared = self.shared.lock();
    let mut changed = Vec::new();
    shared.rows.retain(|r| {
      let matches = r.controller == self.controller && workflow_key(&r.holder) == wf_key;
      if matches && !changed.contains(&r.lock) {
        changed.push(r.lock.clone());
      }
      !matches
    });
    Ok(changed)
  }

  async fn entries(&self) -> Result<Vec<(String, String)>, SyncError> {
    Ok(
      self
        .shared
        .lock()
        .rows
        .iter()
        .filter(|r| r.controller == self.controller)
        .map(|r| (r.lock.clone(), r.holder.clone()))
        .collect(),
    )
  }

  async fn heartbeat(&self) -> Result<(), SyncError> {
    self.shared.lock().heartbeats.insert(self.controller.clone(), Utc::now());
    Ok(())
  }
}
