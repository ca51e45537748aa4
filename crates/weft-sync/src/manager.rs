use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use weft_config::ConfigMapStore;
use weft_workflow::{Synchronization, Workflow};

use crate::error::SyncError;
use crate::lock_key::{LockKey, LockKind, holder_key, workflow_key};
use crate::notifier::ReleaseNotifier;
use crate::semaphore::Semaphore;
use crate::store::SemaphoreStore;

/// Result of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOutcome {
  pub acquired: bool,
  /// The workflow's synchronization status changed and should be persisted.
  pub status_updated: bool,
  /// Waiting message when not acquired.
  pub message: String,
  /// The first lock that blocked the attempt.
  pub blocking_lock: Option<String>,
}

impl AcquireOutcome {
  fn acquired(status_updated: bool) -> Self {
    Self {
      acquired: true,
      status_updated,
      message: String::new(),
      blocking_lock: None,
    }
  }
}

/// A lock that blocked an acquire attempt.
struct Blocked {
  lock: String,
  holders: Vec<String>,
  available: usize,
  limit: usize,
}

/// A workflow asking for locks.
struct Requester {
  holder: String,
  priority: i32,
  created: DateTime<Utc>,
}

/// Coordinates semaphores and mutexes across workflows.
///
/// One mutex guards the whole lock table. Limits are read from config maps
/// before it is taken, so no await happens while it is held. `database`
/// locks live in an optional [`SemaphoreStore`] shared with other
/// controllers.
pub struct SyncManager {
  locks: Mutex<HashMap<String, Semaphore>>,
  config_maps: Arc<dyn ConfigMapStore>,
  notifier: Arc<dyn ReleaseNotifier>,
  store: Option<Arc<dyn SemaphoreStore>>,
  // Workflows whose store rows still have to be dropped.
  pending_releases: Mutex<Vec<String>>,
}

fn lock_keys(namespace: &str, sync: &Synchronization) -> Result<Vec<LockKey>, SyncError> {
  let mut keys = sync
    .all_semaphores()?
    .into_iter()
    .map(|s| LockKey::semaphore(namespace, s))
    .collect::<Result<Vec<_>, _>>()?;
  keys.extend(
    sync
      .all_mutexes()?
      .into_iter()
      .map(|m| LockKey::mutex(namespace, m)),
  );
  Ok(keys)
}

fn waiting_message(blocked: &Blocked) -> String {
  format!(
    "Waiting for lock {}: {}/{} available",
    blocked.lock, blocked.available, blocked.limit
  )
}

impl SyncManager {
  pub fn new(config_maps: Arc<dyn ConfigMapStore>, notifier: Arc<dyn ReleaseNotifier>) -> Self {
    Self {
      locks: Mutex::new(HashMap::new()),
      config_maps,
      notifier,
      store: None,
      pending_releases: Mutex::new(Vec::new()),
    }
  }

  /// Keep `database` locks in `store`.
  pub fn with_store(mut self, store: Arc<dyn SemaphoreStore>) -> Self {
    self.store = Some(store);
    self
  }

  pub fn store(&self) -> Option<&Arc<dyn SemaphoreStore>> {
    self.store.as_ref()
  }

  fn store_for(&self, key: &LockKey) -> Result<(&Arc<dyn SemaphoreStore>, String), SyncError> {
    match (self.store.as_ref(), key.store_name()) {
      (Some(store), Some(name)) => Ok((store, name)),
      _ => Err(SyncError::NoStore(key.to_string())),
    }
  }

  async fn limit(&self, key: &LockKey) -> Result<usize, SyncError> {
    let (config_map, entry) = match &key.kind {
      LockKind::Mutex { .. } => return Ok(1),
      LockKind::Semaphore { config_map, key } => (config_map, key),
      LockKind::Database { .. } | LockKind::DatabaseMutex { .. } => {
        let (store, name) = self.store_for(key)?;
        return store.limit(&name).await;
      }
    };
    let value = self
      .config_maps
      .get_value(&key.namespace, config_map, entry)
      .await
      .map_err(|source| SyncError::LimitLookup {
        lock: key.to_string(),
        source,
      })?;
    value.trim().parse::<usize>().map_err(|_| SyncError::InvalidLimit {
      lock: key.to_string(),
      value,
    })
  }

  fn notify_all(&self, workflow_keys: Vec<String>) {
    let mut seen = HashSet::new();
    for key in workflow_keys {
      if seen.insert(key.clone()) {
        debug!(workflow = %key, "lock_release_notify");
        self.notifier.notify(&key);
      }
    }
  }

  /// Try to take every lock in `sync` for the workflow, or for one of its
  /// nodes when `node_id` is set. Either all locks are taken or none.
  ///
  /// Limits are re-read on every call, so a changed config map resizes the
  /// semaphore here. Local locks are checked first; `database` locks are
  /// then held one by one and given back if a later one is busy.
  pub async fn try_acquire(
    &self,
    wf: &mut Workflow,
    node_id: Option<&str>,
    sync: &Synchronization,
  ) -> Result<AcquireOutcome, SyncError> {
    let keys = lock_keys(wf.namespace(), sync)?;
    if keys.is_empty() {
      return Ok(AcquireOutcome::acquired(false));
    }
    let (remote, local): (Vec<LockKey>, Vec<LockKey>) = keys.iter().cloned().partition(LockKey::is_database);
    let mut limits = Vec::with_capacity(local.len());
    for key in &local {
      limits.push(self.limit(key).await?);
    }

    let requester = Requester {
      holder: holder_key(wf.namespace(), wf.name(), node_id),
      priority: wf.priority(),
      created: wf.creation_timestamp(),
    };
    let names: Vec<String> = keys.iter().map(ToString::to_string).collect();
    let local_names: Vec<String> = local.iter().map(ToString::to_string).collect();

    let mut blocked = self.check_local(&local_names, &limits, &requester);
    for key in &remote {
      let (store, name) = self.store_for(key)?;
      store
        .enqueue(&name, &requester.holder, requester.priority, requester.created)
        .await?;
    }
    if blocked.is_empty() {
      blocked = self.hold_remote(&remote, &requester).await?;
      if blocked.is_empty() && !self.take_local(&local_names, &requester.holder) {
        self.give_back(&remote, &requester).await?;
        blocked = self.check_local(&local_names, &limits, &requester);
      }
    }

    let holder = &requester.holder;
    let status = wf.status.synchronization_mut();
    if blocked.is_empty() {
      let mut updated = false;
      for name in &names {
        updated |= status.lock_acquired(holder, name);
      }
      info!(holder = %holder, locks = ?names, "lock_acquired");
      return Ok(AcquireOutcome::acquired(updated));
    }

    let mut updated = false;
    for waiting in &blocked {
      updated |= status.lock_waiting(&waiting.lock, &waiting.holders);
    }
    let first = &blocked[0];
    debug!(holder = %holder, lock = %first.lock, "lock_waiting");
    Ok(AcquireOutcome {
      acquired: false,
      status_updated: updated,
      message: waiting_message(first),
      blocking_lock: Some(first.lock.clone()),
    })
  }

  /// Queue on every local lock and report those that would not admit the
  /// requester right now.
  fn check_local(&self, names: &[String], limits: &[usize], requester: &Requester) -> Vec<Blocked> {
    let holder = requester.holder.as_str();
    let mut to_notify = Vec::new();
    let mut blocked = Vec::new();
    {
      let mut locks = self.locks.lock();
      for (name, limit) in names.iter().zip(limits) {
        let sem = locks
          .entry(name.clone())
          .or_insert_with(|| Semaphore::new(name.clone(), *limit));
        if sem.limit() != *limit {
          info!(lock = %name, from = sem.limit(), to = *limit, "semaphore_resized");
          to_notify.extend(sem.resize(*limit));
        }
        sem.enqueue(holder, requester.priority, requester.created);
      }
      for name in names {
        if let Some(sem) = locks.get(name).filter(|s| !s.can_acquire(holder)) {
          // A free slot the head has not claimed yet: wake the head.
          if sem.queue_head() != Some(holder) {
            to_notify.extend(sem.next_to_notify());
          }
          blocked.push(Blocked {
            lock: name.clone(),
            holders: sem.current_holders(),
            available: sem.available(),
            limit: sem.limit(),
          });
        }
      }
    }
    self.notify_all(to_notify);
    blocked
  }

  /// Take every local lock, or none if one no longer admits `holder`.
  fn take_local(&self, names: &[String], holder: &str) -> bool {
    let mut to_notify = Vec::new();
    {
      let mut locks = self.locks.lock();
      if !names.iter().all(|n| locks.get(n).is_some_and(|s| s.can_acquire(holder))) {
        return false;
      }
      for name in names {
        if let Some(sem) = locks.get_mut(name) {
          sem.acquire(holder);
          to_notify.extend(sem.next_to_notify());
        }
      }
    }
    self.notify_all(to_notify);
    true
  }

  /// Hold every `database` lock in turn. On the first busy one, the locks
  /// taken so far go back to the queue and the busy one is reported.
  async fn hold_remote(&self, keys: &[LockKey], requester: &Requester) -> Result<Vec<Blocked>, SyncError> {
    for (i, key) in keys.iter().enumerate() {
      let (store, name) = self.store_for(key)?;
      let limit = store.limit(&name).await?;
      if store.try_hold(&name, &requester.holder, limit).await? {
        continue;
      }
      let state = store.state(&name).await?;
      self.give_back(&keys[..i], requester).await?;
      return Ok(vec![Blocked {
        lock: key.to_string(),
        available: limit.saturating_sub(state.holders.len()),
        holders: state.holders,
        limit,
      }]);
    }
    Ok(Vec::new())
  }

  /// Return held `database` locks to the queue in their old position.
  async fn give_back(&self, keys: &[LockKey], requester: &Requester) -> Result<(), SyncError> {
    for key in keys {
      let (store, name) = self.store_for(key)?;
      store.release(&name, &requester.holder).await?;
      store
        .enqueue(&name, &requester.holder, requester.priority, requester.created)
        .await?;
    }
    Ok(())
  }

  /// Release the locks in `sync` held by the workflow or node. Returns
  /// whether the workflow's status changed.
  pub async fn release(
    &self,
    wf: &mut Workflow,
    node_id: Option<&str>,
    sync: &Synchronization,
  ) -> Result<bool, SyncError> {
    let keys = lock_keys(wf.namespace(), sync)?;
    let holder = holder_key(wf.namespace(), wf.name(), node_id);
    let names: Vec<String> = keys.iter().map(ToString::to_string).collect();

    let mut to_notify = Vec::new();
    {
      let mut locks = self.locks.lock();
      for name in &names {
        if let Some(sem) = locks.get_mut(name) {
          sem.dequeue(&holder);
          if let Some(next) = sem.release(&holder) {
            to_notify.push(next);
          }
        }
      }
    }
    self.notify_all(to_notify);

    let mut released = Vec::new();
    if let Some(store) = self.store.as_ref() {
      for name in keys.iter().filter_map(LockKey::store_name) {
        if store.release(&name, &holder).await? {
          released.push(name);
        }
      }
    }
    self.notify_store_waiters(&released).await?;

    let mut updated = false;
    if let Some(status) = wf.status.synchronization.as_mut() {
      for name in &names {
        updated |= status.lock_released(&holder, name);
        updated |= status.clear_waiting(name);
      }
    }
    if updated {
      info!(holder = %holder, locks = ?names, "lock_released");
    }
    Ok(updated)
  }

  /// Drop every hold and queue entry of the workflow and its nodes, and clear
  /// the mirrored status. Called on completion and deletion.
  ///
  /// Rows in the lock store are dropped by the next
  /// [`SyncManager::flush_releases`].
  pub fn release_all(&self, wf: &mut Workflow) -> bool {
    let wf_key = wf.key();
    let node_prefix = format!("{wf_key}/");
    let mut to_notify = Vec::new();
    {
      let mut locks = self.locks.lock();
      for sem in locks.values_mut() {
        to_notify.extend(sem.evict(|h| h == wf_key || h.starts_with(&node_prefix)));
      }
    }
    to_notify.retain(|k| *k != wf_key);
    self.notify_all(to_notify);
    if self.store.is_some() {
      let mut pending = self.pending_releases.lock();
      if !pending.contains(&wf_key) {
        pending.push(wf_key.clone());
      }
    }

    let mut updated = wf.status.synchronization.take().is_some_and(|s| !s.is_empty());
    for node in wf.status.nodes.values_mut() {
      updated |= node.synchronization_status.take().is_some();
    }
    if updated {
      info!(workflow = %wf_key, "locks_released_all");
    }
    updated
  }

  /// Drop the lock store rows of workflows released since the last flush.
  /// Workflows whose rows could not be dropped stay pending.
  pub async fn flush_releases(&self) -> Result<(), SyncError> {
    let Some(store) = self.store.as_ref() else {
      return Ok(());
    };
    let pending = std::mem::take(&mut *self.pending_releases.lock());
    let mut changed = Vec::new();
    for (i, wf_key) in pending.iter().enumerate() {
      match store.release_workflow(wf_key).await {
        Ok(locks) => {
          debug!(workflow = %wf_key, locks = ?locks, "store_locks_released");
          changed.extend(locks);
        }
        Err(e) => {
          self.pending_releases.lock().extend(pending[i..].iter().cloned());
          return Err(e);
        }
      }
    }
    changed.sort();
    changed.dedup();
    self.notify_store_waiters(&changed).await
  }

  /// Wake this controller's waiters that now fit under the limit of each
  /// store lock.
  async fn notify_store_waiters(&self, locks: &[String]) -> Result<(), SyncError> {
    let Some(store) = self.store.as_ref() else {
      return Ok(());
    };
    let mut to_notify = Vec::new();
    for lock in locks {
      let limit = store.limit(lock).await?;
      let state = store.state(lock).await?;
      let free = limit.saturating_sub(state.holders.len());
      to_notify.extend(
        state
          .queue
          .iter()
          .take(free)
          .filter(|q| q.controller == store.controller_name())
          .map(|q| workflow_key(&q.holder).to_string()),
      );
    }
    self.notify_all(to_notify);
    Ok(())
  }

  /// One round of lock store upkeep: drop pending releases, drop rows of
  /// workflows that no longer exist, and wake waiters with a free slot.
  pub async fn poll<F>(&self, exists: F) -> Result<(), SyncError>
  where
    F: Fn(&str) -> bool,
  {
    let Some(store) = self.store.as_ref() else {
      return Ok(());
    };
    self.flush_releases().await?;
    let mut locks = Vec::new();
    for (lock, holder) in store.entries().await? {
      if !exists(workflow_key(&holder)) {
        info!(lock = %lock, holder = %holder, "store_lock_holder_evicted");
        store.release(&lock, &holder).await?;
      }
      if !locks.contains(&lock) {
        locks.push(lock);
      }
    }
    self.notify_store_waiters(&locks).await
  }

  /// Record that this controller is alive.
  pub async fn heartbeat(&self) -> Result<(), SyncError> {
    match self.store.as_ref() {
      Some(store) => store.heartbeat().await,
      None => Ok(()),
    }
  }

  /// Rebuild holders from persisted workflow status. Holder names written
  /// before holder keys carried a namespace are upgraded in place.
  pub async fn initialize(&self, workflows: &mut [Workflow]) {
    for wf in workflows.iter_mut() {
      if wf.status.fulfilled() {
        continue;
      }
      let Some(status) = wf.status.synchronization.as_ref() else {
        continue;
      };
      let workflow_level: HashSet<String> = wf
        .spec
        .synchronization
        .as_ref()
        .and_then(|s| lock_keys(wf.namespace(), s).ok())
        .unwrap_or_default()
        .iter()
        .map(ToString::to_string)
        .collect();

      let mut holding = status.holding.clone();
      for (lock, holders) in holding.iter_mut() {
        for holder in holders.iter_mut() {
          *holder = upgraded_holder_key(wf, lock, holder, &workflow_level);
        }
      }

      for (lock, holders) in &holding {
        let limit = match lock.parse::<LockKey>() {
          // The lock store keeps its own holders.
          Ok(key) if key.is_database() => continue,
          Ok(key) => match self.limit(&key).await {
            Ok(limit) => limit,
            Err(e) => {
              warn!(lock = %lock, error = %e, "semaphore_limit_unavailable");
              holders.len()
            }
          },
          Err(e) => {
            warn!(lock = %lock, error = %e, "lock_key_invalid");
            continue;
          }
        };
        let mut locks = self.locks.lock();
        let sem = locks
          .entry(lock.clone())
          .or_insert_with(|| Semaphore::new(lock.clone(), limit));
        for holder in holders {
          sem.restore_holder(holder);
          debug!(lock = %lock, holder = %holder, "lock_holder_restored");
        }
      }
      wf.status.synchronization_mut().holding = holding;
    }
  }

  /// Evict holders and waiters whose workflow no longer exists.
  pub fn check_workflow_existence<F>(&self, exists: F)
  where
    F: Fn(&str) -> bool,
  {
    let mut to_notify = Vec::new();
    {
      let mut locks = self.locks.lock();
      for sem in locks.values_mut() {
        let lock = sem.name().to_string();
        to_notify.extend(sem.evict(|h| {
          let gone = !exists(workflow_key(h));
          if gone {
            info!(lock = %lock, holder = %h, "lock_holder_evicted");
          }
          gone
        }));
      }
    }
    self.notify_all(to_notify);
  }

  /// Sorted holders of a lock.
  pub fn holders(&self, lock_key: &str) -> Vec<String> {
    self
      .locks
      .lock()
      .get(lock_key)
      .map(Semaphore::current_holders)
      .unwrap_or_default()
  }

  /// Waiters of a lock in acquisition order.
  pub fn queue(&self, lock_key: &str) -> Vec<String> {
    self
      .locks
      .lock()
      .get(lock_key)
      .map(|s| s.queued().into_iter().map(str::to_string).collect())
      .unwrap_or_default()
  }
}

fn upgraded_holder_key(wf: &Workflow, lock: &str, holder: &str, workflow_level: &HashSet<String>) -> String {
  if holder.contains('/') {
    return holder.to_string();
  }
  if holder == wf.name() || workflow_level.contains(lock) {
    holder_key(wf.namespace(), wf.name(), None)
  } else {
    holder_key(wf.namespace(), wf.name(), Some(holder))
  }
}
