use std::cmp::Reverse;
use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};

use crate::lock_key::workflow_key;

/// Queue position: higher priority first, then older, then by holder key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueEntry {
  priority: Reverse<i32>,
  created: DateTime<Utc>,
  holder: String,
}

/// A counting lock with a priority wait queue. A mutex is a semaphore with
/// limit one.
#[derive(Debug, Clone)]
pub struct Semaphore {
  name: String,
  limit: usize,
  holders: HashSet<String>,
  queue: BTreeSet<QueueEntry>,
}

impl Semaphore {
  pub fn new(name: impl Into<String>, limit: usize) -> Self {
    Self {
      name: name.into(),
      limit,
      holders: HashSet::new(),
      queue: BTreeSet::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn limit(&self) -> usize {
    self.limit
  }

  /// Free slots. Zero while oversubscribed after a downward resize.
  pub fn available(&self) -> usize {
    self.limit.saturating_sub(self.holders.len())
  }

  pub fn holds(&self, holder: &str) -> bool {
    self.holders.contains(holder)
  }

  /// Current holders, sorted.
  pub fn current_holders(&self) -> Vec<String> {
    let mut holders: Vec<String> = self.holders.iter().cloned().collect();
    holders.sort();
    holders
  }

  pub fn is_queued(&self, holder: &str) -> bool {
    self.queue.iter().any(|e| e.holder == holder)
  }

  pub fn queue_head(&self) -> Option<&str> {
    self.queue.first().map(|e| e.holder.as_str())
  }

  pub fn queued(&self) -> Vec<&str> {
    self.queue.iter().map(|e| e.holder.as_str()).collect()
  }

  /// Add to the wait queue. Holders and already-queued keys are left alone.
  pub fn enqueue(&mut self, holder: &str, priority: i32, created: DateTime<Utc>) {
    if self.holds(holder) || self.is_queued(holder) {
      return;
    }
    self.queue.insert(QueueEntry {
      priority: Reverse(priority),
      created,
      holder: holder.to_string(),
    });
  }

  pub fn dequeue(&mut self, holder: &str) -> bool {
    let before = self.queue.len();
    self.queue.retain(|e| e.holder != holder);
    self.queue.len() != before
  }

  /// Whether `holder` would get the lock right now: it already holds it, or
  /// it is at the head of the queue and a slot is free.
  pub fn can_acquire(&self, holder: &str) -> bool {
    self.holds(holder) || (self.queue_head() == Some(holder) && self.available() > 0)
  }

  /// Take a slot for `holder` when [`Self::can_acquire`] allows it.
  pub fn acquire(&mut self, holder: &str) -> bool {
    if self.holds(holder) {
      return true;
    }
    if !self.can_acquire(holder) {
      return false;
    }
    self.dequeue(holder);
    self.holders.insert(holder.to_string());
    true
  }

  /// Record a holder without consulting the queue or limit. Used when
  /// replaying persisted status.
  pub fn restore_holder(&mut self, holder: &str) {
    self.dequeue(holder);
    self.holders.insert(holder.to_string());
  }

  /// Drop `holder`. Returns the workflow key of the next waiter to wake, if
  /// a slot is now free.
  pub fn release(&mut self, holder: &str) -> Option<String> {
    if !self.holders.remove(holder) {
      return None;
    }
    self.next_to_notify()
  }

  /// Workflow key of the queue head when a slot is free for it.
  pub fn next_to_notify(&self) -> Option<String> {
    if self.available() == 0 {
      return None;
    }
    self.queue_head().map(|h| workflow_key(h).to_string())
  }

  /// Change the limit. Growing returns the workflow keys of as many waiters
  /// as slots were added; shrinking never evicts holders.
  pub fn resize(&mut self, limit: usize) -> Vec<String> {
    let before = self.available();
    self.limit = limit;
    let added = self.available().saturating_sub(before);
    let mut notify: Vec<String> = Vec::new();
    for holder in self.queue.iter().map(|e| e.holder.as_str()) {
      if notify.len() == added {
        break;
      }
      let key = workflow_key(holder).to_string();
      if !notify.contains(&key) {
        notify.push(key);
      }
    }
    notify
  }

  /// Remove every holder and waiter whose holder key matches. Returns the
  /// waiters to wake for the freed slots.
  pub fn evict<F>(&mut self, mut matches: F) -> Vec<String>
  where
    F: FnMut(&str) -> bool,
  {
    let before = self.available();
    self.holders.retain(|h| !matches(h.as_str()));
    self.queue.retain(|e| !matches(e.holder.as_str()));
    let freed = self.available().saturating_sub(before);
    self
      .queue
      .iter()
      .take(freed)
      .map(|e| workflow_key(&e.holder).to_string())
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn t(secs: i64) -> DateTime<Utc> {
    DateTime::UNIX_EPOCH + Duration::seconds(secs)
  }

  #[test]
  fn test_priority_then_age_order() {
    let mut sem = Semaphore::new("ns/Mutex/m", 1);
    sem.enqueue("ns/old", 0, t(0));
    sem.enqueue("ns/new", 0, t(1));
    sem.enqueue("ns/urgent", 5, t(2));
    assert_eq!(sem.queued(), vec!["ns/urgent", "ns/old", "ns/new"]);
  }

  #[test]
  fn test_only_head_acquires() {
    let mut sem = Semaphore::new("s", 2);
    sem.enqueue("ns/a", 0, t(0));
    sem.enqueue("ns/b", 0, t(1));
    assert!(!sem.acquire("ns/b"));
    assert!(sem.acquire("ns/a"));
    assert!(sem.acquire("ns/b"));
    assert_eq!(sem.available(), 0);
  }

  #[test]
  fn test_reenqueue_is_noop() {
    let mut sem = Semaphore::new("s", 1);
    sem.enqueue("ns/a", 0, t(0));
    sem.enqueue("ns/a", 10, t(5));
    assert_eq!(sem.queued(), vec!["ns/a"]);
  }

  #[test]
  fn test_release_notifies_head_workflow() {
    let mut sem = Semaphore::new("s", 1);
    sem.enqueue("ns/a", 0, t(0));
    assert!(sem.acquire("ns/a"));
    sem.enqueue("ns/b/node-1", 0, t(1));
    assert_eq!(sem.release("ns/a"), Some("ns/b".to_string()));
    assert_eq!(sem.release("ns/a"), None);
  }

  #[test]
  fn test_shrink_drains_without_notify() {
    let mut sem = Semaphore::new("s", 3);
    for (i, h) in ["ns/a", "ns/b", "ns/c"].iter().enumerate() {
      sem.enqueue(h, 0, t(i as i64));
      assert!(sem.acquire(h));
    }
    sem.enqueue("ns/d", 0, t(9));
    assert!(sem.resize(1).is_empty());
    assert_eq!(sem.release("ns/a"), None);
    assert_eq!(sem.release("ns/b"), None);
    assert!(!sem.can_acquire("ns/d"));
    assert_eq!(sem.release("ns/c"), Some("ns/d".to_string()));
  }

  #[test]
  fn test_grow_notifies_per_added_slot() {
    let mut sem = Semaphore::new("s", 1);
    sem.enqueue("ns/a", 0, t(0));
    assert!(sem.acquire("ns/a"));
    sem.enqueue("ns/b", 0, t(1));
    sem.enqueue("ns/c", 0, t(2));
    sem.enqueue("ns/d", 0, t(3));
    assert_eq!(sem.resize(3), vec!["ns/b".to_string(), "ns/c".to_string()]);
  }
}
