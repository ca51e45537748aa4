//! A keyed work queue that hands each key to at most one worker at a time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Per-key exponential backoff: `base * 2^failures`, capped.
#[derive(Debug)]
pub struct RateLimiter {
  base: Duration,
  cap: Duration,
  failures: Mutex<HashMap<String, u32>>,
}

impl Default for RateLimiter {
  fn default() -> Self {
    Self::new(Duration::from_millis(5), Duration::from_secs(1000))
  }
}

impl RateLimiter {
  pub fn new(base: Duration, cap: Duration) -> Self {
    Self {
      base,
      cap,
      failures: Mutex::new(HashMap::new()),
    }
  }

  /// Delay before the next retry of `key`, counting this failure.
  pub fn when(&self, key: &str) -> Duration {
    let mut failures = self.failures.lock();
    let count = failures.entry(key.to_string()).or_insert(0);
    let exponent = *count;
    *count = count.saturating_add(1);
    2u32
      .checked_pow(exponent)
      .and_then(|factor| self.base.checked_mul(factor))
      .map_or(self.cap, |delay| delay.min(self.cap))
  }

  pub fn retries(&self, key: &str) -> u32 {
    self.failures.lock().get(key).copied().unwrap_or(0)
  }

  /// Reset the backoff for `key`.
  pub fn forget(&self, key: &str) {
    self.failures.lock().remove(key);
  }
}

#[derive(Debug, Default)]
struct State {
  queue: VecDeque<String>,
  /// Keys waiting to be processed, queued or not.
  dirty: HashSet<String>,
  /// Keys a worker currently holds.
  processing: HashSet<String>,
  shutting_down: bool,
}

/// Coalescing queue of workflow keys.
///
/// A key added several times before a worker picks it up is processed once.
/// A key added while a worker holds it is queued again when that worker
/// calls [`WorkQueue::done`], so the same key never runs twice at once.
#[derive(Debug, Default)]
pub struct WorkQueue {
  state: Mutex<State>,
  notify: Notify,
  limiter: RateLimiter,
}

impl WorkQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_rate_limiter(limiter: RateLimiter) -> Self {
    Self {
      limiter,
      ..Self::default()
    }
  }

  pub fn add(&self, key: impl Into<String>) {
    let key = key.into();
    {
      let mut state = self.state.lock();
      if state.shutting_down || !state.dirty.insert(key.clone()) {
        return;
      }
      if state.processing.contains(&key) {
        return;
      }
      state.queue.push_back(key);
    }
    self.notify.notify_one();
  }

  /// Add `key` once `delay` has passed.
  pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
    let key = key.into();
    if delay.is_zero() {
      self.add(key);
      return;
    }
    let queue = Arc::clone(self);
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      queue.add(key);
    });
  }

  /// Add `key` after its backoff delay. Returns the delay.
  pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) -> Duration {
    let key = key.into();
    let delay = self.limiter.when(&key);
    self.add_after(key, delay);
    delay
  }

  /// Clear the backoff for `key` after a successful run.
  pub fn forget(&self, key: &str) {
    self.limiter.forget(key);
  }

  pub fn retries(&self, key: &str) -> u32 {
    self.limiter.retries(key)
  }

  /// Wait for the next key. `None` once the queue is shut down and drained.
  pub async fn get(&self) -> Option<String> {
    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();
      {
        let mut state = self.state.lock();
        if let Some(key) = state.queue.pop_front() {
          state.dirty.remove(&key);
          state.processing.insert(key.clone());
          return Some(key);
        }
        if state.shutting_down {
          return None;
        }
      }
      notified.await;
    }
  }

  /// Release `key`, queueing it again if it was added meanwhile.
  pub fn done(&self, key: &str) {
    let requeued = {
      let mut state = self.state.lock();
      state.processing.remove(key);
      if state.dirty.contains(key) {
        state.queue.push_back(key.to_string());
        true
      } else {
        false
      }
    };
    if requeued {
      self.notify.notify_one();
    }
  }

  pub fn len(&self) -> usize {
    self.state.lock().queue.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Stop accepting keys and wake every waiting worker.
  pub fn shut_down(&self) {
    self.state.lock().shutting_down = true;
    self.notify.notify_waiters();
  }

  pub fn is_shutting_down(&self) -> bool {
    self.state.lock().shutting_down
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_duplicate_adds_coalesce() {
    let queue = WorkQueue::new();
    queue.add("argo/a");
    queue.add("argo/b");
    queue.add("argo/a");
    assert_eq!(queue.len(), 2);
    assert_eq!(queue.get().await.as_deref(), Some("argo/a"));
    assert_eq!(queue.get().await.as_deref(), Some("argo/b"));
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_key_added_while_processing_is_requeued_on_done() {
    let queue = WorkQueue::new();
    queue.add("argo/a");
    let key = queue.get().await.unwrap();
    queue.add("argo/a");
    assert!(queue.is_empty(), "a held key must not be handed out again");
    queue.done(&key);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.get().await.as_deref(), Some("argo/a"));
    queue.done("argo/a");
    assert!(queue.is_empty());
  }

  #[tokio::test]
  async fn test_shutdown_wakes_waiting_workers() {
    let queue = Arc::new(WorkQueue::new());
    let waiter = {
      let queue = queue.clone();
      tokio::spawn(async move { queue.get().await })
    };
    tokio::task::yield_now().await;
    queue.shut_down();
    assert_eq!(waiter.await.unwrap(), None);
    queue.add("argo/late");
    assert!(queue.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_add_after_delays_the_key() {
    let queue = Arc::new(WorkQueue::new());
    queue.add_after("argo/a", Duration::from_secs(2));
    tokio::task::yield_now().await;
    assert!(queue.is_empty());
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(queue.len(), 1);
  }

  #[test]
  fn test_rate_limiter_doubles_and_caps() {
    let limiter = RateLimiter::default();
    assert_eq!(limiter.when("k"), Duration::from_millis(5));
    assert_eq!(limiter.when("k"), Duration::from_millis(10));
    assert_eq!(limiter.when("k"), Duration::from_millis(20));
    assert_eq!(limiter.retries("k"), 3);
    for _ in 0..40 {
      limiter.when("k");
    }
    assert_eq!(limiter.when("k"), Duration::from_secs(1000));
    limiter.forget("k");
    assert_eq!(limiter.when("k"), Duration::from_millis(5));
    assert_eq!(limiter.when("other"), Duration::from_millis(5));
  }
}
