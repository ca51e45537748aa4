//! Weft Sync
//!
//! Semaphores and mutexes shared across workflows. A workflow or one of its
//! nodes asks for every lock named in a `synchronization` block; it either
//! takes them all or queues on each one, ordered by workflow priority and
//! then creation time. Semaphore limits come from config maps and are re-read
//! on each attempt.
//!
//! ```text
//!   try_acquire ──▶ fetch limits ──▶ [lock table] ──▶ acquired / waiting
//!                                          │
//!   release ───────────────────────────────┴──▶ ReleaseNotifier(ns/wf)
//! ```
//!
//! Holders are tracked by key: `ns/wf` for workflow-level locks and
//! `ns/wf/node-id` for template-level ones. The workflow's status mirrors what
//! it holds so the table can be rebuilt after a restart.
//!
//! Locks marked `database` live in a [`SemaphoreStore`] instead, so
//! controllers sharing the store also share the lock. Each controller tags
//! its rows with its name and heartbeats; waiters of silent controllers are
//! skipped when ordering the queue.

mod error;
mod lock_key;
mod manager;
mod notifier;
mod semaphore;
mod store;

pub use error::SyncError;
pub use lock_key::{LockKey, LockKind, MUTEX_PREFIX, SEMAPHORE_PREFIX, holder_key, workflow_key};
pub use manager::{AcquireOutcome, SyncManager};
pub use notifier::{ChannelReleaseNotifier, NoopReleaseNotifier, ReleaseNotifier};
pub use semaphore::Semaphore;
pub use store::{
  DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_INACTIVE_CONTROLLER_TIMEOUT, DEFAULT_POLL_INTERVAL, InMemorySemaphoreStore,
  QueuedHolder, SemaphoreStore, StoreLockState, limit_name,
};
