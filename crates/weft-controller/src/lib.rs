//! Weft controller
//!
//! Drives the operator for every workflow in the cluster:
//!
//! ```text
//! pod change / lock release / submit / requeue
//!                    │
//!                    ▼
//!     ┌──────────────────────────────┐
//!     │ WorkQueue                    │  one key at a time,
//!     │ (coalescing, rate-limited)   │  backoff on transient errors
//!     └──────────────────────────────┘
//!                    │  workflowWorkers
//!                    ▼
//!     ┌──────────────────────────────┐
//!     │ Operator::operate            │  new status + requeue hint
//!     └──────────────────────────────┘
//!                    │
//!                    ▼
//!          WorkflowStore::update (optimistic)
//! ```
//!
//! The cluster is in-process: [`InMemoryCluster`] holds workflows, pods and
//! config maps, and [`PodRunner`] plays pods through a [`PodScript`].

mod cluster;
mod controller;
mod error;
mod events;
mod queue;
mod simulate;

pub use cluster::{InMemoryCluster, PodEventHandler, PodStore, WorkflowStore};
pub use controller::{Controller, LABEL_INSTANCE_ID};
pub use error::ControllerError;
pub use events::{ChannelNotifier, ControllerEvent, ControllerNotifier, NoopNotifier};
pub use queue::{RateLimiter, WorkQueue};
pub use simulate::{PodOutcome, PodRunner, PodScript};
