//! Controller events and notifiers.
//!
//! Events are emitted as workflows move through the controller so callers
//! can follow progress, wait for completion, or record history.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use weft_workflow::{NodePhase, WorkflowPhase};

/// Events emitted by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControllerEvent {
  /// A workflow was submitted to the cluster.
  WorkflowSubmitted { key: String },

  /// A reconcile finished and the result was written back.
  WorkflowUpdated { key: String, phase: WorkflowPhase },

  /// A node started running or finished. Only sent when node events are
  /// enabled in the configuration.
  NodePhaseChanged {
    key: String,
    node: String,
    phase: NodePhase,
    message: String,
  },

  /// The workflow reached a terminal phase.
  WorkflowCompleted {
    key: String,
    phase: WorkflowPhase,
    message: String,
  },

  /// A finished workflow outlived its TTL and was deleted with its pods.
  WorkflowDeleted { key: String },

  /// A reconcile failed. `retry_in_ms` is unset when it will not be retried.
  ReconcileFailed {
    key: String,
    error: String,
    retry_in_ms: Option<u64>,
  },
}

/// Receives controller events.
pub trait ControllerNotifier: Send + Sync {
  fn notify(&self, event: ControllerEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ControllerNotifier for NoopNotifier {
  fn notify(&self, _event: ControllerEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  // Unbounded so a slow consumer never stalls a worker.
  sender: mpsc::UnboundedSender<ControllerEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ControllerEvent>) -> Self {
    Self { sender }
  }
}

impl ControllerNotifier for ChannelNotifier {
  fn notify(&self, event: ControllerEvent) {
    // The receiver may have gone away.
    let _ = self.sender.send(event);
  }
}
