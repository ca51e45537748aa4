//! Wake-ups for workflows waiting on a lock.

use tokio::sync::mpsc;

/// Receives the `namespace/name` of a workflow that should be reconciled
/// because a lock it waits on has a free slot.
pub trait ReleaseNotifier: Send + Sync {
  fn notify(&self, workflow_key: &str);
}

/// Discards notifications.
#[derive(Debug, Clone, Default)]
pub struct NoopReleaseNotifier;

impl ReleaseNotifier for NoopReleaseNotifier {
  fn notify(&self, _workflow_key: &str) {}
}

/// Forwards notifications, in order, to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelReleaseNotifier {
  sender: mpsc::UnboundedSender<String>,
}

impl ChannelReleaseNotifier {
  pub fn new(sender: mpsc::UnboundedSender<String>) -> Self {
    Self { sender }
  }
}

impl ReleaseNotifier for ChannelReleaseNotifier {
  fn notify(&self, workflow_key: &str) {
    // Receiver may have been dropped during shutdown
    let _ = self.sender.send(workflow_key.to_string());
  }
}
