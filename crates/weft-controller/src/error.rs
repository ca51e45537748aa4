use thiserror::Error;
use weft_operator::OperatorError;

/// Errors raised by the controller and its in-memory cluster.
#[derive(Debug, Error)]
pub enum ControllerError {
  #[error(transparent)]
  Operator(#[from] OperatorError),

  #[error("workflow '{key}' not found")]
  WorkflowNotFound { key: String },

  #[error("workflow '{key}' already exists")]
  AlreadyExists { key: String },

  /// The stored object moved on since it was read.
  #[error("conflict writing '{key}': expected version {expected}, found {actual}")]
  Conflict {
    key: String,
    expected: String,
    actual: String,
  },

  #[error("work queue is shut down")]
  ShutDown,
}

impl ControllerError {
  /// Whether the work item should be retried with backoff.
  pub fn is_transient(&self) -> bool {
    match self {
      ControllerError::Operator(e) => e.is_transient(),
      ControllerError::Conflict { .. } => true,
      _ => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_transient_classification() {
    let conflict = ControllerError::Conflict {
      key: "argo/wf".into(),
      expected: "3".into(),
      actual: "4".into(),
    };
    assert!(conflict.is_transient());
    assert!(ControllerError::Operator(OperatorError::cluster("list_pods", "refused")).is_transient());
    assert!(!ControllerError::WorkflowNotFound { key: "argo/wf".into() }.is_transient());
  }
}
