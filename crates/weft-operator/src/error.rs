//! Error types for workflow reconciliation.

use thiserror::Error;
use weft_artifact::ArtifactError;
use weft_persist::PersistError;
use weft_resolver::ResolveError;
use weft_sync::SyncError;
use weft_workflow::WorkflowError;

/// Errors that can occur while reconciling a workflow.
///
/// Transient errors abort the reconcile and are retried by the driver.
/// Everything else is written onto the workflow or the node it concerns.
#[derive(Debug, Error)]
pub enum OperatorError {
  #[error(transparent)]
  Workflow(#[from] WorkflowError),

  #[error(transparent)]
  Resolve(#[from] ResolveError),

  #[error(transparent)]
  Artifact(#[from] ArtifactError),

  #[error(transparent)]
  Sync(#[from] SyncError),

  #[error(transparent)]
  Persistence(#[from] PersistError),

  /// The pod scheduler could not be reached or refused a request.
  #[error("cluster request '{operation}' failed: {message}")]
  Cluster { operation: String, message: String },

  /// Optimistic-concurrency failure writing an object.
  #[error("conflict writing '{key}': the object has been modified")]
  Conflict { key: String },

  #[error("{kind} '{name}' not found")]
  NotFound { kind: &'static str, name: String },

  #[error("{message}")]
  Validation { message: String },

  /// A parallelism cap stops new nodes from starting this round.
  #[error("parallelism limit reached")]
  ParallelismReached,

  #[error("internal error: {message}")]
  Internal { message: String },

  #[error("failed to encode or decode workflow json: {0}")]
  Json(#[from] serde_json::Error),
}

impl OperatorError {
  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation {
      message: message.into(),
    }
  }

  pub fn cluster(operation: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Cluster {
      operation: operation.into(),
      message: message.into(),
    }
  }

  /// Whether the reconcile should be retried with the workflow unchanged.
  pub fn is_transient(&self) -> bool {
    match self {
      OperatorError::Cluster { .. } | OperatorError::Conflict { .. } => true,
      OperatorError::Persistence(e) => e.is_transient(),
      OperatorError::Resolve(e) => e.is_transient(),
      OperatorError::Sync(e) => e.is_transient(),
      _ => false,
    }
  }

  /// Errors that belong on the node being executed rather than aborting
  /// the reconcile.
  pub(crate) fn is_node_failure(&self) -> bool {
    !self.is_transient()
      && !matches!(
        self,
        OperatorError::ParallelismReached | OperatorError::Internal { .. } | OperatorError::Conflict { .. }
      )
  }
}
