use weft_config::ConfigError;
use weft_workflow::WorkflowError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  #[error("failed to read semaphore limit for '{lock}': {source}")]
  LimitLookup { lock: String, source: ConfigError },

  #[error("semaphore '{lock}' has invalid limit '{value}'")]
  InvalidLimit { lock: String, value: String },

  #[error("invalid lock key '{0}'")]
  InvalidLockKey(String),

  #[error("lock '{0}' is kept in the lock database, which is not configured")]
  NoStore(String),

  /// The lock database could not be read or written.
  #[error("lock store operation '{operation}' failed: {message}")]
  Store {
    operation: String,
    message: String,
    transient: bool,
  },

  #[error(transparent)]
  Workflow(#[from] WorkflowError),
}

impl SyncError {
  pub fn store(operation: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
    Self::Store {
      operation: operation.into(),
      message: message.into(),
      transient,
    }
  }

  /// Whether the same request may succeed later.
  pub fn is_transient(&self) -> bool {
    matches!(self, SyncError::Store { transient: true, .. })
  }
}
