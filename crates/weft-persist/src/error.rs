#[derive(Debug, thiserror::Error)]
pub enum PersistError {
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("database operation '{operation}' exceeded its deadline")]
  DeadlineExceeded { operation: String },

  #[error("not found: {0}")]
  NotFound(String),

  #[error("node status offload is disabled")]
  OffloadDisabled,

  #[error("unsupported database url '{url}'")]
  UnsupportedDatabase { url: String },

  #[error("invalid label selector '{selector}': {message}")]
  InvalidSelector { selector: String, message: String },

  #[error("invalid timestamp '{value}' in column '{column}'")]
  InvalidTimestamp { column: String, value: String },

  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("failed to apply schema change {version}: {source}")]
  Migration { version: usize, source: sqlx::Error },

  #[error("failed to encode or decode stored json: {0}")]
  Json(#[from] serde_json::Error),
}

impl PersistError {
  /// Whether retrying the same operation later may succeed.
  pub fn is_transient(&self) -> bool {
    match self {
      PersistError::DeadlineExceeded { .. } => true,
      PersistError::Database(e) | PersistError::Migration { source: e, .. } => is_network_error(e),
      _ => false,
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, PersistError::NotFound(_))
  }
}

/// Errors a fresh connection may cure.
pub(crate) fn is_network_error(e: &sqlx::Error) -> bool {
  matches!(
    e,
    sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::WorkerCrashed | sqlx::Error::Tls(_)
  )
}
