use thiserror::Error;

/// Errors raised by the data model: validation, malformed values and
/// operations a variant cannot support.
#[derive(Debug, Error)]
pub enum WorkflowError {
  #[error("template not found: {0}")]
  TemplateNotFound(String),

  #[error("invalid workflow: {message}")]
  Validation { message: String },

  #[error("dependency cycle detected in dag template '{template}'")]
  CycleDetected { template: String },

  #[error("task '{task}' in template '{template}' depends on unknown task '{dependency}'")]
  UnknownDependency {
    template: String,
    task: String,
    dependency: String,
  },

  #[error("key unsupported for {artifact_type} artifacts")]
  KeyUnsupported { artifact_type: &'static str },

  #[error("invalid url '{url}': {message}")]
  InvalidUrl { url: String, message: String },

  #[error("invalid duration '{value}': {message}")]
  InvalidDuration { value: String, message: String },

  #[error("invalid progress '{0}'")]
  InvalidProgress(String),

  #[error("invalid sequence: {message}")]
  InvalidSequence { message: String },

  #[error("internal invariant violated: {message}")]
  Internal { message: String },

  #[error("malformed workflow: {0}")]
  Malformed(#[from] serde_json::Error),
}

impl WorkflowError {
  /// Errors that fail a workflow outright rather than being retried.
  pub fn is_fatal(&self) -> bool {
    !matches!(self, WorkflowError::Internal { .. })
  }

  pub(crate) fn validation(message: impl Into<String>) -> Self {
    Self::Validation {
      message: message.into(),
    }
  }
}
