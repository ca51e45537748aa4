use thiserror::Error;

/// Errors that can occur while resolving a template reference.
#[derive(Debug, Error)]
pub enum ResolveError {
  /// Template name not present in the scope it was looked up in.
  #[error("template '{name}' not found in {scope}")]
  TemplateNotFound { name: String, scope: String },

  /// The referenced workflow template does not exist.
  #[error("{kind} '{name}' not found")]
  WorkflowTemplateNotFound { kind: &'static str, name: String },

  /// Neither a template name nor a template reference was given.
  #[error("no template name or reference given for '{context}'")]
  NoTemplate { context: String },

  /// The template store could not be read.
  #[error("template store error: {message}")]
  Store { message: String },
}

impl ResolveError {
  /// Store failures may clear up on a later reconcile; everything else
  /// needs the workflow or its templates to change.
  pub fn is_transient(&self) -> bool {
    matches!(self, ResolveError::Store { .. })
  }
}
