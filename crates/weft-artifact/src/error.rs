use weft_config::ConfigError;
use weft_workflow::WorkflowError;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
  #[error(transparent)]
  Location(#[from] WorkflowError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("artifact credential '{name}' not found")]
  CredentialNotFound { name: String },

  #[error("artifact repository '{key}' not found in config map '{namespace}/{config_map}'")]
  RepositoryNotFound {
    namespace: String,
    config_map: String,
    key: String,
  },

  #[error("config map '{namespace}/{config_map}' names no default artifact repository")]
  NoDefaultRepository { namespace: String, config_map: String },

  #[error("artifact repository '{key}' in '{namespace}/{config_map}' is invalid: {source}")]
  InvalidRepository {
    namespace: String,
    config_map: String,
    key: String,
    source: serde_yaml::Error,
  },

  #[error("output artifact '{artifact}' has no location and no repository is configured")]
  NoLocation { artifact: String },
}

impl ArtifactError {
  /// Missing references, as opposed to malformed data.
  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      ArtifactError::CredentialNotFound { .. }
        | ArtifactError::RepositoryNotFound { .. }
        | ArtifactError::NoDefaultRepository { .. }
        | ArtifactError::Config(ConfigError::ConfigMapNotFound { .. })
    )
  }
}
