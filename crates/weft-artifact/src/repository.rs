use weft_config::{ConfigMapStore, DEFAULT_REPOSITORY_ANNOTATION};
use weft_workflow::{ArtifactRepository, ArtifactRepositoryRef};

use crate::error::ArtifactError;

/// Find the repository a workflow writes to.
///
/// With no reference the controller default applies. A reference names a
/// config map (default `artifact-repositories`) and a key; a missing key
/// falls back to the entry the config map's annotation marks as default.
pub async fn resolve_repository(
  config_maps: &dyn ConfigMapStore,
  namespace: &str,
  repository_ref: Option<&ArtifactRepositoryRef>,
  default: Option<&ArtifactRepository>,
) -> Result<Option<ArtifactRepository>, ArtifactError> {
  let Some(repository_ref) = repository_ref else {
    return Ok(default.cloned());
  };

  let config_map_name = repository_ref.config_map_or_default();
  let Some(config_map) = config_maps.get(namespace, config_map_name).await? else {
    tracing::debug!(namespace, config_map = config_map_name, "artifact_repositories_missing");
    return Ok(default.cloned());
  };

  let key = match repository_ref.key.as_deref() {
    Some(key) if !key.is_empty() => key.to_string(),
    _ => config_map
      .metadata
      .annotations
      .get(DEFAULT_REPOSITORY_ANNOTATION)
      .cloned()
      .ok_or_else(|| ArtifactError::NoDefaultRepository {
        namespace: namespace.to_string(),
        config_map: config_map_name.to_string(),
      })?,
  };

  let raw = config_map
    .data
    .get(&key)
    .ok_or_else(|| ArtifactError::RepositoryNotFound {
      namespace: namespace.to_string(),
      config_map: config_map_name.to_string(),
      key: key.clone(),
    })?;

  let repository = serde_yaml::from_str(raw).map_err(|source| ArtifactError::InvalidRepository {
    namespace: namespace.to_string(),
    config_map: config_map_name.to_string(),
    key: key.clone(),
    source,
  })?;
  Ok(Some(repository))
}
