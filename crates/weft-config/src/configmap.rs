use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use weft_workflow::ObjectMeta;

use crate::error::ConfigError;

/// Annotation naming the default entry of an artifact-repositories config map.
pub const DEFAULT_REPOSITORY_ANNOTATION: &str = "weft.dev/default-artifact-repository";

/// Named string data, the source of semaphore limits and artifact
/// repositories.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigMap {
  #[serde(default)]
  pub metadata: ObjectMeta,
  #[serde(default)]
  pub data: BTreeMap<String, String>,
}

impl ConfigMap {
  pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
    Self {
      metadata: ObjectMeta::new(namespace, name),
      data: BTreeMap::new(),
    }
  }

  pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.data.insert(key.into(), value.into());
    self
  }

  pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.metadata.annotations.insert(key.into(), value.into());
    self
  }
}

/// Read access to config maps.
#[async_trait]
pub trait ConfigMapStore: Send + Sync {
  async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, ConfigError>;

  /// Value of `key`, failing when the map or the key is missing.
  async fn get_value(&self, namespace: &str, name: &str, key: &str) -> Result<String, ConfigError> {
    let map = self
      .get(namespace, name)
      .await?
      .ok_or_else(|| ConfigError::ConfigMapNotFound {
        namespace: namespace.to_string(),
        name: name.to_string(),
      })?;
    map.data.get(key).cloned().ok_or_else(|| ConfigError::KeyNotFound {
      namespace: namespace.to_string(),
      name: name.to_string(),
      key: key.to_string(),
    })
  }
}

/// Config maps held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryConfigMaps {
  maps: RwLock<HashMap<(String, String), ConfigMap>>,
}

impl InMemoryConfigMaps {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn upsert(&self, map: ConfigMap) {
    let key = (map.metadata.namespace.clone(), map.metadata.name.clone());
    self.maps.write().insert(key, map);
  }

  /// Set a single entry, creating the map if needed.
  pub fn set(&self, namespace: &str, name: &str, key: &str, value: &str) {
    let mut maps = self.maps.write();
    maps
      .entry((namespace.to_string(), name.to_string()))
      .or_insert_with(|| ConfigMap::new(namespace, name))
      .data
      .insert(key.to_string(), value.to_string());
  }

  pub fn remove(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
    self
      .maps
      .write()
      .remove(&(namespace.to_string(), name.to_string()))
  }
}

#[async_trait]
impl ConfigMapStore for InMemoryConfigMaps {
  async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, ConfigError> {
    Ok(
      self
        .maps
        .read()
        .get(&(namespace.to_string(), name.to_string()))
        .cloned(),
    )
  }
}
