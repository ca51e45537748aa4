//! Synchronization references on workflows and templates, and the lock
//! bookkeeping mirrored into workflow status.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

/// Selects a key of a config map. The key's decimal value is a semaphore
/// limit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConfigMapKeySelector {
  pub name: String,
  pub key: String,
}

/// A semaphore whose limit is a row of the shared lock database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SyncDatabaseRef {
  pub key: String,
}

/// Exactly one of `configMapKeyRef` and `database` names the semaphore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SemaphoreRef {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub config_map_key_ref: Option<ConfigMapKeySelector>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub database: Option<SyncDatabaseRef>,
  /// Defaults to the workflow's namespace.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub namespace: Option<String>,
}

impl SemaphoreRef {
  pub fn config_map(name: impl Into<String>, key: impl Into<String>) -> Self {
    Self {
      config_map_key_ref: Some(ConfigMapKeySelector {
        name: name.into(),
        key: key.into(),
      }),
      ..Default::default()
    }
  }

  pub fn database(key: impl Into<String>) -> Self {
    Self {
      database: Some(SyncDatabaseRef { key: key.into() }),
      ..Default::default()
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MutexRef {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub namespace: Option<String>,
  /// Held through the shared lock database instead of this controller.
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub database: bool,
}

impl MutexRef {
  pub fn named(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      ..Default::default()
    }
  }
}

/// Locks a workflow or template must hold before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Synchronization {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub semaphore: Option<SemaphoreRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub mutex: Option<MutexRef>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub semaphores: Vec<SemaphoreRef>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub mutexes: Vec<MutexRef>,
}

impl Synchronization {
  /// All semaphore references. Setting both `semaphore` and `semaphores` is
  /// an invariant violation.
  pub fn all_semaphores(&self) -> Result<Vec<&SemaphoreRef>, WorkflowError> {
    match (&self.semaphore, self.semaphores.is_empty()) {
      (Some(_), false) => Err(WorkflowError::Internal {
        message: "only one of semaphore and semaphores may be set".to_string(),
      }),
      (Some(s), true) => Ok(vec![s]),
      (None, _) => Ok(self.semaphores.iter().collect()),
    }
  }

  pub fn all_mutexes(&self) -> Result<Vec<&MutexRef>, WorkflowError> {
    match (&self.mutex, self.mutexes.is_empty()) {
      (Some(_), false) => Err(WorkflowError::Internal {
        message: "only one of mutex and mutexes may be set".to_string(),
      }),
      (Some(m), true) => Ok(vec![m]),
      (None, _) => Ok(self.mutexes.iter().collect()),
    }
  }

  /// Singular and plural forms are exclusive, and every semaphore names
  /// exactly one limit source.
  pub fn validate(&self) -> Result<(), WorkflowError> {
    for semaphore in self.all_semaphores()? {
      if semaphore.config_map_key_ref.is_some() == semaphore.database.is_some() {
        return Err(WorkflowError::Validation {
          message: "a semaphore needs exactly one of configMapKeyRef and database".to_string(),
        });
      }
    }
    self.all_mutexes()?;
    Ok(())
  }

  pub fn is_empty(&self) -> bool {
    self.semaphore.is_none() && self.mutex.is_none() && self.semaphores.is_empty() && self.mutexes.is_empty()
  }
}

/// Lock bookkeeping persisted in workflow status so in-memory lock state can
/// be rebuilt after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SynchronizationStatus {
  /// Lock key to the holder keys of this workflow that hold it.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub holding: BTreeMap<String, Vec<String>>,
  /// Lock key to the holders currently blocking this workflow.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub waiting: BTreeMap<String, Vec<String>>,
}

impl SynchronizationStatus {
  pub fn is_empty(&self) -> bool {
    self.holding.is_empty() && self.waiting.is_empty()
  }

  /// Record that `holder_key` now holds `lock_key`. Returns whether the
  /// status changed.
  pub fn lock_acquired(&mut self, holder_key: &str, lock_key: &str) -> bool {
    let mut changed = self.waiting.remove(lock_key).is_some();
    let holders = self.holding.entry(lock_key.to_string()).or_default();
    if !holders.iter().any(|h| h == holder_key) {
      holders.push(holder_key.to_string());
      changed = true;
    }
    changed
  }

  /// Record the holders blocking `lock_key`. Returns whether the status
  /// changed.
  pub fn lock_waiting(&mut self, lock_key: &str, current_holders: &[String]) -> bool {
    let mut holders = current_holders.to_vec();
    holders.sort();
    match self.waiting.get(lock_key) {
      Some(existing) if *existing == holders => false,
      _ => {
        self.waiting.insert(lock_key.to_string(), holders);
        true
      }
    }
  }

  /// Remove `holder_key` from the holders of `lock_key`. Returns whether the
  /// status changed.
  pub fn lock_released(&mut self, holder_key: &str, lock_key: &str) -> bool {
    let Some(holders) = self.holding.get_mut(lock_key) else {
      return false;
    };
    let before = holders.len();
    holders.retain(|h| h != holder_key);
    let changed = holders.len() != before;
    if holders.is_empty() {
      self.holding.remove(lock_key);
    }
    changed
  }

  pub fn clear_waiting(&mut self, lock_key: &str) -> bool {
    self.waiting.remove(lock_key).is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_singular_and_plural_is_internal_error() {
    let sync = Synchronization {
      mutex: Some(MutexRef::named("a")),
      mutexes: vec![MutexRef::named("b")],
      ..Default::default()
    };
    assert!(matches!(sync.all_mutexes(), Err(WorkflowError::Internal { .. })));
    assert!(sync.all_semaphores().unwrap().is_empty());
  }

  #[test]
  fn test_database_refs_parse() {
    let sync: Synchronization = serde_json::from_value(serde_json::json!({
      "semaphores": [{ "database": { "key": "gpu" } }, { "configMapKeyRef": { "name": "limits", "key": "cpu" } }],
      "mutex": { "name": "deploy", "database": true },
    }))
    .unwrap();
    let semaphores = sync.all_semaphores().unwrap();
    assert_eq!(*semaphores[0], SemaphoreRef::database("gpu"));
    assert_eq!(*semaphores[1], SemaphoreRef::config_map("limits", "cpu"));
    assert!(sync.all_mutexes().unwrap()[0].database);
    assert!(sync.validate().is_ok());

    let neither = Synchronization {
      semaphore: Some(SemaphoreRef::default()),
      ..Default::default()
    };
    assert!(matches!(neither.validate(), Err(WorkflowError::Validation { .. })));
  }

  #[test]
  fn test_status_mirroring_reports_changes() {
    let mut status = SynchronizationStatus::default();
    let lock = "default/Mutex/m";

    assert!(status.lock_waiting(lock, &["default/w0".to_string()]));
    assert!(!status.lock_waiting(lock, &["default/w0".to_string()]));

    assert!(status.lock_acquired("default/w1", lock));
    assert!(status.waiting.is_empty());
    assert!(!status.lock_acquired("default/w1", lock));

    assert!(status.lock_released("default/w1", lock));
    assert!(!status.lock_released("default/w1", lock));
    assert!(status.is_empty());
  }
}
